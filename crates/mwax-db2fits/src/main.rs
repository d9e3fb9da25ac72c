use std::{
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::Parser;
use mimalloc::MiMalloc;
use mwax_db2fits::{
    cli::Args,
    error::DbfitsError,
    health::{health_task, HealthConfig, HealthStatus, SharedHealth},
    obs::DbfitsClient,
    shutdown::Shutdown,
    tracing_init::init_tracing,
};
use mwax_db2fits_common::{
    client::{run_transfer, SessionError, TransferOutcome},
    ring_reader::RingReader,
};
use tracing::{debug, error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    match init_async_runtime(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_async_runtime(args: Args) -> Result<(), DbfitsError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("unable to initialize tokio runtime")
        .block_on(run(args))
}

async fn run(args: Args) -> Result<(), DbfitsError> {
    info!("starting mwax-db2fits v{}", env!("CARGO_PKG_VERSION"));
    info!("* shared memory key:  {:#x} ({})", args.key, args.ring_name());
    info!("* destination path:   {}", args.destination_path.display());
    info!("* metafits path:      {}", args.metafits_path.display());
    info!(
        "* health:             {} via {} port {}",
        args.health_ip, args.health_netiface, args.health_port
    );
    info!("* file size limit:    {} bytes", args.file_size_limit);

    for dir in [&args.destination_path, &args.metafits_path] {
        if !dir.is_dir() {
            return Err(DbfitsError::Startup(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
    }

    let hostname = hostname();
    let health = Arc::new(Mutex::new(SharedHealth::default()));
    let shutdown = Shutdown::new(health.clone());

    // resolving the health interface is part of startup validation
    let health_ip = mwax_db2fits::health::ipv4_for_interface(&args.health_netiface)?;
    info!("health interface {} has address {health_ip}", args.health_netiface);

    // Attach before spawning anything; a missing ring buffer is a startup
    // failure, not something to retry.
    let reader = RingReader::attach(&args.ring_name())?;
    info!("attached to ring buffer {}", args.ring_name());

    // nothing can trigger the quit flag yet, so this cannot clobber a
    // ShuttingDown status
    health.lock().expect("health mutex poisoned").status = HealthStatus::Running;

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        signal_shutdown.trigger();
    });

    let health_handle = tokio::spawn(health_task(
        HealthConfig {
            local_ip: health_ip,
            group: args.health_ip,
            port: args.health_port,
            hostname: hostname.clone(),
        },
        health.clone(),
        shutdown.clone(),
    ));

    let client = DbfitsClient::new(
        args.destination_path.clone(),
        args.file_size_limit,
        hostname,
        shutdown.clone(),
        health.clone(),
    );

    let writer_shutdown = shutdown.clone();
    let writer_handle =
        tokio::task::spawn_blocking(move || writer_loop(reader, client, &writer_shutdown));

    let writer_result = writer_handle
        .await
        .expect("writer thread panicked");

    // make sure the health task sees the shutdown even on a writer error
    shutdown.trigger();
    match health_handle.await.expect("health task panicked") {
        Ok(()) => {}
        Err(e) => error!("health task failed: {e}"),
    }

    info!("mwax-db2fits finished");
    writer_result
}

/// The foreground loop: one sub-observation transfer per iteration, with
/// the quit flag polled in between.
fn writer_loop(
    mut reader: RingReader,
    mut client: DbfitsClient,
    shutdown: &Shutdown,
) -> Result<(), DbfitsError> {
    let result = loop {
        if shutdown.is_quit() {
            break Ok(());
        }

        match run_transfer(&mut reader, &mut client, &mut || shutdown.is_quit()) {
            Ok(TransferOutcome::Completed { bytes_written }) => {
                debug!("transfer complete: {bytes_written} bytes");
            }
            Ok(TransferOutcome::Skimmed) => {}
            Ok(TransferOutcome::Quit | TransferOutcome::Interrupted) => break Ok(()),
            Err(e) => {
                error!("transfer failed: {e}");
                break Err(flatten_session_error(e));
            }
        }
    };

    // close whatever is open before the process goes away; the rename to
    // .fits is best-effort
    client.close_current();
    shutdown.trigger();

    result
}

fn flatten_session_error(e: SessionError<DbfitsError>) -> DbfitsError {
    match e {
        SessionError::Client(e) => e,
        SessionError::Ring(e) => DbfitsError::RingBuffer(e),
        SessionError::Protocol { expected, found } => DbfitsError::RingProtocol {
            expected: format!("{expected:?}"),
            found: format!("{found:?}"),
        },
    }
}

fn hostname() -> String {
    rustix::system::uname()
        .nodename()
        .to_string_lossy()
        .into_owned()
}
