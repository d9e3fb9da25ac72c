//! Producer thread -> shared memory ring -> session driver -> FITS file,
//! the whole chain as the daemon runs it.

use std::{
    ffi::CString,
    sync::{Arc, Mutex},
};

use fitsio::FitsFile;
use mwax_db2fits::{health::SharedHealth, obs::DbfitsClient, shutdown::Shutdown};
use mwax_db2fits_common::{
    client::{run_transfer, TransferOutcome},
    ring_reader::RingReader,
    ring_writer::RingWriter,
};
use tempfile::TempDir;

fn shm_cleanup(name: &str) {
    let c_name = CString::new(name).unwrap();
    unsafe {
        libc::shm_unlink(c_name.as_ptr());
    }
}

fn header_page(mode: &str, subobs_id: u64, obs_offset: i32, unixtime: u64) -> Vec<u8> {
    format!(
        "POPULATED 1\n\
         OBS_ID 1000000000\n\
         SUBOBS_ID {subobs_id}\n\
         MODE {mode}\n\
         UTC_START 2023-01-02-03:04:05\n\
         OBS_OFFSET {obs_offset}\n\
         NBIT 32\n\
         NPOL 2\n\
         NINPUTS 4\n\
         INT_TIME_MSEC 8000\n\
         TRANSFER_SIZE 240\n\
         PROJ_ID T0001\n\
         EXPOSURE_SECS 16\n\
         COARSE_CHANNEL 1\n\
         CORR_COARSE_CHANNEL 1\n\
         SECS_PER_SUBOBS 8\n\
         UNIXTIME {unixtime}\n\
         UNIXTIME_MSEC 0\n\
         FINE_CHAN_WIDTH_HZ 1\n\
         NFINE_CHAN 2\n\
         BANDWIDTH_HZ 2\n\
         FSCRUNCH_FACTOR 1\n\
         MC_IP 239.0.0.1\n\
         MC_PORT 1234\n"
    )
    .into_bytes()
}

fn block_payload(vis_start: f32) -> Vec<u8> {
    let mut out = Vec::new();
    for n in 0..48 {
        out.extend_from_slice(&(vis_start + n as f32).to_le_bytes());
    }
    for n in 0..12 {
        out.extend_from_slice(&(100.0 + n as f32).to_le_bytes());
    }
    out
}

#[test]
fn two_subobs_and_a_quit_flow_through_the_ring() {
    let ring_name = "mwax_db2fits_pipeline_e2e";
    shm_cleanup(ring_name);

    let mut producer = RingWriter::create(ring_name, 4096).unwrap();
    let mut reader = RingReader::attach(ring_name).unwrap();

    let feeder = std::thread::spawn(move || {
        for (subobs, offset) in [(1_000_000_000u64, 0i32), (1_000_000_008, 8)] {
            let unixtime = 1 + u64::from(offset as u32);
            producer
                .write_subobs_header(&header_page("CORRELATOR", subobs, offset, unixtime))
                .unwrap();
            producer.write_block(&block_payload(offset as f32)).unwrap();
            producer.write_eod().unwrap();
        }
        // upstream tells us to stop
        producer
            .write_subobs_header(&header_page("QUIT", 1_000_000_016, 16, 17))
            .unwrap();
    });

    let dir = TempDir::new().unwrap();
    let health = Arc::new(Mutex::new(SharedHealth::default()));
    let shutdown = Shutdown::new(health.clone());
    let mut client = DbfitsClient::new(
        dir.path().to_path_buf(),
        0,
        "mwax-test".to_string(),
        shutdown.clone(),
        health.clone(),
    );

    let mut outcomes = Vec::new();
    loop {
        let outcome = run_transfer(&mut reader, &mut client, &mut || shutdown.is_quit())
            .expect("transfer should succeed");
        let stop = matches!(
            outcome,
            TransferOutcome::Quit | TransferOutcome::Interrupted
        );
        outcomes.push(outcome);
        if stop {
            break;
        }
    }
    client.close_current();
    feeder.join().unwrap();

    assert_eq!(
        outcomes,
        vec![
            TransferOutcome::Completed { bytes_written: 240 },
            TransferOutcome::Completed { bytes_written: 240 },
            TransferOutcome::Quit,
        ]
    );
    assert!(shutdown.is_quit());

    // both sub-observations landed in one published file
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["1000000000_20230102030405_ch001_000.fits"]);

    let mut fits = FitsFile::open(dir.path().join(&names[0])).unwrap();
    let vis_hdu = fits.hdu(3).unwrap();
    assert_eq!(vis_hdu.read_key::<i64>(&mut fits, "MARKER").unwrap(), 2);
    assert_eq!(vis_hdu.read_key::<i64>(&mut fits, "TIME").unwrap(), 9);
    let vis: Vec<f32> = vis_hdu.read_image(&mut fits).unwrap();
    assert_eq!(vis[0], 8.0);

    // two integrations fed the weight accumulators
    assert_eq!(health.lock().unwrap().weights_counter, 2);

    shm_cleanup(ring_name);
}
