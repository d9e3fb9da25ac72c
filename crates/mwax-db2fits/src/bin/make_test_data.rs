//! Fill a ring buffer with synthetic correlator output so mwax-db2fits can
//! be exercised without a running correlator. Creates the shared memory
//! region, writes ramp visibilities and weights for one observation, then
//! optionally appends a QUIT sub-observation so the reader shuts itself
//! down after draining.

use clap::Parser;
use mwax_db2fits_common::{ascii_header::render, protocol::record_size, ring_writer::RingWriter};

#[derive(clap::Parser, Debug)]
#[command(
    name = "make_test_data",
    version,
    about = "Write synthetic MWAX visibility sub-observations into a ring buffer"
)]
struct Args {
    #[arg(long, short = 'k', value_name = "HEX_KEY", value_parser = parse_hex_key)]
    key: u32,

    #[arg(long, default_value_t = 1_000_000_000, value_name = "GPS_SECONDS")]
    obs_id: u64,

    #[arg(long, default_value_t = 4, value_name = "COUNT")]
    ninputs: i32,

    #[arg(long, default_value_t = 2, value_name = "COUNT")]
    nfine_chan: i32,

    #[arg(long, default_value_t = 8000, value_name = "MSEC")]
    int_time_msec: i32,

    #[arg(long, default_value_t = 2, value_name = "COUNT")]
    subobs_count: i32,

    #[arg(long, default_value_t = true, help = "Append a QUIT sub-observation at the end")]
    send_quit: bool,
}

fn parse_hex_key(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("not a hexadecimal key: {e}"))
}

const SECS_PER_SUBOBS: i32 = 8;
const NPOL: i32 = 2;

fn header_page(args: &Args, mode: &str, subobs: i32, transfer_size: u64) -> Vec<u8> {
    let obs_id = args.obs_id.to_string();
    let subobs_id = (args.obs_id + (subobs as u64) * 8).to_string();
    let obs_offset = (subobs * SECS_PER_SUBOBS).to_string();
    let exposure = (args.subobs_count * SECS_PER_SUBOBS).to_string();
    let unixtime = (1 + (subobs as u64) * 8).to_string();
    let ninputs = args.ninputs.to_string();
    let nfine = args.nfine_chan.to_string();
    let bandwidth = (args.nfine_chan * 10_000).to_string();
    let int_time = args.int_time_msec.to_string();
    let transfer = transfer_size.to_string();

    render(&[
        ("POPULATED", "1"),
        ("OBS_ID", &obs_id),
        ("SUBOBS_ID", &subobs_id),
        ("MODE", mode),
        ("UTC_START", "2023-01-02-03:04:05"),
        ("OBS_OFFSET", &obs_offset),
        ("NBIT", "32"),
        ("NPOL", "2"),
        ("NINPUTS", &ninputs),
        ("INT_TIME_MSEC", &int_time),
        ("TRANSFER_SIZE", &transfer),
        ("PROJ_ID", "T0001"),
        ("EXPOSURE_SECS", &exposure),
        ("COARSE_CHANNEL", "1"),
        ("CORR_COARSE_CHANNEL", "1"),
        ("SECS_PER_SUBOBS", "8"),
        ("UNIXTIME", &unixtime),
        ("UNIXTIME_MSEC", "0"),
        ("FINE_CHAN_WIDTH_HZ", "10000"),
        ("NFINE_CHAN", &nfine),
        ("BANDWIDTH_HZ", &bandwidth),
        ("FSCRUNCH_FACTOR", "1"),
        ("MC_IP", "239.0.0.1"),
        ("MC_PORT", "1234"),
    ])
    .into_bytes()
}

fn main() {
    let args = Args::parse();

    let nbaselines = args.ninputs * (args.ninputs + 2) / 8;
    let vis_floats = (nbaselines * args.nfine_chan * NPOL * NPOL * 2) as usize;
    let wts_floats = (nbaselines * NPOL * NPOL) as usize;
    let block_bytes = ((vis_floats + wts_floats) * 4) as u64;
    let blocks_per_subobs = SECS_PER_SUBOBS * 1000 / args.int_time_msec;
    let transfer_size = block_bytes * blocks_per_subobs as u64;

    // size the ring so the whole stream fits even with nobody draining it
    let per_subobs = record_size(4096)
        + blocks_per_subobs as u32 * record_size(block_bytes as u32)
        + record_size(0);
    let ring_len = (args.subobs_count as u32 + 2) * per_subobs;

    let name = format!("mwax-db2fits-{:08x}", args.key);
    let mut writer = match RingWriter::create(&name, ring_len) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("could not create ring buffer {name}: {e}");
            std::process::exit(1);
        }
    };
    println!("created ring buffer {name} ({ring_len} bytes)");

    let mut block = Vec::with_capacity(block_bytes as usize);
    for subobs in 0..args.subobs_count {
        writer
            .write_subobs_header(&header_page(&args, "CORRELATOR", subobs, transfer_size))
            .expect("header write failed");

        for timestep in 0..blocks_per_subobs {
            block.clear();
            let start = ((subobs * blocks_per_subobs + timestep) * 2) as f32 * 100.0;
            for n in 0..vis_floats {
                block.extend_from_slice(&(start + n as f32).to_le_bytes());
            }
            let wts_start = start + 100.0;
            for n in 0..wts_floats {
                block.extend_from_slice(&(wts_start + n as f32).to_le_bytes());
            }
            writer.write_block(&block).expect("block write failed");
        }
        writer.write_eod().expect("eod write failed");
        println!("wrote sub-observation {subobs} ({blocks_per_subobs} blocks)");
    }

    if args.send_quit {
        writer
            .write_subobs_header(&header_page(&args, "QUIT", args.subobs_count, transfer_size))
            .expect("quit header write failed");
        println!("wrote QUIT sub-observation");
    }

    println!(
        "done: {} sub-observations of {} bytes each in {name}",
        args.subobs_count, transfer_size
    );
}
