use std::{net::Ipv4Addr, path::PathBuf};

/// Default cutoff before the output rolls to the next `_NNN.fits` file.
pub const DEFAULT_FILE_SIZE_LIMIT: u64 = 10 * 1024 * 1024 * 1024;

#[derive(clap::Parser, Debug)]
#[command(
    name = "mwax-db2fits",
    version,
    about = "mwax-db2fits",
    long_about = "Reads correlated visibility blocks from the MWAX ring \
                  buffer and writes them out as FITS files for the archiver, \
                  publishing multicast health datagrams while it runs."
)]
pub struct Args {
    #[arg(
        long,
        short = 'k',
        value_name = "HEX_KEY",
        value_parser = parse_hex_key,
        help = "Hexadecimal shared memory key of the input ring buffer. \
                Example value: 0x1234"
    )]
    pub key: u32,

    #[arg(
        long,
        short = 'd',
        value_name = "PATH",
        help = "Destination directory for the output FITS files"
    )]
    pub destination_path: PathBuf,

    #[arg(
        long,
        short = 'm',
        value_name = "PATH",
        help = "Directory containing the observation metafits files"
    )]
    pub metafits_path: PathBuf,

    #[arg(
        long,
        short = 'n',
        value_name = "IFACE",
        help = "Network interface to send health datagrams from, e.g. eth0"
    )]
    pub health_netiface: String,

    #[arg(
        long,
        short = 'i',
        value_name = "IPV4",
        help = "Multicast group to send health datagrams to"
    )]
    pub health_ip: Ipv4Addr,

    #[arg(
        long,
        short = 'p',
        value_name = "PORT",
        help = "UDP port to send health datagrams to"
    )]
    pub health_port: u16,

    #[arg(
        long,
        short = 'l',
        value_name = "BYTES",
        default_value_t = DEFAULT_FILE_SIZE_LIMIT,
        help = "Maximum bytes of image data per FITS file before rolling to \
                the next file. 0 disables the limit"
    )]
    pub file_size_limit: u64,
}

impl Args {
    /// Name of the shared memory region derived from the ring buffer key.
    #[must_use]
    pub fn ring_name(&self) -> String {
        format!("mwax-db2fits-{:08x}", self.key)
    }
}

fn parse_hex_key(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("not a hexadecimal key: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn base_args() -> Vec<&'static str> {
        vec![
            "mwax-db2fits",
            "--key=0x1234",
            "--destination-path=/tmp/out",
            "--metafits-path=/tmp/meta",
            "--health-netiface=lo",
            "--health-ip=239.0.0.1",
            "--health-port=7123",
        ]
    }

    #[test]
    fn parses_required_arguments() {
        let args = Args::parse_from(base_args());
        assert_eq!(args.key, 0x1234);
        assert_eq!(args.ring_name(), "mwax-db2fits-00001234");
        assert_eq!(args.file_size_limit, DEFAULT_FILE_SIZE_LIMIT);
    }

    #[test]
    fn hex_key_accepts_bare_digits() {
        let mut argv = base_args();
        argv[1] = "--key=beef";
        let args = Args::parse_from(argv);
        assert_eq!(args.key, 0xbeef);
    }

    #[test]
    fn missing_required_argument_is_an_error() {
        let argv: Vec<&str> = base_args().into_iter().filter(|a| !a.starts_with("--key")).collect();
        assert!(Args::try_parse_from(argv).is_err());
    }
}
