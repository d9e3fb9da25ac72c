//! Health publishing: once a second a packed status record is multicast to
//! the monitoring and control network. The datagram carries the average
//! autocorrelation weight per tile accumulated since the previous tick, or
//! NaN when nothing arrived in between.

use std::{
    net::{Ipv4Addr, SocketAddrV4, UdpSocket},
    os::fd::AsRawFd,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytemuck::{bytes_of, Pod, Zeroable};
use tracing::{debug, info, warn};

use crate::{
    error::DbfitsError,
    shutdown::Shutdown,
    weights::NTILES_MAX,
};

const MULTICAST_TTL: u32 = 3;
const HEALTH_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HealthStatus {
    Offline = 0,
    Running = 1,
    ShuttingDown = 2,
}

/// The slice of writer state the health thread needs, behind one mutex.
/// The writer thread updates it per block; the health thread snapshots and
/// resets the weight accumulators each tick.
pub struct SharedHealth {
    pub status: HealthStatus,
    pub obs_id: u64,
    pub subobs_id: u64,
    pub ntiles: usize,
    pub weights_x: [f32; NTILES_MAX],
    pub weights_y: [f32; NTILES_MAX],
    pub weights_counter: u32,
}

impl Default for SharedHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Offline,
            obs_id: 0,
            subobs_id: 0,
            ntiles: 0,
            weights_x: [0.0; NTILES_MAX],
            weights_y: [0.0; NTILES_MAX],
            weights_counter: 0,
        }
    }
}

impl SharedHealth {
    /// Average the accumulated weights and reset the accumulators, or NaN
    /// everything when no integration arrived since the last snapshot.
    pub fn snapshot_weights(&mut self) -> ([f32; NTILES_MAX], [f32; NTILES_MAX]) {
        let mut avg_x = [f32::NAN; NTILES_MAX];
        let mut avg_y = [f32::NAN; NTILES_MAX];

        if self.weights_counter > 0 {
            let n = self.weights_counter as f32;
            for tile in 0..self.ntiles.min(NTILES_MAX) {
                avg_x[tile] = self.weights_x[tile] / n;
                avg_y[tile] = self.weights_y[tile] / n;
                self.weights_x[tile] = 0.0;
                self.weights_y[tile] = 0.0;
            }
            self.weights_counter = 0;
        }
        (avg_x, avg_y)
    }
}

/// The wire record. Field order is wire order; packed little-endian with no
/// padding, read directly by the consumers.
#[repr(C, packed)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub struct HealthPacket {
    pub version_major: i32,
    pub version_minor: i32,
    pub version_build: i32,
    pub hostname: [u8; 64],
    pub start_time: i64,
    pub health_time: i64,
    pub up_time: f64,
    pub status: i32,
    pub obs_id: i64,
    pub subobs_id: i64,
    pub weights_per_tile_x: [f32; NTILES_MAX],
    pub weights_per_tile_y: [f32; NTILES_MAX],
}

pub struct HealthConfig {
    /// Local IPv4 address of the outbound interface, resolved at startup
    /// with [`ipv4_for_interface`].
    pub local_ip: Ipv4Addr,
    pub group: Ipv4Addr,
    pub port: u16,
    pub hostname: String,
}

fn version_triple() -> (i32, i32, i32) {
    let parse = |s: &str| s.parse().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn hostname_field(hostname: &str) -> [u8; 64] {
    let mut out = [0u8; 64];
    let bytes = hostname.as_bytes();
    let n = bytes.len().min(out.len() - 1);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Find the IPv4 address bound to the named interface.
pub fn ipv4_for_interface(name: &str) -> Result<Ipv4Addr, DbfitsError> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| DbfitsError::HealthSocket(std::io::Error::from_raw_os_error(e as i32)))?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(nix::sys::socket::SockaddrStorage::as_sockaddr_in) {
            return Ok(sin.ip());
        }
    }
    Err(DbfitsError::NoInterfaceAddress(name.to_string()))
}

/// Open the outbound multicast socket: TTL 3, loopback disabled, outbound
/// interface pinned to the given local address.
pub fn open_multicast_socket(local_ip: Ipv4Addr) -> Result<UdpSocket, DbfitsError> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(DbfitsError::HealthSocket)?;
    sock.set_multicast_ttl_v4(MULTICAST_TTL)
        .map_err(DbfitsError::HealthSocket)?;
    sock.set_multicast_loop_v4(false)
        .map_err(DbfitsError::HealthSocket)?;

    // std's UdpSocket has no IP_MULTICAST_IF setter, so go through libc.
    let addr = libc::in_addr {
        s_addr: u32::from(local_ip).to_be(),
    };
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            std::ptr::addr_of!(addr).cast(),
            size_of::<libc::in_addr>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(DbfitsError::HealthSocket(std::io::Error::last_os_error()));
    }
    Ok(sock)
}

/// The background health task. Ticks once a second until shutdown, then
/// emits one final datagram with status `ShuttingDown`.
pub async fn health_task(
    config: HealthConfig,
    shared: Arc<Mutex<SharedHealth>>,
    shutdown: Shutdown,
) -> Result<(), DbfitsError> {
    info!(
        "health: multicast from {} going to {}:{}",
        config.local_ip, config.group, config.port
    );
    let sock = open_multicast_socket(config.local_ip)?;
    let target = SocketAddrV4::new(config.group, config.port);

    let start_time = unix_now();
    let hostname = hostname_field(&config.hostname);
    let mut ticker = tokio::time::interval(HEALTH_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }

        let packet = build_packet(&shared, hostname, start_time);
        sock.send_to(bytes_of(&packet), target)
            .map_err(DbfitsError::HealthSendFailed)?;
        debug!("health: datagram sent ({} bytes)", size_of::<HealthPacket>());
    }

    // the consumers learn about the shutdown from one last datagram; the
    // quit trigger has already set the shared status to ShuttingDown
    let packet = build_packet(&shared, hostname, start_time);
    if let Err(e) = sock.send_to(bytes_of(&packet), target) {
        warn!("health: final datagram failed: {e}");
    }
    info!("health: task finished");
    Ok(())
}

fn build_packet(shared: &Mutex<SharedHealth>, hostname: [u8; 64], start_time: i64) -> HealthPacket {
    let (version_major, version_minor, version_build) = version_triple();
    let health_time = unix_now();

    let mut state = shared.lock().expect("health mutex poisoned");
    let (avg_x, avg_y) = state.snapshot_weights();
    let status = state.status;

    HealthPacket {
        version_major,
        version_minor,
        version_build,
        hostname,
        start_time,
        health_time,
        up_time: (health_time - start_time) as f64,
        status: status as i32,
        obs_id: state.obs_id as i64,
        subobs_id: state.subobs_id as i64,
        weights_per_tile_x: avg_x,
        weights_per_tile_y: avg_y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn packet_layout_is_packed() {
        assert_eq!(size_of::<HealthPacket>(), 12 + 64 + 8 + 8 + 8 + 4 + 8 + 8 + 2 * 4 * NTILES_MAX);
        assert_eq!(offset_of!(HealthPacket, hostname), 12);
        assert_eq!(offset_of!(HealthPacket, start_time), 76);
        assert_eq!(offset_of!(HealthPacket, up_time), 92);
        assert_eq!(offset_of!(HealthPacket, status), 100);
        assert_eq!(offset_of!(HealthPacket, obs_id), 104);
        assert_eq!(offset_of!(HealthPacket, weights_per_tile_x), 120);
        assert_eq!(offset_of!(HealthPacket, weights_per_tile_y), 120 + 4 * NTILES_MAX);
    }

    #[test]
    fn snapshot_averages_then_resets() {
        let mut state = SharedHealth {
            ntiles: 2,
            weights_counter: 4,
            ..SharedHealth::default()
        };
        state.weights_x[0] = 8.0;
        state.weights_y[0] = 16.0;
        state.weights_x[1] = 2.0;
        state.weights_y[1] = 4.0;

        let (x, y) = state.snapshot_weights();
        assert_eq!(x[0], 2.0);
        assert_eq!(y[0], 4.0);
        assert_eq!(x[1], 0.5);
        assert_eq!(y[1], 1.0);
        assert!(x[2].is_nan());

        // nothing since the snapshot: everything NaN
        let (x, y) = state.snapshot_weights();
        assert!(x[0].is_nan() && y[0].is_nan());
        assert_eq!(state.weights_counter, 0);
    }

    #[test]
    fn hostname_is_null_padded_and_bounded() {
        let field = hostname_field("mwax01");
        assert_eq!(&field[..6], b"mwax01");
        assert!(field[6..].iter().all(|&b| b == 0));

        let long = "x".repeat(100);
        let field = hostname_field(&long);
        assert_eq!(field[63], 0);
    }
}
