//! The health publisher against a real socket: resolve the loopback
//! interface, tick a few times, then shut down cleanly (which sends the
//! final status datagram).

use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};

use mwax_db2fits::{
    health::{health_task, ipv4_for_interface, HealthConfig, HealthStatus, SharedHealth},
    shutdown::Shutdown,
};

#[test]
fn loopback_interface_resolves_to_its_address() {
    assert_eq!(ipv4_for_interface("lo").unwrap(), Ipv4Addr::LOCALHOST);
    assert!(ipv4_for_interface("definitely-not-an-iface0").is_err());
}

#[tokio::test]
async fn health_task_runs_until_shutdown() {
    let shared = Arc::new(Mutex::new(SharedHealth::default()));
    {
        let mut state = shared.lock().unwrap();
        state.status = HealthStatus::Running;
        state.obs_id = 1_000_000_000;
        state.subobs_id = 1_000_000_008;
        state.ntiles = 2;
        state.weights_counter = 2;
        state.weights_x[0] = 4.0;
        state.weights_y[0] = 8.0;
    }

    let shutdown = Shutdown::new(shared.clone());
    let config = HealthConfig {
        local_ip: Ipv4Addr::LOCALHOST,
        group: "239.255.90.90".parse().unwrap(),
        port: 50905,
        hostname: "mwax-test".to_string(),
    };

    let handle = tokio::spawn(health_task(config, shared.clone(), shutdown.clone()));

    // let at least one tick fire, then stop
    tokio::time::sleep(Duration::from_millis(1200)).await;
    shutdown.trigger();
    handle
        .await
        .expect("health task panicked")
        .expect("health task should exit cleanly");

    // the tick snapshotted and reset the accumulators
    let state = shared.lock().unwrap();
    assert_eq!(state.weights_counter, 0);
    assert_eq!(state.weights_x[0], 0.0);
}
