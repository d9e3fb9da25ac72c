use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::health::{HealthStatus, SharedHealth};

/// The process-wide quit flag. Signal handlers, MODE=QUIT headers and fatal
/// writer errors trigger it; the writer loop polls it between blocks and
/// the health task awaits it.
///
/// Triggering also moves the published health status to `ShuttingDown`, so
/// every datagram sent after the first trigger reports the shutdown without
/// the call sites having to update the shared state themselves.
#[derive(Clone)]
pub struct Shutdown {
    quit: Arc<watch::Sender<bool>>,
    health: Arc<Mutex<SharedHealth>>,
}

impl Shutdown {
    #[must_use]
    pub fn new(health: Arc<Mutex<SharedHealth>>) -> Self {
        let (quit, _) = watch::channel(false);
        Self {
            quit: Arc::new(quit),
            health,
        }
    }

    /// Raise the quit flag. Only the first call flips the health status;
    /// later calls are no-ops.
    pub fn trigger(&self) {
        let was_quit = self.quit.send_replace(true);
        if !was_quit {
            self.health.lock().expect("health mutex poisoned").status =
                HealthStatus::ShuttingDown;
        }
    }

    #[must_use]
    pub fn is_quit(&self) -> bool {
        *self.quit.borrow()
    }

    /// Wait for the quit flag. Completes immediately if it is already up.
    pub async fn wait(&self) {
        let mut rx = self.quit.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|quit| *quit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_raises_the_flag_and_flips_health_status_once() {
        let health = Arc::new(Mutex::new(SharedHealth::default()));
        let shutdown = Shutdown::new(health.clone());
        assert!(!shutdown.is_quit());

        shutdown.trigger();
        assert!(shutdown.is_quit());
        assert_eq!(
            health.lock().unwrap().status,
            HealthStatus::ShuttingDown
        );

        // later triggers leave the shared state alone
        health.lock().unwrap().status = HealthStatus::Running;
        shutdown.trigger();
        assert_eq!(health.lock().unwrap().status, HealthStatus::Running);

        // wait after the fact returns immediately
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn wait_wakes_on_trigger_from_another_task() {
        let health = Arc::new(Mutex::new(SharedHealth::default()));
        let shutdown = Shutdown::new(health);

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        tokio::task::yield_now().await;
        shutdown.trigger();
        waiter.await.expect("waiter task panicked");
    }
}
