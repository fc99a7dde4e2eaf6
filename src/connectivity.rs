//! Network reachability signal
//!
//! A background task periodically opens a TCP connection to the service host
//! and publishes online/offline transitions on a `watch` channel.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// `host:port` to connect to
    pub address: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            address: "generativelanguage.googleapis.com:443".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
        }
    }
}

/// One reachability check.
pub async fn probe_once(config: &ProbeConfig) -> bool {
    match timeout(config.timeout, TcpStream::connect(&config.address)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Probe of {} failed: {}", config.address, e);
            false
        }
        Err(_) => {
            debug!("Probe of {} timed out", config.address);
            false
        }
    }
}

/// Probe once, then keep probing in the background. The task stops when
/// every receiver is gone.
pub async fn spawn_probe(config: ProbeConfig) -> watch::Receiver<bool> {
    let initial = probe_once(&config).await;
    info!("Initial connectivity: {}", if initial { "online" } else { "offline" });

    let (tx, rx) = watch::channel(initial);
    tokio::spawn(async move {
        let mut ticker = interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = ticker.tick() => {
                    let online = probe_once(&config).await;
                    let changed = tx.send_if_modified(|current| {
                        if *current != online {
                            *current = online;
                            true
                        } else {
                            false
                        }
                    });
                    if changed {
                        if online {
                            info!("Connectivity restored");
                        } else {
                            warn!("Connectivity lost");
                        }
                    }
                }
            }
        }
        debug!("Connectivity probe stopped");
    });
    rx
}
