// Live interface statistics poller

//! Periodic refresh of transfer counters, handshakes and endpoints
//!
//! The kernel reports session counters that restart from zero whenever the
//! interface or a peer is re-created. [`fold_counters`] carries the previous
//! session into the cumulative counters when that happens, so totals only
//! ever grow.

use crate::configuration::Configuration;
use crate::error::Result;
use crate::peer::NO_HANDSHAKE;
use crate::registry::Registry;
use crate::store::{Counters, PeerTable, TransferSnapshot};
use crate::types::PeerStatus;
use chrono::Local;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A handshake younger than this marks the peer as running
const RUNNING_WINDOW_SECS: i64 = 120;

/// Merge fresh session counters into stored ones
///
/// When either fresh value is below the stored session value the session
/// restarted: the previous session is added to the cumulative counters.
pub fn fold_counters(prev: Counters, rx: i64, tx: i64) -> Counters {
    let mut next = prev;
    if rx < prev.total_receive || tx < prev.total_sent {
        next.cumu_receive = prev.cumu_receive.saturating_add(prev.total_receive);
        next.cumu_sent = prev.cumu_sent.saturating_add(prev.total_sent);
    }
    next.total_receive = rx;
    next.total_sent = tx;
    next
}

/// `H:MM:SS`
pub fn format_age(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn to_bytes(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Pull live statistics for one configuration into the store, then reconcile
///
/// Down configurations are skipped.
pub async fn refresh_configuration(config: &mut Configuration) -> Result<()> {
    if !config.refresh_status().await {
        return Ok(());
    }
    let ctx = config.context().clone();
    let name = config.name().to_string();
    let protocol = config.protocol();

    let stored: HashMap<String, Counters> = ctx
        .store
        .peers(&name, PeerTable::Active)
        .await?
        .into_iter()
        .map(|p| (p.id.clone(), p.counters()))
        .collect();

    let now = Local::now().naive_local();
    for sample in ctx.control.transfer(protocol, &name).await? {
        let Some(prev) = stored.get(&sample.public_key) else {
            continue;
        };
        let next = fold_counters(*prev, to_bytes(sample.rx_bytes), to_bytes(sample.tx_bytes));
        if next == *prev {
            continue;
        }
        ctx.store
            .update_counters(&name, &sample.public_key, &next)
            .await?;
        let snapshot = TransferSnapshot {
            id: sample.public_key,
            total_receive: next.total_receive,
            total_sent: next.total_sent,
            total_data: next.total_data(),
            cumu_receive: next.cumu_receive,
            cumu_sent: next.cumu_sent,
            cumu_data: next.cumu_data(),
            time: now,
        };
        ctx.store.insert_snapshot(&name, &snapshot).await?;
    }

    let now_epoch = Local::now().timestamp();
    for handshake in ctx.control.latest_handshakes(protocol, &name).await? {
        if !stored.contains_key(&handshake.public_key) {
            continue;
        }
        let (age, status) = if handshake.epoch_secs == 0 {
            (NO_HANDSHAKE.to_string(), PeerStatus::Stopped)
        } else {
            let secs = now_epoch - handshake.epoch_secs;
            let status = if (0..RUNNING_WINDOW_SECS).contains(&secs) {
                PeerStatus::Running
            } else {
                PeerStatus::Stopped
            };
            (format_age(secs), status)
        };
        ctx.store
            .update_handshake(&name, &handshake.public_key, &age, status)
            .await?;
    }

    for endpoint in ctx.control.endpoints(protocol, &name).await? {
        if stored.contains_key(&endpoint.public_key) {
            ctx.store
                .update_endpoint(&name, &endpoint.public_key, &endpoint.endpoint)
                .await?;
        }
    }

    config.reconcile().await
}

/// Periodic statistics refresher over every registered configuration
pub struct Poller {
    registry: Arc<Registry>,
    interval: Duration,
}

impl Poller {
    pub fn new(registry: Arc<Registry>, interval_secs: u64) -> Self {
        Self {
            registry,
            interval: Duration::from_secs(interval_secs),
        }
    }

    /// Refresh every configuration once; returns how many failed
    pub async fn run_once(&self) -> usize {
        let mut failures = 0;
        for handle in self.registry.handles().await {
            let mut config = handle.lock().await;
            if let Err(e) = refresh_configuration(&mut config).await {
                log::warn!("Failed to refresh statistics of {}: {}", config.name(), e);
                failures += 1;
            }
        }
        failures
    }

    /// Run until cancelled
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        log::info!("Poller started ({}s interval)", self.interval.as_secs());
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("Poller stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let failures = self.run_once().await;
                    if failures > 0 {
                        log::debug!("Poll finished with {} failures", failures);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeControl, Fixture};
    use crate::wg_controller::{PeerEndpoint, PeerHandshake, PeerTransfer};

    fn counters(total_receive: i64, total_sent: i64, cumu_receive: i64, cumu_sent: i64) -> Counters {
        Counters {
            total_receive,
            total_sent,
            cumu_receive,
            cumu_sent,
        }
    }

    #[test]
    fn test_fold_counters() {
        // Growing session
        assert_eq!(fold_counters(counters(100, 50, 0, 0), 150, 60), counters(150, 60, 0, 0));
        // Interface restarted
        assert_eq!(fold_counters(counters(100, 50, 10, 5), 20, 5), counters(20, 5, 110, 55));
        // Only one side went backwards
        assert_eq!(fold_counters(counters(100, 50, 0, 0), 200, 10), counters(200, 10, 100, 50));
        // Cumulative counters saturate instead of wrapping
        let folded = fold_counters(counters(100, 50, i64::MAX - 10, 0), 0, 0);
        assert_eq!(folded.cumu_receive, i64::MAX);
        assert_eq!(folded.cumu_data(), i64::MAX);
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(0), "0:00:00");
        assert_eq!(format_age(59), "0:00:59");
        assert_eq!(format_age(3661), "1:01:01");
        assert_eq!(format_age(-5), "0:00:00");
    }

    fn transfer(key: &str, rx: u64, tx: u64) -> PeerTransfer {
        PeerTransfer {
            public_key: key.to_string(),
            rx_bytes: rx,
            tx_bytes: tx,
        }
    }

    #[tokio::test]
    async fn test_poll_folds_restart_and_records_history() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        let poller = Poller::new(fx.registry.clone(), 10);

        fx.control.set_transfer("wg0", vec![transfer("P1=", 1000, 400)]);
        assert_eq!(poller.run_once().await, 0);
        fx.control.set_transfer("wg0", vec![transfer("P1=", 300, 100)]);
        assert_eq!(poller.run_once().await, 0);

        let handle = fx.registry.get("wg0").await.unwrap();
        let config = handle.lock().await;
        let p1 = config.peer("P1=").unwrap();
        assert_eq!((p1.total_receive, p1.total_sent), (300, 100));
        assert_eq!((p1.cumu_receive, p1.cumu_sent), (1000, 400));
        assert_eq!(p1.cumu_data, 1400);

        let history = config.transfer_history(Some("P1=")).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].total_data, 400);
    }

    #[tokio::test]
    async fn test_unchanged_counters_add_no_history() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        let poller = Poller::new(fx.registry.clone(), 10);
        fx.control.set_transfer("wg0", vec![transfer("P1=", 10, 10)]);
        poller.run_once().await;
        poller.run_once().await;
        assert_eq!(fx.store.snapshots("wg0", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handshakes_and_endpoints() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        let now = Local::now().timestamp();
        fx.control.set_handshakes(
            "wg0",
            vec![
                PeerHandshake {
                    public_key: "P1=".to_string(),
                    epoch_secs: now - 30,
                },
                PeerHandshake {
                    public_key: "P2=".to_string(),
                    epoch_secs: 0,
                },
            ],
        );
        fx.control.set_endpoints(
            "wg0",
            vec![PeerEndpoint {
                public_key: "P1=".to_string(),
                endpoint: "203.0.113.5:40000".to_string(),
            }],
        );
        Poller::new(fx.registry.clone(), 10).run_once().await;

        let handle = fx.registry.get("wg0").await.unwrap();
        let config = handle.lock().await;
        let p1 = config.peer("P1=").unwrap();
        assert_eq!(p1.status, PeerStatus::Running);
        assert!(p1.latest_handshake.starts_with("0:00:"));
        assert_eq!(p1.endpoint, "203.0.113.5:40000");
        let p2 = config.peer("P2=").unwrap();
        assert_eq!(p2.status, PeerStatus::Stopped);
        assert_eq!(p2.latest_handshake, NO_HANDSHAKE);
        assert_eq!(config.summary().connected_peers, 1);
    }

    #[tokio::test]
    async fn test_handshake_this_second_is_running() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        let now = Local::now().timestamp();
        fx.control.set_handshakes(
            "wg0",
            vec![
                PeerHandshake {
                    public_key: "P1=".to_string(),
                    epoch_secs: now,
                },
                PeerHandshake {
                    public_key: "P2=".to_string(),
                    epoch_secs: now - RUNNING_WINDOW_SECS - 5,
                },
            ],
        );
        Poller::new(fx.registry.clone(), 10).run_once().await;

        let handle = fx.registry.get("wg0").await.unwrap();
        let config = handle.lock().await;
        let p1 = config.peer("P1=").unwrap();
        assert_eq!(p1.status, PeerStatus::Running);
        assert!(p1.latest_handshake.starts_with("0:00:0"));
        assert_eq!(config.peer("P2=").unwrap().status, PeerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_down_configuration_is_skipped() {
        let fx = Fixture::new(FakeControl::default()).await;
        fx.control.set_transfer("wg0", vec![transfer("P1=", 10, 10)]);
        Poller::new(fx.registry.clone(), 10).run_once().await;
        assert!(fx.store.snapshots("wg0", None).await.unwrap().is_empty());
    }
}
