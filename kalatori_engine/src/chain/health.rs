use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WatcherHealth {
    Connecting,
    Healthy { last_finalized: Option<u64> },
    Degraded { failures: u32, last_error: String },
    Stopped,
}

impl WatcherHealth {
    pub fn is_degraded(&self) -> bool {
        matches!(self, WatcherHealth::Degraded { .. })
    }
}

/// Collects the health signals of all chain watchers, keyed by chain name.
#[derive(Debug, Clone, Default)]
pub struct HealthBoard {
    watchers: BTreeMap<String, watch::Receiver<WatcherHealth>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a watcher to the board and returns the sender it should publish its health on.
    pub fn register(&mut self, chain_name: &str) -> watch::Sender<WatcherHealth> {
        let (tx, rx) = watch::channel(WatcherHealth::Connecting);
        self.watchers.insert(chain_name.to_string(), rx);
        tx
    }

    pub fn snapshot(&self) -> BTreeMap<String, WatcherHealth> {
        self.watchers.iter().map(|(name, rx)| (name.clone(), rx.borrow().clone())).collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.watchers.values().all(|rx| !rx.borrow().is_degraded())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn board_reports_degraded_watchers() {
        let mut board = HealthBoard::new();
        let dot = board.register("polkadot");
        let ksm = board.register("kusama");
        assert!(board.is_healthy());
        dot.send_replace(WatcherHealth::Healthy { last_finalized: Some(7) });
        ksm.send_replace(WatcherHealth::Degraded { failures: 3, last_error: "connection refused".into() });
        assert!(!board.is_healthy());
        let snapshot = board.snapshot();
        assert_eq!(snapshot["polkadot"], WatcherHealth::Healthy { last_finalized: Some(7) });
        let json = serde_json::to_value(&snapshot["kusama"]).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["failures"], 3);
    }
}
