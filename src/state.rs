//! Single source of truth for the service state
//!
//! `StateStore` is created once per pipeline and handed to every component as an
//! `Arc`. Readers get an immutable `Arc<AppState>`; every mutation clones the small
//! header, edits it, and swaps the pointer under one short lock. New snapshots are
//! also pushed through a `watch` channel so the broadcaster never polls.

use crate::analysis::AnalysisSnapshot;
use crate::config::PipelineConfig;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Stopped => "stopped",
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Error => "error",
        }
    }
}

/// The input device the capture engine has open
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub status: RunStatus,
    pub last_error: Option<String>,
    pub device: Option<DeviceIdentity>,
    pub config: PipelineConfig,
    pub clients: usize,
    pub started_at: Timestamp,
    /// Bumped on every replacement
    pub version: u64,
    pub snapshot: Option<Arc<AnalysisSnapshot>>,
}

pub type SnapshotReceiver = watch::Receiver<Option<Arc<AnalysisSnapshot>>>;

pub struct StateStore {
    current: Mutex<Arc<AppState>>,
    snapshots: watch::Sender<Option<Arc<AnalysisSnapshot>>>,
}

impl StateStore {
    pub fn new(config: PipelineConfig) -> Self {
        let state = AppState {
            status: RunStatus::Stopped,
            last_error: None,
            device: None,
            config,
            clients: 0,
            started_at: Timestamp::now(),
            version: 0,
            snapshot: None,
        };
        let (snapshots, _) = watch::channel(None);
        Self {
            current: Mutex::new(Arc::new(state)),
            snapshots,
        }
    }

    /// Consistent view of the whole state
    pub fn get(&self) -> Arc<AppState> {
        Arc::clone(&self.lock())
    }

    /// Receiver that always holds the most recently published snapshot
    pub fn subscribe(&self) -> SnapshotReceiver {
        self.snapshots.subscribe()
    }

    /// Replace the latest analysis snapshot
    pub fn publish(&self, snapshot: impl Into<Arc<AnalysisSnapshot>>) {
        let snapshot = snapshot.into();
        self.replace(|state| state.snapshot = Some(Arc::clone(&snapshot)));
        self.snapshots.send_replace(Some(snapshot));
    }

    pub fn set_status(&self, status: RunStatus) {
        self.replace(|state| {
            state.status = status;
            if status != RunStatus::Error {
                state.last_error = None;
            }
        });
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.replace(|state| {
            state.status = RunStatus::Error;
            state.last_error = Some(message);
        });
    }

    pub fn set_device(&self, device: Option<DeviceIdentity>) {
        self.replace(|state| state.device = device);
    }

    pub fn set_config(&self, config: PipelineConfig) {
        self.replace(|state| state.config = config);
    }

    pub fn set_client_count(&self, clients: usize) {
        self.replace(|state| state.clients = clients);
    }

    fn replace(&self, edit: impl FnOnce(&mut AppState)) {
        let mut current = self.lock();
        let mut next = AppState::clone(&current);
        edit(&mut next);
        next.version = current.version + 1;
        *current = Arc::new(next);
    }

    fn lock(&self) -> MutexGuard<'_, Arc<AppState>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Metrics;

    fn snapshot(id: u64) -> AnalysisSnapshot {
        AnalysisSnapshot {
            id,
            timestamp: 1.5,
            channels: 1,
            sample_rate: 48000,
            time_domain_len: 2,
            time_domain: vec![0.25, -0.25],
            spectrum: vec![0.0, 1.0, 0.5],
            metrics: Metrics {
                rms: vec![0.25],
                peak: vec![0.25],
                correlation: None,
            },
        }
    }

    #[test]
    fn test_publish_twice_is_idempotent_and_bumps_version() {
        let store = StateStore::new(PipelineConfig::default());
        let snap = Arc::new(snapshot(7));

        store.publish(Arc::clone(&snap));
        let first = store.get();
        store.publish(Arc::clone(&snap));
        let second = store.get();

        assert_eq!(first.snapshot, second.snapshot);
        assert_eq!(second.snapshot.as_deref(), Some(&*snap));
        assert_eq!(first.version + 1, second.version);
    }

    #[test]
    fn test_get_returns_immutable_view() {
        let store = StateStore::new(PipelineConfig::default());
        let before = store.get();

        store.set_status(RunStatus::Running);
        store.set_device(Some(DeviceIdentity {
            id: 1,
            name: "Mic".to_string(),
        }));

        assert_eq!(before.status, RunStatus::Stopped);
        assert!(before.device.is_none());

        let after = store.get();
        assert_eq!(after.status, RunStatus::Running);
        assert_eq!(after.device.as_ref().map(|d| d.id), Some(1));
        assert_eq!(after.version, before.version + 2);
    }

    #[test]
    fn test_error_status_carries_message_until_cleared() {
        let store = StateStore::new(PipelineConfig::default());

        store.set_error("device unplugged");
        assert_eq!(store.get().status, RunStatus::Error);
        assert_eq!(store.get().last_error.as_deref(), Some("device unplugged"));

        store.set_status(RunStatus::Running);
        assert!(store.get().last_error.is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_latest_snapshot() {
        let store = StateStore::new(PipelineConfig::default());
        let mut rx = store.subscribe();

        store.publish(snapshot(1));
        store.publish(snapshot(2));

        rx.changed().await.unwrap();
        let latest = rx.borrow_and_update().clone();
        assert_eq!(latest.map(|s| s.id), Some(2));
    }
}
