//! Snapshot fan-out to WebSocket sessions
//!
//! Each session owns a single-frame slot. The broadcaster encodes each snapshot once
//! and stores the same buffer in every slot, replacing a frame the session has not
//! taken yet. A slow client therefore resumes at the newest frame and never delays
//! the others or the analyzer.

use crate::analysis::AnalysisSnapshot;
use crate::state::StateStore;
use crate::transport::encode_frame;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-session counters
#[derive(Debug, Default)]
pub struct SessionStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    last_frame_id: AtomicU32,
}

impl SessionStats {
    pub fn record_sent(&self, frame_id: u32) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.last_frame_id.store(frame_id, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames replaced before the session took them
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Id of the last frame written to the socket, 0 before the first
    pub fn last_frame_id(&self) -> u32 {
        self.last_frame_id.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct FrameSlot {
    pending: Mutex<Option<Bytes>>,
    closed: AtomicBool,
    notify: Notify,
}

impl FrameSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Bytes>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store `frame`, returning true if it replaced one not yet taken
    fn put(&self, frame: Bytes) -> bool {
        let replaced = self.lock().replace(frame).is_some();
        self.notify.notify_one();
        replaced
    }

    fn take(&self) -> Option<Bytes> {
        self.lock().take()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Newest frame for one session
pub struct FrameReceiver {
    slot: Arc<FrameSlot>,
}

impl FrameReceiver {
    /// Wait for the next frame. Returns `None` once the broadcaster has stopped and
    /// the last pending frame was taken.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            let notified = self.slot.notify.notified();
            if let Some(frame) = self.slot.take() {
                return Some(frame);
            }
            if self.slot.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Take the pending frame without waiting
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.slot.take()
    }
}

/// Receiving half of a registered session
pub struct ClientSession {
    pub id: Uuid,
    pub frames: FrameReceiver,
    pub stats: Arc<SessionStats>,
}

struct SessionHandle {
    id: Uuid,
    // Dead once the session side is dropped
    slot: Weak<FrameSlot>,
    stats: Arc<SessionStats>,
}

#[derive(Clone)]
pub struct Broadcaster {
    store: Arc<StateStore>,
    sessions: Arc<Mutex<Vec<SessionHandle>>>,
}

impl Broadcaster {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a session. It receives frames starting with the next snapshot.
    pub fn register(&self) -> ClientSession {
        let slot = Arc::new(FrameSlot::default());
        let stats = Arc::new(SessionStats::default());
        let id = Uuid::new_v4();

        let count = self.with_sessions(|sessions| {
            sessions.push(SessionHandle {
                id,
                slot: Arc::downgrade(&slot),
                stats: Arc::clone(&stats),
            });
            sessions.len()
        });
        self.store.set_client_count(count);
        log::debug!("Session {} registered ({} total)", id, count);

        ClientSession {
            id,
            frames: FrameReceiver { slot },
            stats,
        }
    }

    pub fn unregister(&self, id: Uuid) {
        let count = self.with_sessions(|sessions| {
            sessions.retain(|s| s.id != id);
            sessions.len()
        });
        self.store.set_client_count(count);
        log::debug!("Session {} unregistered ({} remaining)", id, count);
    }

    pub fn client_count(&self) -> usize {
        self.with_sessions(|sessions| sessions.len())
    }

    /// Hand one encoded frame to every live session. Returns how many sessions
    /// were offered it; a frame still pending in a slot is replaced and counted as
    /// dropped.
    pub fn fan_out(&self, frame: Bytes) -> usize {
        let (offered, before, after) = self.with_sessions(|sessions| {
            let before = sessions.len();
            sessions.retain(|session| match session.slot.upgrade() {
                Some(slot) => {
                    if slot.put(frame.clone()) {
                        session.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    true
                }
                None => false,
            });
            let after = sessions.len();
            (after, before, after)
        });

        if after != before {
            self.store.set_client_count(after);
        }
        offered
    }

    /// Encode and fan out every new snapshot until `shutdown` is cancelled.
    ///
    /// Snapshots whose id is not greater than the last broadcast one are skipped,
    /// so sessions never see a duplicate or a reordering.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut snapshots = self.store.subscribe();
        let mut last_id = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let latest = snapshots.borrow_and_update().clone();
                    if let Some(snapshot) = latest {
                        self.broadcast(&snapshot, &mut last_id);
                    }
                }
            }
        }

        // Closing the slots ends every session's frame stream
        self.with_sessions(|sessions| {
            for session in sessions.drain(..) {
                if let Some(slot) = session.slot.upgrade() {
                    slot.close();
                }
            }
        });
        log::debug!("Broadcaster stopped");
    }

    fn broadcast(&self, snapshot: &AnalysisSnapshot, last_id: &mut u64) {
        if snapshot.id <= *last_id {
            return;
        }
        *last_id = snapshot.id;
        self.fan_out(encode_frame(snapshot));
    }

    fn with_sessions<R>(&self, f: impl FnOnce(&mut Vec<SessionHandle>) -> R) -> R {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut sessions)
    }
}
