use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-connection mutable state. Owned exclusively by the connection task,
/// which handles events one at a time, so the fields need no locking. The
/// epoch counter is the only shared piece: the debouncer's deferred clear
/// reads it to detect that it has gone stale.
pub struct Session {
    pub user_id: String,
    pub username: String,
    /// The conversation peer this session has explicitly selected; gates
    /// message sends and activity signals.
    pub selected_peer: Option<String>,
    activity_epoch: Arc<AtomicU64>,
}

impl Session {
    pub fn new(user_id: String, username: String) -> Self {
        Self {
            user_id,
            username,
            selected_peer: None,
            activity_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Invalidates any pending activity clear and returns the new epoch.
    pub fn bump_activity_epoch(&self) -> u64 {
        self.activity_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn activity_epoch_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.activity_epoch)
    }
}
