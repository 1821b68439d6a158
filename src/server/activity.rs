use crate::common::protocol::ServerEvent;
use crate::server::directory::ConnectionDirectory;
use crate::server::session::Session;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Forwards an ephemeral typing signal to the selected peer and arms the
/// trailing clear. Each call bumps the session's epoch, so only the timer
/// armed by the most recent signal ever fires: a burst of keystroke events
/// becomes one relayed signal per call plus a single expiry after the quiet
/// period. Requires a selected conversation; otherwise a no-op.
pub async fn signal_activity(
    directory: &ConnectionDirectory,
    session: &Session,
    payload: Value,
    quiet: Duration,
) {
    let Some(peer) = session.selected_peer.clone() else {
        return;
    };

    let epoch = session.bump_activity_epoch();
    directory.send(&peer, &ServerEvent::Activity(payload)).await;

    let directory = directory.clone();
    let handle = session.activity_epoch_handle();
    tokio::spawn(async move {
        tokio::time::sleep(quiet).await;
        // A newer signal (or the disconnect cleanup) moved the epoch on;
        // this firing is stale and must not clear the fresh indicator.
        if handle.load(Ordering::SeqCst) == epoch {
            directory.send(&peer, &ServerEvent::cleared_activity()).await;
        }
    });
}
