//! Background `LISTEN` loop for multi-writer change tracking.

use super::ChangeTracker;
use crate::config::ListenerRetry;
use doordb_storage::DataSource;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

/// Listens on `channel` until the tracker is dropped.
///
/// Notifications already queued when the listener wakes up are merged into
/// one dispatch.
/// Notifications missed while disconnected cannot be recovered, so every
/// reconnect dispatches all watched tables once.
pub(super) async fn run(
    tracker: Weak<ChangeTracker>,
    source: Arc<dyn DataSource>,
    channel: String,
    retry: ListenerRetry,
) {
    let mut attempt: u32 = 0;
    let mut connected_before = false;
    loop {
        match source.listen(&channel) {
            Ok(mut rx) => {
                tracing::debug!(channel = %channel, "invalidation listener connected");
                attempt = 0;
                if connected_before {
                    let Some(tracker) = tracker.upgrade() else {
                        return;
                    };
                    tracker.dispatch(&tracker.watched_names());
                }
                connected_before = true;
                while let Some(first) = rx.recv().await {
                    // A commit's notifications are queued together; drain
                    // them so observers see one set per wakeup.
                    let mut changed = BTreeSet::from([first.payload]);
                    while let Ok(next) = rx.try_recv() {
                        changed.insert(next.payload);
                    }
                    let Some(tracker) = tracker.upgrade() else {
                        return;
                    };
                    tracker.dispatch(&changed);
                }
                tracing::warn!(channel = %channel, "invalidation listener disconnected");
            }
            Err(err) => {
                tracing::warn!(channel = %channel, attempt, error = %err, "listen failed");
            }
        }
        if tracker.strong_count() == 0 {
            return;
        }
        tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}
