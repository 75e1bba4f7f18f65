use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use super::{TxChange, TxStore};

/// Settings for the change-notification stream.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// Status values to watch; the result is the OR of the filters.
    pub statuses: Vec<String>,
    /// Cap on in-flight records, ordered by enqueue time ascending.
    pub max_in_queue: i64,
    pub poll_interval: Duration,
}

/// Emits `Added`/`Removed` changes for the watched record set.
///
/// The store has no native snapshot listener, so the watcher polls the
/// watched query and diffs against the previous result. A failed poll keeps
/// the previous snapshot: a store blip must never fabricate removals.
pub fn spawn_watcher(
    store: Arc<dyn TxStore>,
    settings: WatchSettings,
    changes: mpsc::Sender<TxChange>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut known: HashSet<String> = HashSet::new();
        let mut tick = interval(settings.poll_interval);
        loop {
            tick.tick().await;
            let records = match store
                .fetch_watched(&settings.statuses, settings.max_in_queue)
                .await
            {
                Ok(records) => records,
                Err(err) => {
                    warn!(error = %err, "watch poll failed, keeping previous snapshot");
                    continue;
                }
            };

            let current: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();

            for record in records {
                if !known.contains(&record.id) {
                    debug!(tx_hash = %record.id, kind = %record.kind, "record entered watched set");
                    if changes.send(TxChange::Added(record)).await.is_err() {
                        return;
                    }
                }
            }
            for gone in known.difference(&current) {
                debug!(tx_hash = %gone, "record left watched set");
                if changes.send(TxChange::Removed(gone.clone())).await.is_err() {
                    return;
                }
            }

            known = current;
        }
    })
}
