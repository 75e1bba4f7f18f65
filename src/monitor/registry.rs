use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::poll::PollTxMonitor;
use super::retry::RetryTxMonitor;
use super::writer::StatusWriter;
use super::{MonitorMode, MonitorSettings};
use crate::chains::AdapterRegistry;
use crate::scheduler::RateLimitedScheduler;
use crate::store::{TransactionRecord, TxChange};

/// Cancellation handle for one running monitor. The flag is checked
/// cooperatively at the top of the monitor loop. The token identifies this
/// particular spawn: a stopped monitor's completion message must not be
/// able to evict a newer monitor reusing the same transaction hash.
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    token: u64,
}

impl MonitorHandle {
    pub fn new(stop: Arc<AtomicBool>, token: u64) -> Self {
        Self { stop, token }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Owns the fleet of per-transaction monitors: spawns one per watched
/// record, deduplicates by transaction hash, and frees the slot as soon as
/// a monitor finishes or its record leaves the watched set.
pub struct MonitorRegistry {
    monitors: HashMap<String, MonitorHandle>,
    adapters: Arc<AdapterRegistry>,
    scheduler: Arc<RateLimitedScheduler>,
    writer: StatusWriter,
    settings: MonitorSettings,
    mode: MonitorMode,
    next_token: u64,
    finished_tx: mpsc::Sender<(String, u64)>,
    finished_rx: Option<mpsc::Receiver<(String, u64)>>,
}

impl MonitorRegistry {
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        scheduler: Arc<RateLimitedScheduler>,
        writer: StatusWriter,
        settings: MonitorSettings,
        mode: MonitorMode,
    ) -> Self {
        let (finished_tx, finished_rx) = mpsc::channel(64);
        Self {
            monitors: HashMap::new(),
            adapters,
            scheduler,
            writer,
            settings,
            mode,
            next_token: 0,
            finished_tx,
            finished_rx: Some(finished_rx),
        }
    }

    /// Drives the registry until the change stream closes or the process
    /// receives an interrupt.
    pub async fn run(mut self, mut changes: mpsc::Receiver<TxChange>) {
        let mut finished = self
            .finished_rx
            .take()
            .expect("registry event loop started twice");
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Some(change) => self.handle_change(change),
                    None => break,
                },
                finished = finished.recv() => match finished {
                    Some((id, token)) => self.handle_finished(&id, token),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, stopping all monitors");
                    self.stop_all();
                    break;
                }
            }
        }
    }

    fn handle_change(&mut self, change: TxChange) {
        match change {
            TxChange::Added(record) => self.add_monitor(record),
            TxChange::Removed(id) => {
                if let Some(handle) = self.monitors.remove(&id) {
                    handle.stop();
                    info!(tx_hash = %id, "record left the watched set, monitor stopped");
                }
            }
            TxChange::Modified(id) => {
                debug!(tx_hash = %id, "in-flight record edit ignored");
            }
        }
    }

    fn handle_finished(&mut self, id: &str, token: u64) {
        match self.monitors.get(id) {
            Some(handle) if handle.token == token => {
                self.monitors.remove(id);
                debug!(tx_hash = %id, active = self.monitors.len(), "monitor finished");
            }
            Some(_) => {
                debug!(tx_hash = %id, "completion from a superseded monitor ignored");
            }
            None => {}
        }
    }

    fn add_monitor(&mut self, record: TransactionRecord) {
        if self.monitors.contains_key(&record.id) {
            warn!(tx_hash = %record.id, "monitor already running, ignoring duplicate");
            return;
        }
        let Some(kind) = record.transfer_kind() else {
            warn!(tx_hash = %record.id, kind = %record.kind, "unknown transfer kind, skipping");
            return;
        };
        let adapter = self.adapters.resolve(kind);
        let id = record.id.clone();
        self.next_token += 1;
        let handle = match self.mode {
            MonitorMode::Poll => PollTxMonitor::spawn(
                record,
                adapter,
                self.scheduler.clone(),
                self.writer.clone(),
                self.settings.clone(),
                self.finished_tx.clone(),
                self.next_token,
            ),
            MonitorMode::Retry => RetryTxMonitor::spawn(
                record,
                adapter,
                self.scheduler.clone(),
                self.writer.clone(),
                self.settings.clone(),
                self.finished_tx.clone(),
                self.next_token,
            ),
        };
        self.monitors.insert(id.clone(), handle);
        info!(tx_hash = %id, active = self.monitors.len(), "monitor started");
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.monitors.keys().cloned().collect()
    }

    pub fn stop_all(&self) {
        for handle in self.monitors.values() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::testutil::{enabled_publisher, MemorySink};
    use crate::monitor::testutil::{record, settings, MemStore, MockAdapter};
    use crate::store::TxStatus;
    use std::time::Duration;

    fn registry(mode: MonitorMode) -> (MonitorRegistry, Arc<MemStore>) {
        let adapter = MockAdapter::new();
        let adapters = Arc::new(AdapterRegistry::new(adapter.clone(), adapter));
        let store = MemStore::new();
        let scheduler = Arc::new(RateLimitedScheduler::new(Duration::ZERO));
        let writer = StatusWriter::new(
            store.clone(),
            enabled_publisher(MemorySink::new()),
            scheduler.clone(),
        );
        (
            MonitorRegistry::new(adapters, scheduler, writer, settings(), mode),
            store,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_adds_are_ignored() {
        let (mut registry, _store) = registry(MonitorMode::Poll);
        registry.handle_change(TxChange::Added(record("0x1", "transfer")));
        registry.handle_change(TxChange::Added(record("0x1", "transfer")));
        assert_eq!(registry.active_ids(), vec!["0x1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_kind_is_skipped() {
        let (mut registry, _store) = registry(MonitorMode::Poll);
        registry.handle_change(TxChange::Added(record("0x1", "swap")));
        assert!(registry.active_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_stops_the_monitor_and_frees_the_slot() {
        let (mut registry, store) = registry(MonitorMode::Poll);
        registry.handle_change(TxChange::Added(record("0x1", "transfer")));
        let stop = registry.monitors.get("0x1").unwrap().stop.clone();

        registry.handle_change(TxChange::Removed("0x1".to_string()));
        assert!(registry.active_ids().is_empty());
        assert!(stop.load(Ordering::SeqCst));

        // the same hash can be re-added immediately
        registry.handle_change(TxChange::Added(record("0x1", "transfer")));
        assert_eq!(registry.active_ids(), vec!["0x1".to_string()]);

        // the stopped monitor exits without ever writing
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!store.statuses().contains(&TxStatus::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_monitors_release_their_slot() {
        let (mut registry, store) = registry(MonitorMode::Poll);
        let mut finished = registry.finished_rx.take().unwrap();
        registry.handle_change(TxChange::Added(record("0x1", "transfer")));

        // default probe is not-found; the monitor times out and reports back
        let (id, token) = finished.recv().await.unwrap();
        registry.handle_finished(&id, token);
        assert!(registry.active_ids().is_empty());
        assert_eq!(store.statuses(), vec![TxStatus::Timeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_completion_cannot_evict_the_live_monitor() {
        let (mut registry, _store) = registry(MonitorMode::Poll);
        registry.handle_change(TxChange::Added(record("0x1", "transfer")));
        let first_token = registry.monitors.get("0x1").unwrap().token;

        // the hash is removed and immediately re-added, reusing the slot
        registry.handle_change(TxChange::Removed("0x1".to_string()));
        registry.handle_change(TxChange::Added(record("0x1", "transfer")));
        let second_token = registry.monitors.get("0x1").unwrap().token;
        assert_ne!(first_token, second_token);

        // the stopped first monitor reports in late: the live entry stays
        registry.handle_finished("0x1", first_token);
        assert_eq!(registry.active_ids(), vec!["0x1".to_string()]);
        // and the duplicate guard still sees it
        registry.handle_change(TxChange::Added(record("0x1", "transfer")));
        assert_eq!(registry.active_ids().len(), 1);

        registry.handle_finished("0x1", second_token);
        assert!(registry.active_ids().is_empty());
    }
}
