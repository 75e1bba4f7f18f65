use std::sync::Arc;

use tracing::{error, info, warn};

use crate::audit::{AuditPublisher, AuditRecord, TOPIC_MISC};
use crate::chains::{LedgerAdapter, StatusProbe};
use crate::error::AppResult;
use crate::scheduler::RateLimitedScheduler;
use crate::store::{StatusUpdate, TransactionRecord, TransferKind, TxStatus, TxStore};

/// Persists a terminal status and publishes the matching audit event.
///
/// The two sides are independent: the store write's outcome is the caller's
/// signal (a failed write makes the monitor revisit the same terminal
/// observation later), while publication is best-effort and never fails the
/// write.
#[derive(Clone)]
pub struct StatusWriter {
    store: Arc<dyn TxStore>,
    publisher: Arc<AuditPublisher>,
    scheduler: Arc<RateLimitedScheduler>,
}

impl StatusWriter {
    pub fn new(
        store: Arc<dyn TxStore>,
        publisher: Arc<AuditPublisher>,
        scheduler: Arc<RateLimitedScheduler>,
    ) -> Self {
        Self {
            store,
            publisher,
            scheduler,
        }
    }

    pub async fn write_terminal(
        &self,
        record: &TransactionRecord,
        adapter: &dyn LedgerAdapter,
        status: TxStatus,
        probe: Option<&StatusProbe>,
        replacement_tx_hash: Option<&str>,
    ) -> AppResult<()> {
        debug_assert!(status.is_terminal());

        let receipt = probe.and_then(|p| p.receipt.as_ref());
        let network_tx = probe.and_then(|p| p.network_tx.as_ref());

        let mut update = StatusUpdate::new(status);
        update.replacement_tx_hash = replacement_tx_hash.map(str::to_string);

        // Native transfers are recorded with whatever counterparties the
        // network transaction actually carried.
        let mut effective = record.clone();
        if record.transfer_kind() == Some(TransferKind::TransferNative) {
            if let Some(network_tx) = network_tx {
                update.from = network_tx.from.clone();
                update.to = network_tx.to.clone();
                update.value = network_tx.value.clone();
                effective.from_addr = network_tx.from.clone().or(effective.from_addr);
                effective.to_addr = network_tx.to.clone().or(effective.to_addr);
                effective.value = network_tx.value.clone().or(effective.value);
            }
        }

        let mut block_time = None;
        if let Some(receipt) = receipt {
            update.complete_block_number = Some(receipt.block_number as i64);
            // the lookup is an upstream call like any other and takes its
            // turn behind the shared gate
            match self
                .scheduler
                .schedule(adapter.get_block_time(receipt.block_number))
                .await
            {
                Ok(time) => {
                    update.complete_ts = Some(time);
                    block_time = Some(time);
                }
                // timestamp backfill is cosmetic, its failure never blocks
                // the terminal write
                Err(err) => {
                    warn!(
                        tx_hash = %record.id,
                        block = receipt.block_number,
                        error = %err,
                        "block time lookup failed"
                    );
                }
            }
        }

        let write_result = self.store.update_status(&record.id, update).await;
        match &write_result {
            Ok(()) => info!(tx_hash = %record.id, status = %status, "terminal status written"),
            Err(err) => {
                error!(tx_hash = %record.id, status = %status, error = %err, "terminal status write failed")
            }
        }

        self.publisher
            .publish(
                TOPIC_MISC,
                AuditRecord::status_event(&effective, status, receipt, block_time, replacement_tx_hash),
            )
            .await;

        write_result.map_err(Into::into)
    }

    /// Best-effort persistence of the replacement back-reference while the
    /// original is still being tracked.
    pub async fn annotate_replacement(&self, id: &str, replacement_tx_hash: &str) {
        let mut update = StatusUpdate::new(TxStatus::Pending);
        update.replacement_tx_hash = Some(replacement_tx_hash.to_string());
        if let Err(err) = self.store.update_status(id, update).await {
            warn!(tx_hash = %id, error = %err, "replacement annotation write failed");
        }
    }

    pub async fn publish_retry(&self, record: &TransactionRecord, known: bool) {
        self.publisher
            .publish(TOPIC_MISC, AuditRecord::retry_event(record, known))
            .await;
    }

    pub async fn publish_replace(&self, record: &TransactionRecord, replacement_tx_hash: &str) {
        self.publisher
            .publish(
                TOPIC_MISC,
                AuditRecord::replace_event(record, replacement_tx_hash),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::testutil::{enabled_publisher, MemorySink};
    use crate::chains::{NetworkTx, Receipt};
    use crate::monitor::testutil::{record, MemStore, MockAdapter};
    use std::time::Duration;

    fn writer(store: Arc<MemStore>, sink: Arc<MemorySink>) -> StatusWriter {
        StatusWriter::new(
            store,
            enabled_publisher(sink),
            Arc::new(RateLimitedScheduler::new(Duration::ZERO)),
        )
    }

    fn success_probe() -> StatusProbe {
        StatusProbe {
            status: TxStatus::Success,
            receipt: Some(Receipt {
                block_number: 120,
                block_hash: "0xblock".into(),
                gas_used: 21_000,
            }),
            network_tx: Some(NetworkTx {
                from: Some("0xrealfrom".into()),
                to: Some("0xrealto".into()),
                value: Some("42".into()),
            }),
        }
    }

    #[tokio::test]
    async fn success_write_carries_receipt_fields() {
        let store = MemStore::new();
        let sink = MemorySink::new();
        let writer = writer(store.clone(), sink.clone());
        let adapter = MockAdapter::new();

        writer
            .write_terminal(
                &record("0x1", "transfer"),
                adapter.as_ref(),
                TxStatus::Success,
                Some(&success_probe()),
                None,
            )
            .await
            .unwrap();

        let updates = store.updates.lock().unwrap();
        let (id, update) = &updates[0];
        assert_eq!(id, "0x1");
        assert_eq!(update.status, TxStatus::Success);
        assert_eq!(update.complete_block_number, Some(120));
        assert!(update.complete_ts.is_some());
        // token transfers never backfill counterparties
        assert!(update.from.is_none());

        let events = sink.events.lock().unwrap();
        assert_eq!(events[0].1["logType"], "eventStatus");
        assert_eq!(events[0].1["txStatus"], "success");
        assert_eq!(events[0].1["txBlockNumber"], 120);
    }

    #[tokio::test]
    async fn native_transfer_backfills_counterparties() {
        let store = MemStore::new();
        let sink = MemorySink::new();
        let writer = writer(store.clone(), sink);
        let adapter = MockAdapter::new();

        writer
            .write_terminal(
                &record("0x2", "transferETH"),
                adapter.as_ref(),
                TxStatus::Success,
                Some(&success_probe()),
                None,
            )
            .await
            .unwrap();

        let updates = store.updates.lock().unwrap();
        let update = &updates[0].1;
        assert_eq!(update.from.as_deref(), Some("0xrealfrom"));
        assert_eq!(update.to.as_deref(), Some("0xrealto"));
        assert_eq!(update.value.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn store_failure_surfaces_but_still_publishes() {
        let store = MemStore::new();
        store.fail_writes.store(true, std::sync::atomic::Ordering::SeqCst);
        let sink = MemorySink::new();
        let writer = writer(store.clone(), sink.clone());
        let adapter = MockAdapter::new();

        let result = writer
            .write_terminal(
                &record("0x3", "transfer"),
                adapter.as_ref(),
                TxStatus::Timeout,
                None,
                Some("0xreplacement"),
            )
            .await;
        assert!(result.is_err());
        assert!(store.updates.lock().unwrap().is_empty());

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["txStatus"], "timeout");
        assert_eq!(events[0].1["replacementTxHash"], "0xreplacement");
    }
}
