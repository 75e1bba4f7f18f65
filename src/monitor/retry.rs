use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info};

use super::registry::MonitorHandle;
use super::writer::StatusWriter;
use super::MonitorSettings;
use crate::chains::LedgerAdapter;
use crate::scheduler::RateLimitedScheduler;
use crate::store::{TransactionRecord, TxStatus};

/// Keeps a transaction broadcast until the ledger has included it.
///
/// Unlike the poll monitor this policy never writes a status and never
/// times out: it only rebroadcasts the signed payload whenever the
/// transaction has been missing for the configured number of consecutive
/// observations, and finishes as soon as inclusion is confirmed. Useful as
/// a recovery sweep after an upstream outage where outcomes are settled
/// elsewhere.
pub struct RetryTxMonitor {
    record: TransactionRecord,
    adapter: Arc<dyn LedgerAdapter>,
    scheduler: Arc<RateLimitedScheduler>,
    writer: StatusWriter,
    settings: MonitorSettings,
    stop: Arc<AtomicBool>,
    not_found_count: u32,
}

impl RetryTxMonitor {
    pub fn spawn(
        record: TransactionRecord,
        adapter: Arc<dyn LedgerAdapter>,
        scheduler: Arc<RateLimitedScheduler>,
        writer: StatusWriter,
        settings: MonitorSettings,
        done: mpsc::Sender<(String, u64)>,
        token: u64,
    ) -> MonitorHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let tx_hash = record.id.clone();
        let monitor = Self {
            record,
            adapter,
            scheduler,
            writer,
            settings,
            stop: stop.clone(),
            not_found_count: 0,
        };
        tokio::spawn(async move {
            monitor.run().await;
            let _ = done.send((tx_hash, token)).await;
        });
        MonitorHandle::new(stop, token)
    }

    async fn run(mut self) {
        let age = Utc::now()
            .signed_duration_since(self.record.enqueued_at)
            .to_std()
            .unwrap_or_default();
        let start_delay = self.settings.first_enqueue_delay.saturating_sub(age);
        if !start_delay.is_zero() {
            sleep(start_delay).await;
        }

        loop {
            if self.stop.load(Ordering::SeqCst) {
                debug!(tx_hash = %self.record.id, "retry monitor stopped");
                return;
            }

            // inclusion is enough here, no receipt needed
            let probe = self
                .scheduler
                .schedule(self.adapter.get_status(&self.record.id, false))
                .await;

            let delay = match probe.status {
                TxStatus::Confirmed | TxStatus::Success | TxStatus::Fail => {
                    info!(tx_hash = %self.record.id, status = %probe.status, "transaction included");
                    return;
                }
                TxStatus::Mined | TxStatus::Pending => {
                    self.not_found_count = 0;
                    self.settings.poll_interval
                }
                TxStatus::NotFound | TxStatus::Timeout => {
                    self.not_found_count += 1;
                    if self.not_found_count >= self.settings.not_found_count_before_retry {
                        if self.attempt_resend().await {
                            // back off once the payload is known to be queued
                            self.settings.poll_interval
                        } else {
                            self.settings.not_found_interval
                        }
                    } else {
                        self.settings.not_found_interval
                    }
                }
            };

            sleep(delay).await;
        }
    }

    /// Returns true when the ledger already knew the transaction. Only that
    /// acknowledgement clears the counter: an unacknowledged rebroadcast
    /// keeps this monitor resending on every further missed observation.
    async fn attempt_resend(&mut self) -> bool {
        let Some(raw) = self.record.raw_signed_tx.clone() else {
            debug!(tx_hash = %self.record.id, "no signed payload to resend");
            self.not_found_count = 0;
            return false;
        };
        match self
            .scheduler
            .schedule(self.adapter.resend(&raw, &self.record.id))
            .await
        {
            Ok(known) => {
                if known {
                    self.not_found_count = 0;
                }
                self.writer.publish_retry(&self.record, known).await;
                known
            }
            Err(err) => {
                error!(tx_hash = %self.record.id, error = %err, "resend failed");
                false
            }
        }
    }
}
