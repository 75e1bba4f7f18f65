use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use super::registry::MonitorHandle;
use super::writer::StatusWriter;
use super::MonitorSettings;
use crate::chains::{LedgerAdapter, ReplacementRequest, ReplacementTx};
use crate::scheduler::RateLimitedScheduler;
use crate::store::{TransactionRecord, TxStatus};

/// Owns the full lifecycle of one tracked transaction: polls its status,
/// applies the timeout/resend/replacement policy, and writes the terminal
/// outcome at most once.
///
/// The state machine is
/// `Pending -> {NotFound, Mined, Confirmed, Success, Fail}` with `NotFound`
/// looping on itself (counting) or expiring into `Timeout`. A `Mined` or
/// `Pending` observation is a "still alive" signal that resets the
/// not-found counter, and `Mined` also resets the progress clock.
pub struct PollTxMonitor {
    record: TransactionRecord,
    adapter: Arc<dyn LedgerAdapter>,
    scheduler: Arc<RateLimitedScheduler>,
    writer: StatusWriter,
    settings: MonitorSettings,
    stop: Arc<AtomicBool>,

    /// Last time the transaction was seen making progress.
    ts: Instant,
    /// Age the record had already accrued when this process picked it up,
    /// zeroed on the first progress observation. Keeps the timeout clock
    /// anchored at enqueue time across restarts.
    prior_age: Duration,
    not_found_count: u32,
    replacement: Option<ReplacementTx>,
    replacement_failed: bool,
}

impl PollTxMonitor {
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
            ts: Instant::now(),
            prior_age: Duration::ZERO,
            not_found_count: 0,
            replacement: None,
            replacement_failed: false,
        };
        tokio::spawn(async move {
            monitor.run().await;
            // completion signal is wired at construction, so the registry
            // can never miss a monitor that finished early
            let _ = done.send((tx_hash, token)).await;
        });
        MonitorHandle::new(stop, token)
    }

    async fn run(mut self) {
        self.start_delay().await;
        self.ts = Instant::now();
        self.prior_age = Utc::now()
            .signed_duration_since(self.record.enqueued_at)
            .to_std()
            .unwrap_or_default();

        loop {
            if self.stop.load(Ordering::SeqCst) {
                debug!(tx_hash = %self.record.id, "monitor stopped before terminal status");
                return;
            }

            let probe = self
                .scheduler
                .schedule(self.adapter.get_status(&self.record.id, true))
                .await;

            let delay = match probe.status {
                TxStatus::Success | TxStatus::Fail => {
                    let replacement = self.replacement_hash();
                    if self
                        .writer
                        .write_terminal(
                            &self.record,
                            self.adapter.as_ref(),
                            probe.status,
                            Some(&probe),
                            replacement.as_deref(),
                        )
                        .await
                        .is_ok()
                    {
                        return;
                    }
                    // the adapter will re-report the same terminal status,
                    // giving the write another chance
                    self.settings.poll_interval
                }
                TxStatus::Mined | TxStatus::Pending | TxStatus::Confirmed => {
                    // any sighting is progress and re-opens the window
                    self.mark_progress();
                    self.not_found_count = 0;
                    self.settings.poll_interval
                }
                TxStatus::NotFound | TxStatus::Timeout => {
                    if self.stalled_for() > self.settings.time_limit {
                        if self.can_replace() {
                            self.issue_replacement().await;
                        } else {
                            let replacement = self.replacement_hash();
                            if self
                                .writer
                                .write_terminal(
                                    &self.record,
                                    self.adapter.as_ref(),
                                    TxStatus::Timeout,
                                    None,
                                    replacement.as_deref(),
                                )
                                .await
                                .is_ok()
                            {
                                return;
                            }
                        }
                    } else {
                        self.not_found_count += 1;
                        if self.not_found_count >= self.settings.not_found_count_before_retry {
                            self.attempt_resend().await;
                        }
                    }
                    // not-found is less durable, recheck sooner
                    self.settings.not_found_interval
                }
            };

            if !probe.status.is_terminal() && self.poll_replacement().await {
                return;
            }

            sleep(delay).await;
        }
    }

    async fn start_delay(&self) {
        let age = Utc::now()
            .signed_duration_since(self.record.enqueued_at)
            .to_std()
            .unwrap_or_default();
        let delay = self.settings.first_enqueue_delay.saturating_sub(age);
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    fn mark_progress(&mut self) {
        self.ts = Instant::now();
        self.prior_age = Duration::ZERO;
    }

    /// Time without a progress observation, counting from enqueue for
    /// records this process has never seen make progress.
    fn stalled_for(&self) -> Duration {
        self.ts.elapsed() + self.prior_age
    }

    fn replacement_hash(&self) -> Option<String> {
        self.replacement.as_ref().map(|r| r.tx_hash.clone())
    }

    fn can_replace(&self) -> bool {
        self.adapter.supports_replacement()
            && self.replacement.is_none()
            && !self.replacement_failed
            && self.record.nonce.is_some()
    }

    async fn attempt_resend(&mut self) {
        let Some(raw) = self.record.raw_signed_tx.clone() else {
            debug!(tx_hash = %self.record.id, "no signed payload to resend");
            self.not_found_count = 0;
            return;
        };
        match self
            .scheduler
            .schedule(self.adapter.resend(&raw, &self.record.id))
            .await
        {
            Ok(known) => {
                self.not_found_count = 0;
                if known {
                    // already on the network, count it as progress
                    self.mark_progress();
                }
                self.writer.publish_retry(&self.record, known).await;
            }
            Err(err) => {
                error!(tx_hash = %self.record.id, error = %err, "resend failed");
            }
        }
    }

    /// Spend the single replacement attempt: a fee-bumped no-op on the same
    /// nonce, after which both hashes are tracked until one resolves.
    async fn issue_replacement(&mut self) {
        let request = ReplacementRequest::for_record(&self.record);
        match self.scheduler.schedule(self.adapter.replace(&request)).await {
            Ok(replacement) => {
                info!(
                    tx_hash = %self.record.id,
                    replacement = %replacement.tx_hash,
                    "replacement issued for stuck transaction"
                );
                self.writer
                    .publish_replace(&self.record, &replacement.tx_hash)
                    .await;
                self.writer
                    .annotate_replacement(&self.record.id, &replacement.tx_hash)
                    .await;
                self.replacement = Some(replacement);
                // the replacement gets its own progress window
                self.mark_progress();
                self.not_found_count = 0;
            }
            Err(err) => {
                error!(tx_hash = %self.record.id, error = %err, "replacement failed");
                self.replacement_failed = true;
            }
        }
    }

    /// Track the replacement alongside the original. If it resolves first,
    /// the original is recorded as timed out, annotated with the
    /// replacement hash. Returns true once the monitor is finished.
    async fn poll_replacement(&mut self) -> bool {
        let Some(replacement) = self.replacement.clone() else {
            return false;
        };
        let probe = self
            .scheduler
            .schedule(self.adapter.get_status(&replacement.tx_hash, true))
            .await;
        match probe.status {
            TxStatus::Success | TxStatus::Fail => {
                info!(
                    tx_hash = %self.record.id,
                    replacement = %replacement.tx_hash,
                    outcome = %probe.status,
                    "replacement resolved before the original"
                );
                self.writer
                    .write_terminal(
                        &self.record,
                        self.adapter.as_ref(),
                        TxStatus::Timeout,
                        None,
                        Some(&replacement.tx_hash),
                    )
                    .await
                    .is_ok()
            }
            TxStatus::Mined | TxStatus::Pending => {
                // either hash moving is progress for the pair
                self.mark_progress();
                false
            }
            _ => false,
        }
    }
}
