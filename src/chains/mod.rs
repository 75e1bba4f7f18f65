pub mod cosmos;
pub mod evm;

pub use cosmos::CosmosAdapter;
pub use evm::EvmAdapter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::error::ChainError;
use crate::store::{TransactionRecord, TransferKind, TxStatus};

/// Ledger families this service reconciles against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    /// Account-based chain with confirmation-depth finality.
    Evm,
    /// Finality-by-inclusion chain: once in a block, the outcome is final.
    Cosmos,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Evm => "evm",
            Chain::Cosmos => "cosmos",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Proof of inclusion returned alongside a resolved status.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub block_number: u64,
    pub block_hash: String,
    pub gas_used: u64,
}

/// Counterparty fields read back from the network transaction, used to
/// backfill native-transfer records on completion.
#[derive(Debug, Clone)]
pub struct NetworkTx {
    pub from: Option<String>,
    pub to: Option<String>,
    /// Base-unit amount as a decimal string.
    pub value: Option<String>,
}

/// One status observation. `receipt`/`network_tx` are populated only when
/// the status resolved to `Success`/`Fail` with a proof available.
#[derive(Debug, Clone)]
pub struct StatusProbe {
    pub status: TxStatus,
    pub receipt: Option<Receipt>,
    pub network_tx: Option<NetworkTx>,
}

impl StatusProbe {
    pub fn status(status: TxStatus) -> Self {
        Self {
            status,
            receipt: None,
            network_tx: None,
        }
    }
}

/// Material needed to build a replacement for a stuck transaction.
#[derive(Debug, Clone)]
pub struct ReplacementRequest {
    pub original_tx_hash: String,
    pub from: Option<String>,
    pub nonce: Option<i64>,
}

impl ReplacementRequest {
    pub fn for_record(record: &TransactionRecord) -> Self {
        Self {
            original_tx_hash: record.id.clone(),
            from: record.from_addr.clone(),
            nonce: record.nonce,
        }
    }
}

/// A replacement transaction that has been submitted.
#[derive(Debug, Clone)]
pub struct ReplacementTx {
    pub tx_hash: String,
    pub raw_signed_tx: String,
    /// The ledger already knew this exact transaction.
    pub known: bool,
}

/// Capability interface implemented once per ledger family.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    /// Current status of `tx_hash`. Never errors: absence is the `NotFound`
    /// status and transient transport faults are logged and reported as
    /// `Pending` so a flaky call cannot advance or regress the monitor's
    /// clocks. With `require_receipt` the adapter keeps reporting
    /// non-terminal statuses until a proof of inclusion is available.
    async fn get_status(&self, tx_hash: &str, require_receipt: bool) -> StatusProbe;

    /// Rebroadcast a previously signed payload. `Ok(true)` means the ledger
    /// already has this exact transaction, which callers treat as progress.
    async fn resend(&self, raw_signed_tx: &str, tx_hash: &str) -> Result<bool, ChainError>;

    fn supports_replacement(&self) -> bool {
        false
    }

    /// Build and submit a fee-bumped no-op consuming the same nonce as the
    /// stuck transaction, where the ledger family supports it.
    async fn replace(&self, request: &ReplacementRequest) -> Result<ReplacementTx, ChainError>;

    /// Wall-clock time a block was produced; backfills the completion
    /// timestamp on terminal write.
    async fn get_block_time(&self, block_number: u64) -> Result<DateTime<Utc>, ChainError>;
}

/// Fixed set of adapters, built once at startup. Monitors resolve their
/// adapter here at construction and hold the implementation, not the tag.
pub struct AdapterRegistry {
    evm: Arc<dyn LedgerAdapter>,
    cosmos: Arc<dyn LedgerAdapter>,
}

impl AdapterRegistry {
    pub fn new(evm: Arc<dyn LedgerAdapter>, cosmos: Arc<dyn LedgerAdapter>) -> Self {
        Self { evm, cosmos }
    }

    pub fn resolve(&self, kind: TransferKind) -> Arc<dyn LedgerAdapter> {
        match kind.chain() {
            Chain::Evm => self.evm.clone(),
            Chain::Cosmos => self.cosmos.clone(),
        }
    }
}
