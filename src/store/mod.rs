pub mod postgres;
pub mod watcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use std::fmt;

use crate::chains::Chain;
use crate::error::StoreError;

/// Transaction status as seen by the monitoring state machine.
///
/// `Pending` is the initial persisted status. `Success`, `Fail` and
/// `Timeout` are terminal and are the only values this service ever writes
/// back. `NotFound`, `Mined` and `Confirmed` exist purely in memory to
/// decide the next poll action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxStatus {
    #[default]
    Pending,
    NotFound,
    Mined,
    Confirmed,
    Success,
    Fail,
    Timeout,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::NotFound => "not found",
            TxStatus::Mined => "mined",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Success => "success",
            TxStatus::Fail => "fail",
            TxStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Success | TxStatus::Fail | TxStatus::Timeout)
    }

    /// Whether this value is ever allowed to reach the store.
    pub fn is_persistable(&self) -> bool {
        self.is_terminal() || matches!(self, TxStatus::Pending)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Closed set of transfer kinds. The kind picks the ledger adapter and the
/// amount-interpretation rule; it is resolved to an adapter once, at monitor
/// construction, never string-matched downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Token transfer on the EVM family, amounts in 1e18 base units.
    Transfer,
    /// Token transfer submitted by a delegate, same rules as `Transfer`.
    DelegatedTransfer,
    /// Native-coin transfer; from/to/value are backfilled from the network
    /// transaction on completion.
    TransferNative,
    /// Transfer on the Cosmos family, amounts carried as {denom, amount}.
    CosmosTransfer,
}

impl TransferKind {
    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "transfer" => Some(TransferKind::Transfer),
            "transferDelegated" => Some(TransferKind::DelegatedTransfer),
            "transferETH" => Some(TransferKind::TransferNative),
            "cosmosTransfer" => Some(TransferKind::CosmosTransfer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Transfer => "transfer",
            TransferKind::DelegatedTransfer => "transferDelegated",
            TransferKind::TransferNative => "transferETH",
            TransferKind::CosmosTransfer => "cosmosTransfer",
        }
    }

    pub fn chain(&self) -> Chain {
        match self {
            TransferKind::Transfer | TransferKind::DelegatedTransfer | TransferKind::TransferNative => {
                Chain::Evm
            }
            TransferKind::CosmosTransfer => Chain::Cosmos,
        }
    }
}

/// One row of the central transaction record store. Read-only input to this
/// service except for the fields carried by [`StatusUpdate`].
#[derive(Debug, Clone, FromRow)]
pub struct TransactionRecord {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub enqueued_at: DateTime<Utc>,

    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
    /// Raw base-unit amount as a decimal string (EVM-family kinds).
    pub value: Option<String>,
    /// Coin amount (Cosmos kinds), together with `amount_denom`.
    pub amount: Option<String>,
    pub amount_denom: Option<String>,
    pub nonce: Option<i64>,
    pub raw_signed_tx: Option<String>,

    pub from_user: Option<String>,
    pub to_user: Option<String>,
    pub fee_amount: Option<String>,
    pub gas: Option<String>,
    pub memo: Option<String>,
    pub account_number: Option<String>,
    pub sequence: Option<String>,
    pub delegator_address: Option<String>,

    pub replacement_tx_hash: Option<String>,
}

impl TransactionRecord {
    /// Parsed transfer kind; `None` for unknown kind strings, which callers
    /// log and skip rather than propagate.
    pub fn transfer_kind(&self) -> Option<TransferKind> {
        TransferKind::from_str(&self.kind)
    }
}

/// The fields the reconciler writes back on a status change. Only fields
/// that are `Some` are applied.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: TxStatus,
    pub complete_block_number: Option<i64>,
    pub complete_ts: Option<DateTime<Utc>>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: Option<String>,
    pub replacement_tx_hash: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: TxStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

/// A change observed on the watched set of transaction records.
#[derive(Debug, Clone)]
pub enum TxChange {
    Added(TransactionRecord),
    Removed(String),
    /// Amount/metadata edits to in-flight records are not re-read.
    Modified(String),
}

/// Interface boundary to the external transaction record store.
#[async_trait]
pub trait TxStore: Send + Sync {
    /// All records matching any of the watched statuses, oldest first,
    /// capped at `limit`.
    async fn fetch_watched(
        &self,
        statuses: &[String],
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError>;

    /// Persist a status change for one record. Writes for different ids are
    /// independent; there is no cross-id transactional coupling.
    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<(), StoreError>;
}
