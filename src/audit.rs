use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::error::AppResult;
use crate::store::{TransactionRecord, TransferKind, TxStatus};

pub const TOPIC_MISC: &str = "misc";

/// Decimals of the EVM-family base unit (wei-style).
const EVM_BASE_DECIMALS: u32 = 18;
/// Base units per coin for `nano`-prefixed Cosmos denominations.
const NANO_PER_COIN: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    EventStatus,
    EventRetry,
    EventRetryKnown,
    EventReplace,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::EventStatus => "eventStatus",
            LogType::EventRetry => "eventRetry",
            LogType::EventRetryKnown => "eventRetryKnown",
            LogType::EventReplace => "eventReplace",
        }
    }
}

impl Serialize for LogType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One audit event. Serialized camelCase; absent fields are omitted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub log_type: LogType,
    pub tx_hash: String,
    pub tx_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_block_number: Option<u64>,
    /// Block production time in epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_block_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_gas_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_nonce: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_wallet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_wallet: Option<String>,
    /// Normalized transfer amount in whole coins (token transfers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_raw: Option<String>,
    /// Normalized amount for native-coin transfers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_amount_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegator_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement_tx_hash: Option<String>,
}

impl AuditRecord {
    fn base(log_type: LogType, record: &TransactionRecord) -> Self {
        let amounts = normalized_amounts(record);
        Self {
            log_type,
            tx_hash: record.id.clone(),
            tx_type: record.kind.clone(),
            tx_status: None,
            tx_block: None,
            tx_block_number: None,
            tx_block_time: None,
            tx_gas_used: None,
            tx_nonce: record.nonce,
            from_user: record.from_user.clone(),
            from_wallet: record.from_addr.clone(),
            to_user: record.to_user.clone(),
            to_wallet: record.to_addr.clone(),
            amount: amounts.amount,
            amount_raw: amounts.amount_raw,
            native_amount: amounts.native_amount,
            native_amount_raw: amounts.native_amount_raw,
            delegator_address: record.delegator_address.clone(),
            fee_amount: record.fee_amount.clone(),
            gas: record.gas.clone(),
            memo: record.memo.clone(),
            account_number: record.account_number.clone(),
            sequence: record.sequence.clone(),
            replacement_tx_hash: None,
        }
    }

    pub fn status_event(
        record: &TransactionRecord,
        status: TxStatus,
        receipt: Option<&crate::chains::Receipt>,
        block_time: Option<chrono::DateTime<Utc>>,
        replacement_tx_hash: Option<&str>,
    ) -> Self {
        let mut event = Self::base(LogType::EventStatus, record);
        event.tx_status = Some(status.to_string());
        if let Some(receipt) = receipt {
            event.tx_block = Some(receipt.block_hash.clone());
            event.tx_block_number = Some(receipt.block_number);
            event.tx_gas_used = Some(receipt.gas_used);
        }
        event.tx_block_time = block_time.map(|t| t.timestamp_millis());
        event.replacement_tx_hash = replacement_tx_hash.map(str::to_string);
        event
    }

    pub fn retry_event(record: &TransactionRecord, known: bool) -> Self {
        let log_type = if known {
            LogType::EventRetryKnown
        } else {
            LogType::EventRetry
        };
        Self::base(log_type, record)
    }

    pub fn replace_event(record: &TransactionRecord, replacement_tx_hash: &str) -> Self {
        let mut event = Self::base(LogType::EventReplace, record);
        event.replacement_tx_hash = Some(replacement_tx_hash.to_string());
        event
    }
}

#[derive(Debug, Default)]
struct NormalizedAmounts {
    amount: Option<Decimal>,
    amount_raw: Option<String>,
    native_amount: Option<Decimal>,
    native_amount_raw: Option<String>,
}

/// Normalized transfer amount in the ledger's base unit, per kind.
fn normalized_amounts(record: &TransactionRecord) -> NormalizedAmounts {
    let mut amounts = NormalizedAmounts::default();
    match record.transfer_kind() {
        Some(TransferKind::TransferNative) => {
            if let Some(value) = &record.value {
                amounts.native_amount = base_units_to_coins(value);
                amounts.native_amount_raw = Some(value.clone());
            }
        }
        Some(TransferKind::Transfer) | Some(TransferKind::DelegatedTransfer) => {
            if let Some(value) = &record.value {
                amounts.amount = base_units_to_coins(value);
                amounts.amount_raw = Some(value.clone());
            }
        }
        Some(TransferKind::CosmosTransfer) => {
            if let (Some(amount), Some(denom)) = (&record.amount, &record.amount_denom) {
                amounts.amount = coin_amount_to_coins(amount, denom);
                amounts.amount_raw = Some(format!("{amount}{denom}"));
            }
        }
        None => {}
    }
    amounts
}

fn base_units_to_coins(raw: &str) -> Option<Decimal> {
    let units: u128 = match raw.parse() {
        Ok(units) => units,
        Err(_) => {
            warn!(value = %raw, "unparseable base-unit amount");
            return None;
        }
    };
    if units > i128::MAX as u128 {
        warn!(value = %raw, "amount too large to normalize");
        return None;
    }
    Some(Decimal::from_i128_with_scale(units as i128, EVM_BASE_DECIMALS))
}

fn coin_amount_to_coins(amount: &str, denom: &str) -> Option<Decimal> {
    if !denom.starts_with("nano") {
        warn!(denom = %denom, "unsupported denomination");
        return None;
    }
    let amount = Decimal::from_str(amount).ok()?;
    amount.checked_div(Decimal::from(NANO_PER_COIN))
}

/// Destination for audit records.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, record: Value) -> AppResult<()>;
}

/// POSTs `{topic, record}` to the configured ingest endpoint.
pub struct HttpSink {
    client: Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn publish(&self, topic: &str, record: Value) -> AppResult<()> {
        self.client
            .post(&self.endpoint)
            .json(&json!({ "topic": topic, "record": record }))
            .send()
            .await
            .map_err(crate::error::ChainError::from)?
            .error_for_status()
            .map_err(crate::error::ChainError::from)?;
        Ok(())
    }
}

/// Drops everything; stands in when no endpoint is configured.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _topic: &str, _record: Value) -> AppResult<()> {
        Ok(())
    }
}

/// Stamps and publishes audit records. Publication is best-effort: sink
/// failures are logged and never surfaced to the monitors, and with the
/// disabled flag records are dropped, not queued.
pub struct AuditPublisher {
    config: AuditConfig,
    sink: Arc<dyn EventSink>,
}

impl AuditPublisher {
    pub fn new(config: AuditConfig, sink: Arc<dyn EventSink>) -> Self {
        Self { config, sink }
    }

    pub async fn publish(&self, topic: &str, record: AuditRecord) {
        if !self.config.enabled {
            return;
        }
        let mut value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, "audit record failed to serialize");
                return;
            }
        };
        if let Some(map) = value.as_object_mut() {
            map.insert("@timestamp".into(), json!(Utc::now().to_rfc3339()));
            map.insert("appServer".into(), json!(self.config.app_server));
            map.insert("network".into(), json!(self.config.network));
            map.insert("uuidv4".into(), json!(Uuid::new_v4().to_string()));
        }
        if let Err(err) = self.sink.publish(topic, value).await {
            error!(topic = %topic, error = %err, "audit publish failed");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use rust_decimal_macros::dec;

    fn record(kind: &str) -> TransactionRecord {
        TransactionRecord {
            id: "0xabc".into(),
            kind: kind.into(),
            status: "pending".into(),
            enqueued_at: Utc::now(),
            from_addr: Some("0xfrom".into()),
            to_addr: Some("0xto".into()),
            value: None,
            amount: None,
            amount_denom: None,
            nonce: Some(9),
            raw_signed_tx: None,
            from_user: Some("alice".into()),
            to_user: Some("bob".into()),
            fee_amount: None,
            gas: None,
            memo: None,
            account_number: None,
            sequence: None,
            delegator_address: None,
            replacement_tx_hash: None,
        }
    }

    #[test]
    fn evm_amounts_normalize_to_coins() {
        let mut rec = record("transfer");
        rec.value = Some("1000000000000000000".into());
        let amounts = normalized_amounts(&rec);
        assert_eq!(amounts.amount, Some(dec!(1.000000000000000000)));
        assert_eq!(amounts.amount_raw.as_deref(), Some("1000000000000000000"));
        assert!(amounts.native_amount.is_none());
    }

    #[test]
    fn native_transfers_use_the_native_fields() {
        let mut rec = record("transferETH");
        rec.value = Some("500000000000000000".into());
        let amounts = normalized_amounts(&rec);
        assert_eq!(amounts.native_amount, Some(dec!(0.500000000000000000)));
        assert!(amounts.amount.is_none());
    }

    #[test]
    fn cosmos_nano_denoms_normalize() {
        let mut rec = record("cosmosTransfer");
        rec.amount = Some("2500000000".into());
        rec.amount_denom = Some("nanolike".into());
        let amounts = normalized_amounts(&rec);
        assert_eq!(amounts.amount, Some(dec!(2.5)));
        assert_eq!(amounts.amount_raw.as_deref(), Some("2500000000nanolike"));
    }

    #[test]
    fn unsupported_denom_is_omitted() {
        let mut rec = record("cosmosTransfer");
        rec.amount = Some("10".into());
        rec.amount_denom = Some("uatom".into());
        assert!(normalized_amounts(&rec).amount.is_none());
    }

    #[tokio::test]
    async fn publisher_stamps_records() {
        let sink = MemorySink::new();
        let publisher = enabled_publisher(sink.clone());
        publisher
            .publish(TOPIC_MISC, AuditRecord::retry_event(&record("transfer"), true))
            .await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (topic, value) = &events[0];
        assert_eq!(topic, TOPIC_MISC);
        assert_eq!(value["logType"], "eventRetryKnown");
        assert_eq!(value["appServer"], "test");
        assert_eq!(value["network"], "testnet");
        assert!(value.get("@timestamp").is_some());
        assert!(value.get("uuidv4").is_some());
        assert!(value.get("txStatus").is_none());
    }

    #[tokio::test]
    async fn disabled_publisher_drops_records() {
        let sink = MemorySink::new();
        let publisher = AuditPublisher::new(
            AuditConfig {
                enabled: false,
                endpoint: None,
                app_server: "test".into(),
                network: "testnet".into(),
            },
            sink.clone(),
        );
        publisher
            .publish(TOPIC_MISC, AuditRecord::retry_event(&record("transfer"), false))
            .await;
        assert!(sink.events.lock().unwrap().is_empty());
    }
}
