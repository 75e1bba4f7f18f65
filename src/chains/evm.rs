use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::consensus::{SignableTransaction, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, Bytes, TxKind, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use super::{
    Chain, LedgerAdapter, NetworkTx, Receipt, ReplacementRequest, ReplacementTx, StatusProbe,
};
use crate::config::EvmConfig;
use crate::error::{AppError, AppResult, ChainError};
use crate::store::TxStatus;

/// Gas limit of a plain value transfer, all a replacement ever carries.
const TRANSFER_GAS_LIMIT: u64 = 21_000;

struct Replacer {
    signer: PrivateKeySigner,
    address: Address,
    gas_price: u128,
}

/// Status adapter for the block-confirmation (EVM) ledger family.
///
/// Holds the process-wide chain-head cache: an atomic refreshed by an
/// explicit background task, with a synchronous fetch as the cold-start
/// fallback.
pub struct EvmAdapter {
    client: Client,
    rpc_url: String,
    chain_id: u64,
    confirmation_needed: u64,
    block_time: Duration,
    head: AtomicU64,
    replacer: Option<Replacer>,
}

impl EvmAdapter {
    /// Fails when a replacer key is configured but does not resolve to the
    /// configured checksummed address: the process must refuse to run with
    /// a credential that cannot actually replace stuck transactions.
    pub fn new(config: &EvmConfig, confirmation_needed: u64) -> AppResult<Self> {
        let replacer = match &config.replacer {
            Some(cfg) => {
                let signer = cfg
                    .private_key
                    .trim_start_matches("0x")
                    .parse::<PrivateKeySigner>()
                    .map_err(|err| AppError::Config(format!("invalid replacer key: {err}")))?;
                let address = Address::parse_checksummed(&cfg.address, None).map_err(|err| {
                    AppError::Config(format!("invalid replacer address checksum: {err}"))
                })?;
                if signer.address() != address {
                    return Err(AppError::Config(format!(
                        "replacer key resolves to {}, not the configured {}",
                        signer.address(),
                        address
                    )));
                }
                info!(address = %address, "replacement signer validated");
                Some(Replacer {
                    signer,
                    address,
                    gas_price: cfg.gas_price_wei,
                })
            }
            None => None,
        };

        Ok(Self {
            client: Client::new(),
            rpc_url: config.rpc_url.clone(),
            chain_id: config.chain_id,
            confirmation_needed,
            block_time: config.block_time,
            head: AtomicU64::new(0),
            replacer,
        })
    }

    /// Keeps the chain-head cache warm, one fetch per target block time.
    pub fn spawn_head_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(adapter.block_time);
            loop {
                tick.tick().await;
                match adapter.fetch_block_number().await {
                    Ok(number) => adapter.head.store(number, Ordering::Relaxed),
                    Err(err) => warn!(error = %err, "chain head refresh failed"),
                }
            }
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        #[derive(Deserialize)]
        struct Envelope {
            result: Option<Value>,
            error: Option<RpcErrorBody>,
        }
        #[derive(Deserialize)]
        struct RpcErrorBody {
            code: i64,
            message: String,
        }

        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let envelope: Envelope = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = envelope.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    async fn fetch_block_number(&self) -> Result<u64, ChainError> {
        let raw = self.rpc("eth_blockNumber", json!([])).await?;
        parse_hex_u64(raw.as_str().unwrap_or_default())
    }

    /// Cached head, or a synchronous fetch while the cache is cold.
    async fn current_block(&self) -> Result<u64, ChainError> {
        let cached = self.head.load(Ordering::Relaxed);
        if cached != 0 {
            return Ok(cached);
        }
        let fetched = self.fetch_block_number().await?;
        self.head.store(fetched, Ordering::Relaxed);
        Ok(fetched)
    }

    async fn probe(&self, tx_hash: &str, require_receipt: bool) -> Result<StatusProbe, ChainError> {
        let raw_tx = self.rpc("eth_getTransactionByHash", json!([tx_hash])).await?;
        if raw_tx.is_null() {
            return Ok(StatusProbe::status(TxStatus::NotFound));
        }
        let network_tx: RpcTransaction = serde_json::from_value(raw_tx)?;
        let Some(block_hex) = &network_tx.block_number else {
            return Ok(StatusProbe::status(TxStatus::Pending));
        };
        let tx_block = parse_hex_u64(block_hex)?;
        let current = self.current_block().await?;
        if !depth_reached(tx_block, current, self.confirmation_needed) {
            return Ok(StatusProbe::status(TxStatus::Mined));
        }
        if !require_receipt {
            return Ok(StatusProbe::status(TxStatus::Confirmed));
        }

        let raw_receipt = self
            .rpc("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if raw_receipt.is_null() {
            return Ok(StatusProbe::status(TxStatus::Pending));
        }
        let receipt: RpcReceipt = serde_json::from_value(raw_receipt)?;
        let status = if parse_hex_u64(receipt.status.as_deref().unwrap_or("0x0"))? == 1 {
            TxStatus::Success
        } else {
            TxStatus::Fail
        };

        let value = match &network_tx.value {
            Some(hex) => Some(parse_hex_u128(hex)?.to_string()),
            None => None,
        };
        Ok(StatusProbe {
            status,
            receipt: Some(Receipt {
                block_number: parse_hex_u64(receipt.block_number.as_deref().unwrap_or("0x0"))?,
                block_hash: receipt.block_hash.unwrap_or_default(),
                gas_used: parse_hex_u64(receipt.gas_used.as_deref().unwrap_or("0x0"))?,
            }),
            network_tx: Some(NetworkTx {
                from: network_tx.from,
                to: network_tx.to,
                value,
            }),
        })
    }

    async fn send_raw(&self, raw_signed_tx: &str) -> Result<bool, ChainError> {
        match self.rpc("eth_sendRawTransaction", json!([raw_signed_tx])).await {
            Ok(_) => Ok(false),
            Err(ChainError::Rpc { code, message }) if is_known_tx_message(&message) => {
                info!("rebroadcast of a transaction the network already knows (code {code})");
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    fn build_replacement(&self, nonce: u64) -> Result<(String, String), ChainError> {
        let replacer = self.replacer.as_ref().ok_or(ChainError::NoReplacer)?;
        // Zero-value self-transfer consuming the stuck nonce at a fee high
        // enough to displace the original.
        let mut tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce,
            gas_price: replacer.gas_price,
            gas_limit: TRANSFER_GAS_LIMIT,
            to: TxKind::Call(replacer.address),
            value: U256::ZERO,
            input: Bytes::new(),
        };
        let signature = replacer
            .signer
            .sign_transaction_sync(&mut tx)
            .map_err(|err| ChainError::Signing(err.to_string()))?;
        let signed = tx.into_signed(signature);
        let tx_hash = format!("0x{}", hex::encode(signed.hash()));
        let raw = format!("0x{}", hex::encode(signed.encoded_2718()));
        Ok((tx_hash, raw))
    }
}

#[async_trait]
impl LedgerAdapter for EvmAdapter {
    fn chain(&self) -> Chain {
        Chain::Evm
    }

    async fn get_status(&self, tx_hash: &str, require_receipt: bool) -> StatusProbe {
        match self.probe(tx_hash, require_receipt).await {
            Ok(probe) => probe,
            Err(err) => {
                warn!(tx_hash = %tx_hash, error = %err, "status probe failed, treating as pending");
                StatusProbe::status(TxStatus::Pending)
            }
        }
    }

    async fn resend(&self, raw_signed_tx: &str, tx_hash: &str) -> Result<bool, ChainError> {
        let known = self.send_raw(raw_signed_tx).await?;
        if known {
            info!(tx_hash = %tx_hash, "retry hit a known transaction");
        }
        Ok(known)
    }

    fn supports_replacement(&self) -> bool {
        self.replacer.is_some()
    }

    async fn replace(&self, request: &ReplacementRequest) -> Result<ReplacementTx, ChainError> {
        let replacer = self.replacer.as_ref().ok_or(ChainError::NoReplacer)?;
        // A replacement only displaces the original if it spends the same
        // account's nonce; we can only sign for the replacer account.
        if let Some(sender) = &request.from {
            let expected = format!("{:#x}", replacer.address);
            if !sender.eq_ignore_ascii_case(&expected) {
                return Err(ChainError::ReplacerMismatch {
                    replacer: expected,
                    sender: sender.clone(),
                });
            }
        }
        let nonce = request.nonce.ok_or(ChainError::MissingNonce)?;
        let (tx_hash, raw_signed_tx) = self.build_replacement(nonce as u64)?;
        let known = self.send_raw(&raw_signed_tx).await?;
        info!(
            original = %request.original_tx_hash,
            replacement = %tx_hash,
            known,
            "submitted replacement transaction"
        );
        Ok(ReplacementTx {
            tx_hash,
            raw_signed_tx,
            known,
        })
    }

    async fn get_block_time(&self, block_number: u64) -> Result<DateTime<Utc>, ChainError> {
        let raw = self
            .rpc(
                "eth_getBlockByNumber",
                json!([format!("0x{block_number:x}"), false]),
            )
            .await?;
        let timestamp_hex = raw
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::Parse(format!("block {block_number} has no timestamp")))?;
        let seconds = parse_hex_u64(timestamp_hex)?;
        DateTime::<Utc>::from_timestamp(seconds as i64, 0)
            .ok_or_else(|| ChainError::Parse(format!("block timestamp {seconds} out of range")))
    }
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    from: Option<String>,
    to: Option<String>,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcReceipt {
    status: Option<String>,
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    #[serde(rename = "blockHash")]
    block_hash: Option<String>,
    #[serde(rename = "gasUsed")]
    gas_used: Option<String>,
}

/// Depth rule: a transaction in block B with head H has seen `H - B`
/// confirmations beyond inclusion; it resolves once that reaches the
/// configured depth.
fn depth_reached(tx_block: u64, current_block: u64, needed: u64) -> bool {
    current_block.saturating_sub(tx_block) >= needed
}

fn is_known_tx_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("known transaction") || lowered.contains("already known")
}

fn parse_hex_u64(raw: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|_| ChainError::Parse(format!("bad hex quantity {raw:?}")))
}

fn parse_hex_u128(raw: &str) -> Result<u128, ChainError> {
    u128::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|_| ChainError::Parse(format!("bad hex quantity {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplacerConfig;

    #[test]
    fn depth_boundary_is_inclusive_at_needed() {
        // depth == needed - 1 is still only mined
        assert!(!depth_reached(100, 104, 5));
        // depth == needed resolves
        assert!(depth_reached(100, 105, 5));
        assert!(depth_reached(100, 200, 5));
        // head lagging behind the tx block never underflows
        assert!(!depth_reached(100, 99, 5));
    }

    #[test]
    fn known_transaction_messages_are_not_errors() {
        assert!(is_known_tx_message("known transaction: 0xabc"));
        assert!(is_known_tx_message("ALREADY KNOWN"));
        assert!(!is_known_tx_message("nonce too low"));
    }

    #[test]
    fn hex_quantities_parse() {
        assert_eq!(parse_hex_u64("0x0").unwrap(), 0);
        assert_eq!(parse_hex_u64("0x1b4").unwrap(), 436);
        assert_eq!(
            parse_hex_u128("0xde0b6b3a7640000").unwrap(),
            1_000_000_000_000_000_000
        );
        assert!(parse_hex_u64("0xzz").is_err());
    }

    fn adapter_with_replacer() -> EvmAdapter {
        let signer = PrivateKeySigner::random();
        let config = EvmConfig {
            rpc_url: "http://localhost:8545".into(),
            chain_id: 1,
            block_time: Duration::from_secs(14),
            replacer: Some(ReplacerConfig {
                private_key: hex::encode(signer.to_bytes()),
                address: signer.address().to_checksum(None),
                gas_price_wei: 40_000_000_000,
            }),
        };
        EvmAdapter::new(&config, 5).unwrap()
    }

    #[test]
    fn replacer_key_must_match_address() {
        let signer = PrivateKeySigner::random();
        let other = PrivateKeySigner::random();
        let config = EvmConfig {
            rpc_url: "http://localhost:8545".into(),
            chain_id: 1,
            block_time: Duration::from_secs(14),
            replacer: Some(ReplacerConfig {
                private_key: hex::encode(signer.to_bytes()),
                address: other.address().to_checksum(None),
                gas_price_wei: 1,
            }),
        };
        assert!(matches!(
            EvmAdapter::new(&config, 5),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn replacement_is_a_signed_raw_payload() {
        let adapter = adapter_with_replacer();
        let (tx_hash, raw) = adapter.build_replacement(7).unwrap();
        assert_eq!(tx_hash.len(), 66);
        assert!(tx_hash.starts_with("0x"));
        assert!(raw.starts_with("0x"));
        // nonce is part of the signed payload: different nonce, different hash
        let (other_hash, _) = adapter.build_replacement(8).unwrap();
        assert_ne!(tx_hash, other_hash);
    }

    #[test]
    fn replacement_unavailable_without_key() {
        let config = EvmConfig {
            rpc_url: "http://localhost:8545".into(),
            chain_id: 1,
            block_time: Duration::from_secs(14),
            replacer: None,
        };
        let adapter = EvmAdapter::new(&config, 5).unwrap();
        assert!(!adapter.supports_replacement());
        assert!(matches!(
            adapter.build_replacement(1),
            Err(ChainError::NoReplacer)
        ));
    }
}
