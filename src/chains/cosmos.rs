use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{
    Chain, LedgerAdapter, NetworkTx, Receipt, ReplacementRequest, ReplacementTx, StatusProbe,
};
use crate::config::CosmosConfig;
use crate::error::ChainError;
use crate::store::TxStatus;

/// Status adapter for the finality-by-inclusion (Cosmos) ledger family.
///
/// Inclusion in a block is final here: there is no `Mined` waypoint, and
/// the effective confirmation depth is one block.
pub struct CosmosAdapter {
    client: Client,
    lcd_url: String,
}

impl CosmosAdapter {
    pub fn new(config: &CosmosConfig) -> Self {
        Self {
            client: Client::new(),
            lcd_url: config.lcd_url.trim_end_matches('/').to_string(),
        }
    }

    async fn probe(&self, tx_hash: &str) -> Result<StatusProbe, ChainError> {
        let response = self
            .client
            .get(format!("{}/txs/{}", self.lcd_url, tx_hash))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(StatusProbe::status(TxStatus::NotFound));
        }
        let tx: LcdTxResponse = response.error_for_status()?.json().await?;
        Ok(classify(&tx))
    }
}

#[async_trait]
impl LedgerAdapter for CosmosAdapter {
    fn chain(&self) -> Chain {
        Chain::Cosmos
    }

    async fn get_status(&self, tx_hash: &str, _require_receipt: bool) -> StatusProbe {
        match self.probe(tx_hash).await {
            Ok(probe) => probe,
            Err(err) => {
                warn!(tx_hash = %tx_hash, error = %err, "status probe failed, treating as pending");
                StatusProbe::status(TxStatus::Pending)
            }
        }
    }

    async fn resend(&self, raw_signed_tx: &str, tx_hash: &str) -> Result<bool, ChainError> {
        #[derive(Deserialize)]
        struct BroadcastResponse {
            txhash: Option<String>,
        }

        let response: BroadcastResponse = self
            .client
            .post(format!("{}/txs", self.lcd_url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(raw_signed_tx.to_string())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // The broadcast echoing the tracked hash means the exact transaction
        // is already on the network.
        let known = response
            .txhash
            .map(|hash| hash.eq_ignore_ascii_case(tx_hash))
            .unwrap_or(false);
        if known {
            info!(tx_hash = %tx_hash, "rebroadcast matched the tracked transaction");
        }
        Ok(known)
    }

    async fn replace(&self, _request: &ReplacementRequest) -> Result<ReplacementTx, ChainError> {
        Err(ChainError::ReplacementUnsupported("cosmos"))
    }

    async fn get_block_time(&self, block_number: u64) -> Result<DateTime<Utc>, ChainError> {
        #[derive(Deserialize)]
        struct BlockResponse {
            block_meta: BlockMeta,
        }
        #[derive(Deserialize)]
        struct BlockMeta {
            header: BlockHeader,
        }
        #[derive(Deserialize)]
        struct BlockHeader {
            time: String,
        }

        let block: BlockResponse = self
            .client
            .get(format!("{}/blocks/{}", self.lcd_url, block_number))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        block
            .block_meta
            .header
            .time
            .parse::<DateTime<Utc>>()
            .map_err(|err| ChainError::Parse(format!("bad block time: {err}")))
    }
}

#[derive(Debug, Deserialize)]
struct LcdTxResponse {
    height: Option<String>,
    txhash: Option<String>,
    /// Application-level error code; absent or zero on success.
    code: Option<Value>,
    gas_used: Option<String>,
    logs: Option<Vec<LcdLog>>,
}

#[derive(Debug, Deserialize)]
struct LcdLog {
    success: Option<bool>,
}

fn code_is_error(code: &Value) -> bool {
    match code {
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => !s.is_empty() && s != "0",
        _ => false,
    }
}

fn classify(tx: &LcdTxResponse) -> StatusProbe {
    let height = tx
        .height
        .as_deref()
        .and_then(|h| h.parse::<u64>().ok())
        .filter(|h| *h > 0);
    let Some(height) = height else {
        return StatusProbe::status(TxStatus::Pending);
    };
    if tx.code.as_ref().map(code_is_error).unwrap_or(false) {
        return StatusProbe::status(TxStatus::Fail);
    }

    let success = tx
        .logs
        .as_ref()
        .and_then(|logs| logs.first())
        .and_then(|log| log.success)
        .unwrap_or(true);
    let status = if success {
        TxStatus::Success
    } else {
        TxStatus::Fail
    };
    StatusProbe {
        status,
        receipt: Some(Receipt {
            block_number: height,
            block_hash: tx.txhash.clone().unwrap_or_default(),
            gas_used: tx
                .gas_used
                .as_deref()
                .and_then(|g| g.parse().ok())
                .unwrap_or(0),
        }),
        network_tx: Some(NetworkTx {
            from: None,
            to: None,
            value: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(height: Option<&str>, code: Option<Value>, success: Option<bool>) -> LcdTxResponse {
        LcdTxResponse {
            height: height.map(|h| h.to_string()),
            txhash: Some("ABCDEF".to_string()),
            code,
            gas_used: Some("31500".to_string()),
            logs: success.map(|s| vec![LcdLog { success: Some(s) }]),
        }
    }

    #[test]
    fn no_height_is_pending() {
        assert_eq!(
            classify(&tx(None, None, None)).status,
            TxStatus::Pending
        );
        assert_eq!(
            classify(&tx(Some(""), None, None)).status,
            TxStatus::Pending
        );
        assert_eq!(
            classify(&tx(Some("0"), None, None)).status,
            TxStatus::Pending
        );
    }

    #[test]
    fn nonzero_code_is_fail() {
        assert_eq!(
            classify(&tx(Some("42"), Some(json!(4)), None)).status,
            TxStatus::Fail
        );
        assert_eq!(
            classify(&tx(Some("42"), Some(json!("12")), None)).status,
            TxStatus::Fail
        );
        // a zero code is not an error
        assert_eq!(
            classify(&tx(Some("42"), Some(json!("0")), Some(true))).status,
            TxStatus::Success
        );
    }

    #[test]
    fn inclusion_is_final() {
        let probe = classify(&tx(Some("7042"), None, Some(true)));
        assert_eq!(probe.status, TxStatus::Success);
        let receipt = probe.receipt.unwrap();
        assert_eq!(receipt.block_number, 7042);
        assert_eq!(receipt.gas_used, 31500);

        assert_eq!(
            classify(&tx(Some("7042"), None, Some(false))).status,
            TxStatus::Fail
        );
    }
}
