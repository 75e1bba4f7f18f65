use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::warn;

use super::{StatusUpdate, TransactionRecord, TxStore};
use crate::error::StoreError;

const RECORD_COLUMNS: &str = "id, kind, status, enqueued_at, from_addr, to_addr, value, \
     amount, amount_denom, nonce, raw_signed_tx, from_user, to_user, fee_amount, gas, memo, \
     account_number, sequence, delegator_address, replacement_tx_hash";

/// Postgres-backed transaction record store.
pub struct PgTxStore {
    pool: PgPool,
}

impl PgTxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TxStore for PgTxStore {
    async fn fetch_watched(
        &self,
        statuses: &[String],
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let records = sqlx::query_as::<_, TransactionRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM transactions
            WHERE status = ANY($1)
            ORDER BY enqueued_at ASC
            LIMIT $2
            "#
        ))
        .bind(statuses)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<(), StoreError> {
        if !update.status.is_persistable() {
            return Err(StoreError::NotPersistable(update.status.to_string()));
        }

        let mut query = build_update(id, update);
        let result = query.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            warn!(tx_hash = %id, "status update matched no record");
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

/// SET list carries only the fields present on the update.
fn build_update(id: &str, update: StatusUpdate) -> QueryBuilder<'static, Postgres> {
    let mut query: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE transactions SET status = ");
    query.push_bind(update.status.as_str());
    if let Some(block_number) = update.complete_block_number {
        query.push(", complete_block_number = ").push_bind(block_number);
    }
    if let Some(complete_ts) = update.complete_ts {
        query.push(", complete_ts = ").push_bind(complete_ts);
    }
    if let Some(from) = update.from {
        query.push(", from_addr = ").push_bind(from);
    }
    if let Some(to) = update.to {
        query.push(", to_addr = ").push_bind(to);
    }
    if let Some(value) = update.value {
        query.push(", value = ").push_bind(value);
    }
    if let Some(replacement) = update.replacement_tx_hash {
        query.push(", replacement_tx_hash = ").push_bind(replacement);
    }
    query.push(" WHERE id = ").push_bind(id.to_string());
    query
}
