//! PostgreSQL state manager

use super::{Deposit, DepositStore, Disbursement, PendingTx, PendingTxStore};
use crate::config::DatabaseConfig;
use crate::error::{SubmitterError, SubmitterResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> SubmitterResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SubmitterResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deposits (
                id BIGINT PRIMARY KEY,
                txn_hash VARCHAR(66) NOT NULL,
                block_number BIGINT NOT NULL,
                block_timestamp TIMESTAMPTZ NOT NULL,
                address VARCHAR(42) NOT NULL,
                amount TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deposits_block_number
            ON deposits (block_number)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS disbursements (
                id BIGINT PRIMARY KEY REFERENCES deposits(id),
                txn_hash VARCHAR(66) NOT NULL,
                block_number BIGINT NOT NULL,
                block_timestamp TIMESTAMPTZ NOT NULL,
                success BOOLEAN NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS last_processed_block (
                id BOOL PRIMARY KEY DEFAULT TRUE,
                value BIGINT NOT NULL,
                CONSTRAINT id CHECK (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_txs (
                txn_hash VARCHAR(66) PRIMARY KEY,
                start_id BIGINT NOT NULL,
                end_id BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> SubmitterResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PendingTxStore for StateManager {
    async fn upsert_pending_tx(&self, pending_tx: &PendingTx) -> SubmitterResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_txs (txn_hash, start_id, end_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (txn_hash)
            DO UPDATE SET start_id = $2, end_id = $3
            "#,
        )
        .bind(format!("{:?}", pending_tx.tx_hash))
        .bind(pending_tx.start_id as i64)
        .bind(pending_tx.end_id as i64)
        .execute(&self.pool)
        .await?;

        debug!(
            "Recorded pending tx {:?} for [{}, {})",
            pending_tx.tx_hash, pending_tx.start_id, pending_tx.end_id
        );
        Ok(())
    }

    async fn list_pending_txs(&self) -> SubmitterResult<Vec<PendingTx>> {
        let rows = sqlx::query(
            r#"
            SELECT txn_hash, start_id, end_id
            FROM pending_txs
            ORDER BY start_id DESC, end_id DESC, txn_hash ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PendingTx {
                    tx_hash: parse_hash(row.get("txn_hash"))?,
                    start_id: row.get::<i64, _>("start_id") as u64,
                    end_id: row.get::<i64, _>("end_id") as u64,
                })
            })
            .collect()
    }

    async fn delete_pending_txs(&self, start_id: u64, end_id: u64) -> SubmitterResult<()> {
        sqlx::query("DELETE FROM pending_txs WHERE start_id = $1 AND end_id = $2")
            .bind(start_id as i64)
            .bind(end_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DepositStore for StateManager {
    async fn confirmed_deposits(
        &self,
        block_number: u64,
        num_confirmations: u64,
    ) -> SubmitterResult<Vec<Deposit>> {
        let rows = sqlx::query(
            r#"
            SELECT dep.id, dep.txn_hash, dep.block_number, dep.block_timestamp,
                   dep.address, dep.amount
            FROM deposits AS dep
            LEFT JOIN disbursements AS dis ON dep.id = dis.id
            WHERE dis.id IS NULL AND dep.block_number + $1 <= $2 + 1
            ORDER BY dep.id ASC
            "#,
        )
        .bind(num_confirmations as i64)
        .bind(block_number as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(deposit_from_row).collect()
    }

    async fn upsert_deposits(
        &self,
        deposits: &[Deposit],
        last_processed_block: u64,
    ) -> SubmitterResult<()> {
        let mut tx = self.pool.begin().await?;
        for deposit in deposits {
            sqlx::query(
                r#"
                INSERT INTO deposits (id, txn_hash, block_number, block_timestamp, address, amount)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id)
                DO UPDATE SET txn_hash = $2, block_number = $3, block_timestamp = $4,
                              address = $5, amount = $6
                "#,
            )
            .bind(deposit.id as i64)
            .bind(format!("{:?}", deposit.tx_hash))
            .bind(deposit.block_number as i64)
            .bind(deposit.block_timestamp)
            .bind(format!("{:?}", deposit.address))
            .bind(deposit.amount.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO last_processed_block (value)
            VALUES ($1)
            ON CONFLICT (id)
            DO UPDATE SET value = $1
            "#,
        )
        .bind(last_processed_block as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn last_processed_block(&self) -> SubmitterResult<Option<u64>> {
        let row = sqlx::query("SELECT value FROM last_processed_block")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("value") as u64))
    }

    async fn latest_disbursement_id(&self) -> SubmitterResult<Option<u64>> {
        let row = sqlx::query("SELECT id FROM disbursements ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("id") as u64))
    }

    async fn upsert_disbursement(&self, disbursement: &Disbursement) -> SubmitterResult<()> {
        sqlx::query(
            r#"
            INSERT INTO disbursements (id, txn_hash, block_number, block_timestamp, success)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id)
            DO UPDATE SET txn_hash = $2, block_number = $3, block_timestamp = $4, success = $5
            "#,
        )
        .bind(disbursement.deposit_id as i64)
        .bind(format!("{:?}", disbursement.tx_hash))
        .bind(disbursement.block_number as i64)
        .bind(disbursement.block_timestamp)
        .bind(disbursement.success)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn deposit_from_row(row: &PgRow) -> SubmitterResult<Deposit> {
    let address: String = row.get("address");
    let amount: String = row.get("amount");

    Ok(Deposit {
        id: row.get::<i64, _>("id") as u64,
        tx_hash: parse_hash(row.get("txn_hash"))?,
        block_number: row.get::<i64, _>("block_number") as u64,
        block_timestamp: row.get::<DateTime<Utc>, _>("block_timestamp"),
        address: address
            .parse::<Address>()
            .map_err(|e| decode_error(format!("invalid address {}: {}", address, e)))?,
        amount: U256::from_dec_str(&amount)
            .map_err(|e| decode_error(format!("invalid amount {}: {:?}", amount, e)))?,
    })
}

fn parse_hash(value: String) -> SubmitterResult<H256> {
    value
        .parse::<H256>()
        .map_err(|e| decode_error(format!("invalid tx hash {}: {}", value, e)))
}

fn decode_error(message: String) -> SubmitterError {
    SubmitterError::Database(sqlx::Error::Decode(message.into()))
}
