//! PostgreSQL store

use super::Store;
use crate::config::DatabaseConfig;
use crate::coordination::Transaction;
use crate::error::MediatorResult;
use crate::ledger::Account;
use crate::types::{AccountId, TransactionId};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Executor, Postgres, Row};
use tracing::{debug, info};

/// Store backed by PostgreSQL with JSONB record payloads
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &DatabaseConfig) -> MediatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> MediatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                record JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                tx_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                beneficiary_id TEXT NOT NULL,
                status VARCHAR(20) NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_status
            ON transactions (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_account
            ON transactions (account_id, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn upsert_account<'e, E>(executor: E, account: &Account) -> MediatorResult<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO accounts (account_id, record, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (account_id)
            DO UPDATE SET record = $2, updated_at = $3
            "#,
        )
        .bind(account.id.as_str())
        .bind(Json(account))
        .bind(account.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn upsert_transaction<'e, E>(executor: E, tx: &Transaction) -> MediatorResult<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO transactions
                (tx_id, account_id, beneficiary_id, status, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tx_id)
            DO UPDATE SET status = $4, record = $5, updated_at = $7
            "#,
        )
        .bind(tx.id.to_string())
        .bind(tx.account.as_str())
        .bind(tx.beneficiary().as_str())
        .bind(tx.status.as_str())
        .bind(Json(tx))
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    fn decode_transactions(rows: Vec<sqlx::postgres::PgRow>) -> MediatorResult<Vec<Transaction>> {
        rows.into_iter()
            .map(|row| Ok(row.try_get::<Json<Transaction>, _>("record")?.0))
            .collect()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn save_account(&self, account: &Account) -> MediatorResult<()> {
        Self::upsert_account(&self.pool, account).await?;
        debug!("Saved account {}", account.id);
        Ok(())
    }

    async fn load_accounts(&self) -> MediatorResult<Vec<Account>> {
        let rows = sqlx::query("SELECT record FROM accounts")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| Ok(row.try_get::<Json<Account>, _>("record")?.0))
            .collect()
    }

    async fn save_transaction(&self, tx: &Transaction) -> MediatorResult<()> {
        Self::upsert_transaction(&self.pool, tx).await?;
        debug!("Saved transaction {} ({})", tx.id, tx.status);
        Ok(())
    }

    async fn save_checkpoint(&self, tx: &Transaction, accounts: &[Account]) -> MediatorResult<()> {
        let mut db = self.pool.begin().await?;
        for account in accounts {
            Self::upsert_account(&mut *db, account).await?;
        }
        Self::upsert_transaction(&mut *db, tx).await?;
        db.commit().await?;

        debug!(
            "Saved checkpoint {} ({}) with {} accounts",
            tx.id,
            tx.status,
            accounts.len()
        );
        Ok(())
    }

    async fn load_transaction(&self, id: &TransactionId) -> MediatorResult<Option<Transaction>> {
        let row = sqlx::query("SELECT record FROM transactions WHERE tx_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<Json<Transaction>, _>("record")?.0)),
            None => Ok(None),
        }
    }

    async fn load_account_transactions(
        &self,
        account: &AccountId,
    ) -> MediatorResult<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM transactions
            WHERE account_id = $1 OR beneficiary_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(account.as_str())
        .fetch_all(&self.pool)
        .await?;

        Self::decode_transactions(rows)
    }

    async fn load_unfinished(&self) -> MediatorResult<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM transactions
            WHERE status NOT IN ('confirmed', 'rolled_back')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Self::decode_transactions(rows)
    }

    async fn health_check(&self) -> MediatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
