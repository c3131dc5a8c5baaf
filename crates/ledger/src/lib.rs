use std::time::Duration;

use chrono::{DateTime, Utc};
use podtrack_contracts::Transaction;
use podtrack_contracts::canonical;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use ulid::Ulid;

#[derive(Debug)]
pub enum LedgerError {
    Timeout,
    InvalidRecord(&'static str),
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Timeout => write!(f, "ledger operation timed out"),
            LedgerError::InvalidRecord(reason) => write!(f, "invalid audit record: {}", reason),
            LedgerError::Sqlx(err) => write!(f, "ledger sql error: {}", err),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(value: sqlx::Error) -> Self {
        LedgerError::Sqlx(value)
    }
}

/// One audit entry to append. `details` is stored verbatim alongside the
/// sha256 of its canonical JSON form.
#[derive(Debug, Clone, Copy)]
pub struct AuditRecord<'a> {
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub action: &'a str,
    pub details: &'a serde_json::Value,
    pub actor_id: &'a str,
}

impl AuditRecord<'_> {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.entity_type.trim().is_empty() {
            return Err(LedgerError::InvalidRecord("entityType must be non-empty"));
        }
        if self.entity_id.trim().is_empty() {
            return Err(LedgerError::InvalidRecord("entityId must be non-empty"));
        }
        if self.action.trim().is_empty() {
            return Err(LedgerError::InvalidRecord("action must be non-empty"));
        }
        if self.actor_id.trim().is_empty() {
            return Err(LedgerError::InvalidRecord("actorId must be non-empty"));
        }
        Ok(())
    }
}

const INSERT_TRANSACTION: &str = "INSERT INTO transactions (id, entity_type, entity_id, action, details, details_hash, created_by_id) VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING created_at";

const SELECT_FOR_ENTITY: &str = "SELECT id, entity_type, entity_id, action, details, details_hash, created_by_id, created_at FROM transactions WHERE entity_type = $1 AND entity_id = $2 ORDER BY created_at ASC, id ASC";

/// Appends `record` on an open connection, typically inside the caller's
/// transaction so the audit row commits or rolls back with the mutation it
/// describes.
pub async fn append(
    conn: &mut PgConnection,
    record: &AuditRecord<'_>,
) -> Result<Transaction, LedgerError> {
    record.validate()?;

    let id = Ulid::new().to_string();
    let details_hash = canonical::hash_canonical_json(record.details);

    let row = sqlx::query(INSERT_TRANSACTION)
        .bind(&id)
        .bind(record.entity_type)
        .bind(record.entity_id)
        .bind(record.action)
        .bind(record.details)
        .bind(&details_hash)
        .bind(record.actor_id)
        .fetch_one(&mut *conn)
        .await?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(Transaction {
        id,
        entity_type: record.entity_type.to_string(),
        entity_id: record.entity_id.to_string(),
        action: record.action.to_string(),
        details: record.details.clone(),
        details_hash,
        created_by_id: record.actor_id.to_string(),
        created_at,
    })
}

/// True when the stored hash still matches the stored details.
pub fn verify(transaction: &Transaction) -> bool {
    canonical::hash_canonical_json(&transaction.details) == transaction.details_hash
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, sqlx::Error> {
    Ok(Transaction {
        id: row.try_get("id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        action: row.try_get("action")?,
        details: row.try_get("details")?,
        details_hash: row.try_get("details_hash")?,
        created_by_id: row.try_get("created_by_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone)]
pub struct AuditLedger {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl AuditLedger {
    pub fn from_pool(pool: sqlx::PgPool, write_timeout: Duration) -> Self {
        Self {
            pool,
            write_timeout,
        }
    }

    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, LedgerError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(Self::from_pool(pool, write_timeout))
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let ledger = Self::connect(db_url, write_timeout).await?;
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub async fn ping(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(
            Duration::from_secs(1),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    /// Standalone append in its own transaction.
    pub async fn record(&self, record: AuditRecord<'_>) -> Result<Transaction, LedgerError> {
        record.validate()?;

        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;
            let written = append(&mut *tx, &record).await?;
            tx.commit().await?;
            Ok::<Transaction, LedgerError>(written)
        })
        .await
        .map_err(|_| LedgerError::Timeout)?
    }

    /// Audit history for one entity, oldest first.
    pub async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let rows = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(SELECT_FOR_ENTITY)
                .bind(entity_type)
                .bind(entity_id)
                .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        rows.iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerError::from)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
