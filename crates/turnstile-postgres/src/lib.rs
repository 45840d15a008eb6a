//! PostgreSQL implementation of the turnstile fingerprint store.
//!
//! This crate provides a production-ready PostgreSQL implementation of the
//! `FingerprintStore` trait.
//!
//! # Features
//!
//! - Uniqueness enforced by a `UNIQUE` constraint, not application logic
//! - One transaction per session; a failed unique write aborts it and
//!   `recover` rolls back and begins a fresh one
//! - Schema verification at startup
//! - Age-based sweep of stale reservations
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE fingerprint_reservations (
//!     id BIGSERIAL PRIMARY KEY,
//!     fingerprint VARCHAR(255) NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     CONSTRAINT fingerprint_reservations_fingerprint_key UNIQUE (fingerprint)
//! );
//!
//! CREATE INDEX idx_fingerprint_reservations_created_at
//!     ON fingerprint_reservations (created_at);
//! ```
//!
//! The same schema ships as a migration under `migrations/`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use turnstile_postgres::PgFingerprintStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgFingerprintStore::new(pool);
//! store.verify_schema().await?;
//!
//! let dedupe = DedupeBuilder::new(config).with_store(store).build()?;
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::debug;
use turnstile_core::{
    ConfigError, Fingerprint, FingerprintStore, Reservation, StoreError, StoreSession,
};

pub const DEFAULT_TABLE: &str = "fingerprint_reservations";

/// Width of the `fingerprint` column, in characters.
pub const MAX_FINGERPRINT_LENGTH: usize = 255;

fn check_width(fingerprint: &Fingerprint) -> Result<(), StoreError> {
    let len = fingerprint.as_str().chars().count();
    if len > MAX_FINGERPRINT_LENGTH {
        return Err(StoreError::Other(anyhow!(
            "fingerprint is {len} characters, column holds {MAX_FINGERPRINT_LENGTH}"
        )));
    }
    Ok(())
}

/// PostgreSQL fingerprint store.
#[derive(Clone)]
pub struct PgFingerprintStore {
    pool: PgPool,
    table: Arc<str>,
}

impl PgFingerprintStore {
    /// Create a new PostgreSQL fingerprint store.
    ///
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    ///
    /// # Default Settings
    ///
    /// - Table: `fingerprint_reservations` (see [`DEFAULT_TABLE`])
    /// - Fingerprint width: 255 characters (see [`MAX_FINGERPRINT_LENGTH`])
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: Arc::from(DEFAULT_TABLE),
        }
    }

    /// Create a fingerprint store over a custom table.
    ///
    /// Use this when the reservation table is shared with an existing schema
    /// or several deployments keep separate tables in one database.
    ///
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    /// * `table` - Table name; spliced into SQL, so only `[a-z_][a-z0-9_]*`
    ///   of at most 63 bytes is accepted
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for any other name.
    pub fn with_table(pool: PgPool, table: &str) -> Result<Self, ConfigError> {
        let valid = table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
            && table
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && table.len() <= 63;
        if !valid {
            return Err(ConfigError::Invalid(format!(
                "invalid reservation table name `{table}`"
            )));
        }

        Ok(Self {
            pool,
            table: Arc::from(table),
        })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the reservation table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the reservation table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let table = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                fingerprint VARCHAR(255) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT {table}_fingerprint_key UNIQUE (fingerprint)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_created_at ON {table} (created_at)"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Check that the table exists and carries a single-column unique index
    /// on `fingerprint`.
    ///
    /// Fails with a [`ConfigError`] (inside the `anyhow::Error`) when the
    /// schema would let duplicate reservations through.
    pub async fn verify_schema(&self) -> Result<()> {
        let table_exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM information_schema.tables
                WHERE table_schema = current_schema()
                  AND table_name = $1
            )
            "#,
        )
        .bind(self.table.as_ref())
        .fetch_one(&self.pool)
        .await?;

        if !table_exists {
            return Err(ConfigError::MissingTable {
                table: self.table.to_string(),
            }
            .into());
        }

        let unique_index: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_index i
                JOIN pg_class t ON t.oid = i.indrelid
                JOIN pg_namespace n ON n.oid = t.relnamespace
                JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = i.indkey[0]
                WHERE n.nspname = current_schema()
                  AND t.relname = $1
                  AND i.indisunique
                  AND i.indnatts = 1
                  AND a.attname = 'fingerprint'
            )
            "#,
        )
        .bind(self.table.as_ref())
        .fetch_one(&self.pool)
        .await?;

        if !unique_index {
            return Err(ConfigError::MissingUniqueIndex {
                table: self.table.to_string(),
            }
            .into());
        }

        Ok(())
    }
}

#[async_trait]
impl FingerprintStore for PgFingerprintStore {
    type Session = PgSession;

    async fn acquire(&self) -> Result<PgSession, StoreError> {
        let tx = self.pool.begin().await.map_err(|e| store_error(e, None))?;
        Ok(PgSession {
            pool: self.pool.clone(),
            table: self.table.clone(),
            tx: Some(tx),
            aborted: false,
            pending_insert: None,
        })
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE created_at < $1",
            self.table
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error(e, None))?;

        Ok(result.rows_affected())
    }
}

/// A PostgreSQL transaction.
///
/// Any failed statement aborts the transaction server-side; the session then
/// reports itself unusable until [`recover`](StoreSession::recover) rolls it
/// back and begins a new one.
pub struct PgSession {
    pool: PgPool,
    table: Arc<str>,
    tx: Option<Transaction<'static, Postgres>>,
    aborted: bool,
    pending_insert: Option<Fingerprint>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        if self.aborted {
            return Err(StoreError::SessionClosed);
        }
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(StoreError::SessionClosed),
        }
    }

    /// Record a failed statement; Postgres has aborted the transaction.
    fn fail(&mut self, err: sqlx::Error, fingerprint: Option<&Fingerprint>) -> StoreError {
        self.aborted = true;
        store_error(err, fingerprint)
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn find_by_fingerprint(
        &mut self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Reservation>, StoreError> {
        let sql = format!(
            "SELECT id, fingerprint, created_at FROM {} WHERE fingerprint = $1",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(fingerprint.as_str())
            .fetch_optional(self.conn()?)
            .await;

        match result {
            Ok(row) => row.map(|row| reservation_from_row(&row)).transpose(),
            Err(e) => Err(self.fail(e, None)),
        }
    }

    async fn insert(&mut self, fingerprint: &Fingerprint) -> Result<Reservation, StoreError> {
        check_width(fingerprint)?;
        let sql = format!(
            r#"
            INSERT INTO {} (fingerprint)
            VALUES ($1)
            RETURNING id, fingerprint, created_at
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(fingerprint.as_str())
            .fetch_one(self.conn()?)
            .await;

        match result {
            Ok(row) => {
                self.pending_insert = Some(fingerprint.clone());
                reservation_from_row(&row)
            }
            Err(e) => Err(self.fail(e, Some(fingerprint))),
        }
    }

    async fn delete(&mut self, reservation: &Reservation) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        let result = sqlx::query(&sql)
            .bind(reservation.id)
            .execute(self.conn()?)
            .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) => Err(self.fail(e, None)),
        }
    }

    fn is_usable(&self) -> bool {
        self.tx.is_some() && !self.aborted
    }

    async fn recover(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            // An aborted transaction only accepts ROLLBACK.
            tx.rollback().await.map_err(|e| store_error(e, None))?;
        }

        let tx = self.pool.begin().await.map_err(|e| store_error(e, None))?;
        self.tx = Some(tx);
        self.aborted = false;
        self.pending_insert = None;
        debug!(table = %self.table, "reservation session reset");
        Ok(())
    }

    async fn release(self) -> Result<(), StoreError> {
        let Some(tx) = self.tx else {
            return Ok(());
        };

        if self.aborted {
            return tx.rollback().await.map_err(|e| store_error(e, None));
        }

        tx.commit()
            .await
            .map_err(|e| store_error(e, self.pending_insert.as_ref()))
    }
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation, StoreError> {
    let fingerprint: String = row.try_get("fingerprint").map_err(|e| store_error(e, None))?;
    Ok(Reservation {
        id: row.try_get("id").map_err(|e| store_error(e, None))?,
        fingerprint: Fingerprint::new(fingerprint)
            .map_err(|e| StoreError::Other(anyhow!("stored fingerprint is invalid: {e}")))?,
        created_at: row.try_get("created_at").map_err(|e| store_error(e, None))?,
    })
}

/// Map a sqlx error, recognising unique violations (SQLSTATE 23505) on
/// statements that wrote `fingerprint`.
fn store_error(err: sqlx::Error, fingerprint: Option<&Fingerprint>) -> StoreError {
    if let (sqlx::Error::Database(db_err), Some(fingerprint)) = (&err, fingerprint) {
        if db_err.is_unique_violation() {
            return StoreError::UniqueViolation {
                fingerprint: fingerprint.clone(),
            };
        }
    }
    StoreError::Other(anyhow::Error::from(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use turnstile_core::{AdmissionGate, Envelope, LifecycleEvent, ReleaseCoordinator};
    use turnstile_testing::RecordingHandler;

    fn fp(value: &str) -> Fingerprint {
        Fingerprint::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_table_name_validation() {
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();

        assert!(PgFingerprintStore::with_table(pool.clone(), "messenger_message_hash").is_ok());
        assert!(PgFingerprintStore::with_table(pool.clone(), "_hashes2").is_ok());
        assert!(PgFingerprintStore::with_table(pool.clone(), "").is_err());
        assert!(PgFingerprintStore::with_table(pool.clone(), "1hashes").is_err());
        assert!(PgFingerprintStore::with_table(pool, "hashes; DROP TABLE x").is_err());
    }

    #[test]
    fn test_column_width_is_enforced_before_insert() {
        assert!(check_width(&fp(&"x".repeat(MAX_FINGERPRINT_LENGTH))).is_ok());
        assert!(check_width(&fp(&"é".repeat(MAX_FINGERPRINT_LENGTH))).is_ok());
        assert!(matches!(
            check_width(&fp(&"x".repeat(MAX_FINGERPRINT_LENGTH + 1))),
            Err(StoreError::Other(_))
        ));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_schema_verifies(pool: PgPool) {
        PgFingerprintStore::new(pool).verify_schema().await.unwrap();
    }

    #[sqlx::test(migrations = false)]
    #[ignore = "requires DATABASE_URL"]
    async fn test_missing_unique_index_is_config_error(pool: PgPool) {
        sqlx::query("CREATE TABLE loose_hashes (id BIGSERIAL PRIMARY KEY, fingerprint TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        let store = PgFingerprintStore::with_table(pool.clone(), "loose_hashes").unwrap();

        let err = store.verify_schema().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingUniqueIndex { .. })
        ));

        let missing = PgFingerprintStore::with_table(pool, "absent_hashes").unwrap();
        let err = missing.verify_schema().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingTable { .. })
        ));
    }

    #[sqlx::test(migrations = false)]
    #[ignore = "requires DATABASE_URL"]
    async fn test_ensure_schema_creates_custom_table(pool: PgPool) {
        let store = PgFingerprintStore::with_table(pool, "custom_hashes").unwrap();
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        store.verify_schema().await.unwrap();
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_duplicate_insert_aborts_and_recovers(pool: PgPool) {
        let store = PgFingerprintStore::new(pool);

        let mut first = store.acquire().await.unwrap();
        first.insert(&fp("abc123")).await.unwrap();
        first.release().await.unwrap();

        let mut second = store.acquire().await.unwrap();
        let err = second.insert(&fp("abc123")).await.unwrap_err();
        assert!(err.is_unique_violation());
        assert!(!second.is_usable());
        assert!(matches!(
            second.find_by_fingerprint(&fp("abc123")).await,
            Err(StoreError::SessionClosed)
        ));

        second.recover().await.unwrap();
        assert!(second.is_usable());
        assert!(second.find_by_fingerprint(&fp("abc123")).await.unwrap().is_some());
        second.release().await.unwrap();
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_concurrent_admissions_admit_exactly_one(pool: PgPool) {
        let store = Arc::new(PgFingerprintStore::new(pool.clone()));
        let gate = AdmissionGate::new(store.clone());
        let handler = RecordingHandler::new();

        let attempts = (0..8).map(|i| {
            let gate = gate.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let envelope = Envelope::new(i).with_fingerprint(fp("abc123"));
                gate.handle(envelope, |envelope| handler.handle(envelope))
                    .await
                    .unwrap();
            })
        });
        for joined in join_all(attempts).await {
            joined.unwrap();
        }

        assert_eq!(handler.calls(), 1);
        let rows: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM fingerprint_reservations WHERE fingerprint = 'abc123'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(rows, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_release_makes_fingerprint_admissible_again(pool: PgPool) {
        let store = Arc::new(PgFingerprintStore::new(pool));
        let gate = AdmissionGate::new(store.clone());
        let coordinator = ReleaseCoordinator::new(store.clone());
        let envelope = Envelope::new("job").with_fingerprint(fp("abc123"));

        assert!(gate.admit(envelope.clone()).await.unwrap().is_pass_through());
        assert!(gate.admit(envelope.clone()).await.unwrap().is_short_circuit());

        let event = LifecycleEvent::Handled {
            envelope: envelope.clone(),
        };
        coordinator.on_lifecycle(&event).await.unwrap();
        coordinator.on_lifecycle(&event).await.unwrap();

        assert!(gate.admit(envelope).await.unwrap().is_pass_through());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_delete_created_before(pool: PgPool) {
        let store = PgFingerprintStore::new(pool.clone());
        sqlx::query(
            r#"
            INSERT INTO fingerprint_reservations (fingerprint, created_at)
            VALUES ('old', NOW() - INTERVAL '2 hours'), ('new', NOW())
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let removed = store
            .delete_created_before(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let mut session = store.acquire().await.unwrap();
        assert!(session.find_by_fingerprint(&fp("new")).await.unwrap().is_some());
        assert!(session.find_by_fingerprint(&fp("old")).await.unwrap().is_none());
    }
}
