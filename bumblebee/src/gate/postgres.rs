//! Postgres-backed gate store
//!
//! The advisory lock is session-scoped, so the store keeps one dedicated
//! connection for its whole lifetime; losing the connection releases the
//! lock, which is exactly the crash behavior the gate wants.

use std::collections::HashSet;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Connection, PgConnection};

use super::{GateStore, MigrationStep};
use crate::config::Settings;
use crate::error::Result;

const CREATE_STEP_TABLE: &str = "CREATE TABLE IF NOT EXISTS bumblebee_schema_step (
    name TEXT PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const CREATE_GENERATION_TABLE: &str = "CREATE TABLE IF NOT EXISTS bumblebee_generation (
    onerow BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (onerow),
    generation TEXT NOT NULL,
    migrated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

/// Derive a stable advisory-lock key from the deployment namespace.
fn advisory_lock_key(namespace: &str) -> i64 {
    let digest = Sha256::digest(format!("{namespace}:migration-gate").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Gate store over a single Postgres connection.
pub struct PgGateStore {
    conn: PgConnection,
    lock_key: i64,
    holds_lock: bool,
}

impl PgGateStore {
    /// Connect and ensure the bookkeeping tables exist.
    ///
    /// # Errors
    ///
    /// Fails when the datastore is unreachable or the bookkeeping DDL is
    /// rejected.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let mut conn = PgConnection::connect(&settings.database.url()).await?;
        sqlx::query(CREATE_STEP_TABLE).execute(&mut conn).await?;
        sqlx::query(CREATE_GENERATION_TABLE)
            .execute(&mut conn)
            .await?;
        Ok(Self {
            conn,
            lock_key: advisory_lock_key(&settings.broker.namespace),
            holds_lock: false,
        })
    }
}

#[async_trait]
impl GateStore for PgGateStore {
    async fn try_lock(&mut self) -> Result<bool> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut self.conn)
            .await?;
        self.holds_lock = acquired;
        Ok(acquired)
    }

    async fn unlock(&mut self) -> Result<()> {
        if self.holds_lock {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.lock_key)
                .execute(&mut self.conn)
                .await?;
            self.holds_lock = false;
        }
        Ok(())
    }

    async fn last_generation(&mut self) -> Result<Option<String>> {
        let generation: Option<String> =
            sqlx::query_scalar("SELECT generation FROM bumblebee_generation")
                .fetch_optional(&mut self.conn)
                .await?;
        Ok(generation)
    }

    async fn applied_steps(&mut self) -> Result<HashSet<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM bumblebee_schema_step")
            .fetch_all(&mut self.conn)
            .await?;
        Ok(names.into_iter().collect())
    }

    async fn apply_step(&mut self, step: &MigrationStep) -> Result<()> {
        // Step SQL and its completion marker commit together: a crash in
        // between rolls both back, so the replay sees an unapplied step.
        let mut tx = self.conn.begin().await?;
        sqlx::query(step.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO bumblebee_schema_step (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(step.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_generation(&mut self, generation: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO bumblebee_generation (onerow, generation) VALUES (TRUE, $1)
             ON CONFLICT (onerow)
             DO UPDATE SET generation = EXCLUDED.generation, migrated_at = now()",
        )
        .bind(generation)
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable_and_namespace_scoped() {
        assert_eq!(
            advisory_lock_key("bumblebee"),
            advisory_lock_key("bumblebee")
        );
        assert_ne!(advisory_lock_key("bumblebee"), advisory_lock_key("staging"));
    }
}
