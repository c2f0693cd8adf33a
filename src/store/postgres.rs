//! PostgreSQL attestation store
//!
//! Per-key serialization uses `SELECT ... FOR UPDATE` inside a transaction.
//! The status trigger in `migrations/` rejects non-monotonic transitions even
//! if a writer bypasses this module.

use std::sync::Arc;

use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, error};

use super::{apply_failed, apply_relayed, apply_signature, check_payload, AttestationStore, StoreStats};
use crate::error::{BridgeError, BridgeResult};
use crate::signing::WatchtowerSet;
use crate::types::{
    Amount, Attestation, AttestationKey, AttestationStatus, ChainAddress, ChainId, NewAttestation,
    SignatureEntry,
};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

// amount is NUMERIC(78,0); cast to TEXT since sqlx can't decode NUMERIC into String
const SELECT_ATTESTATION: &str = r#"
    SELECT source_chain_id, nonce, dest_chain_id, token, recipient, amount::TEXT AS amount,
           source_tx_hash, message_hash, mint_id, status, created_at, ready_at, relayed_at,
           dest_tx_hash, failure_reason, relay_attempts
    FROM attestations
"#;

pub struct PostgresStore {
    pool: PgPool,
    watchtowers: Arc<WatchtowerSet>,
}

impl PostgresStore {
    pub fn new(pool: PgPool, watchtowers: Arc<WatchtowerSet>) -> Self {
        Self { pool, watchtowers }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_signatures<'e, E>(executor: E, key: AttestationKey) -> BridgeResult<Vec<SignatureEntry>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let rows = sqlx::query(
            r#"SELECT watchtower_id, signature, signed_at FROM attestation_signatures
               WHERE source_chain_id = $1 AND nonce = $2
               ORDER BY signed_at, watchtower_id"#,
        )
        .bind(chain_to_db(key.source_chain_id))
        .bind(nonce_to_db(key.nonce)?)
        .fetch_all(executor)
        .await?;

        rows.iter()
            .map(|row| -> BridgeResult<SignatureEntry> {
                Ok(SignatureEntry {
                    watchtower_id: row.try_get("watchtower_id")?,
                    signature: Bytes::from(row.try_get::<Vec<u8>, _>("signature")?),
                    signed_at: row.try_get("signed_at")?,
                })
            })
            .collect()
    }

    /// Lock the row for `key` inside `tx` and load it with its signatures
    async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        key: AttestationKey,
    ) -> BridgeResult<Attestation> {
        let row = sqlx::query(&format!(
            "{} WHERE source_chain_id = $1 AND nonce = $2 FOR UPDATE",
            SELECT_ATTESTATION
        ))
        .bind(chain_to_db(key.source_chain_id))
        .bind(nonce_to_db(key.nonce)?)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(BridgeError::NotFound)?;

        let signatures = Self::load_signatures(&mut **tx, key).await?;
        row_to_attestation(&row, signatures)
    }

    async fn write_state(tx: &mut Transaction<'_, Postgres>, a: &Attestation) -> BridgeResult<()> {
        sqlx::query(
            r#"UPDATE attestations
               SET status = $3, ready_at = $4, relayed_at = $5, dest_tx_hash = $6,
                   failure_reason = $7, relay_attempts = $8, updated_at = NOW()
               WHERE source_chain_id = $1 AND nonce = $2"#,
        )
        .bind(chain_to_db(a.source_chain_id))
        .bind(nonce_to_db(a.nonce)?)
        .bind(a.status.as_str())
        .bind(a.ready_at)
        .bind(a.relayed_at)
        .bind(a.dest_tx_hash.map(|h| h.to_vec()))
        .bind(&a.failure_reason)
        .bind(a.relay_attempts as i32)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Run `f` against the locked attestation and persist its new state
    async fn update<F>(&self, key: AttestationKey, f: F) -> BridgeResult<Attestation>
    where
        F: FnOnce(&mut Attestation) -> BridgeResult<()> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut attestation = Self::lock(&mut tx, key).await?;
        f(&mut attestation)?;
        Self::write_state(&mut tx, &attestation).await?;
        tx.commit().await?;
        Ok(attestation)
    }

    async fn list_by_status(&self, status: AttestationStatus, order_by: &str) -> BridgeResult<Vec<Attestation>> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = $1 ORDER BY {}, source_chain_id, nonce",
            SELECT_ATTESTATION, order_by
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("SQL error listing {} attestations: {:?}", status, e);
            e
        })?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = row_key(row)?;
            let signatures = Self::load_signatures(&self.pool, key).await?;
            out.push(row_to_attestation(row, signatures)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl AttestationStore for PostgresStore {
    async fn get_or_create(&self, payload: &NewAttestation) -> BridgeResult<Attestation> {
        let candidate = Attestation::new(payload.clone(), Utc::now());

        let inserted = sqlx::query(
            r#"
            INSERT INTO attestations (source_chain_id, nonce, dest_chain_id, token, recipient, amount,
                source_tx_hash, message_hash, mint_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7, $8, $9, 'pending', $10)
            ON CONFLICT (source_chain_id, nonce) DO NOTHING
            "#,
        )
        .bind(chain_to_db(candidate.source_chain_id))
        .bind(nonce_to_db(candidate.nonce)?)
        .bind(chain_to_db(candidate.dest_chain_id))
        .bind(candidate.token.as_slice())
        .bind(candidate.recipient.as_slice())
        .bind(candidate.amount.to_string())
        .bind(candidate.source_tx_hash.as_slice())
        .bind(candidate.message_hash.as_slice())
        .bind(candidate.mint_id.as_slice())
        .bind(candidate.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            debug!(key = %candidate.key(), message_hash = %candidate.message_hash, "Created attestation");
            return Ok(candidate);
        }

        let existing = self.find_by_nonce(payload.key()).await?;
        check_payload(&existing, payload)?;
        Ok(existing)
    }

    async fn add_signature(
        &self,
        key: AttestationKey,
        watchtower_id: &str,
        signature: Bytes,
    ) -> BridgeResult<Attestation> {
        let mut tx = self.pool.begin().await?;
        let mut attestation = Self::lock(&mut tx, key).await?;
        let now = Utc::now();

        let changed = apply_signature(&mut attestation, &self.watchtowers, watchtower_id, signature.clone(), now)?;
        if changed {
            sqlx::query(
                r#"INSERT INTO attestation_signatures (source_chain_id, nonce, watchtower_id, signature, signed_at)
                   VALUES ($1, $2, $3, $4, $5)
                   ON CONFLICT DO NOTHING"#,
            )
            .bind(chain_to_db(key.source_chain_id))
            .bind(nonce_to_db(key.nonce)?)
            .bind(watchtower_id)
            .bind(signature.to_vec())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            Self::write_state(&mut tx, &attestation).await?;
        }
        tx.commit().await?;
        Ok(attestation)
    }

    async fn mark_relayed(&self, key: AttestationKey, dest_tx_hash: B256) -> BridgeResult<Attestation> {
        let now = Utc::now();
        self.update(key, move |a| apply_relayed(a, dest_tx_hash, now)).await
    }

    async fn mark_failed(&self, key: AttestationKey, reason: &str) -> BridgeResult<Attestation> {
        let reason = reason.to_string();
        self.update(key, move |a| apply_failed(a, &reason)).await
    }

    async fn expire_pending(&self, key: AttestationKey, reason: &str) -> BridgeResult<Option<Attestation>> {
        let mut tx = self.pool.begin().await?;
        let mut attestation = Self::lock(&mut tx, key).await?;
        if attestation.status != AttestationStatus::Pending {
            tx.rollback().await?;
            return Ok(None);
        }
        apply_failed(&mut attestation, reason)?;
        Self::write_state(&mut tx, &attestation).await?;
        tx.commit().await?;
        Ok(Some(attestation))
    }

    async fn record_relay_attempt(
        &self,
        key: AttestationKey,
        error: Option<&str>,
    ) -> BridgeResult<Attestation> {
        let error = error.map(str::to_string);
        self.update(key, move |a| {
            a.relay_attempts += 1;
            if let Some(error) = error {
                a.failure_reason = Some(error);
            }
            Ok(())
        })
        .await
    }

    async fn find_by_nonce(&self, key: AttestationKey) -> BridgeResult<Attestation> {
        let row = sqlx::query(&format!(
            "{} WHERE source_chain_id = $1 AND nonce = $2",
            SELECT_ATTESTATION
        ))
        .bind(chain_to_db(key.source_chain_id))
        .bind(nonce_to_db(key.nonce)?)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BridgeError::NotFound)?;

        let signatures = Self::load_signatures(&self.pool, key).await?;
        row_to_attestation(&row, signatures)
    }

    async fn list_ready(&self) -> BridgeResult<Vec<Attestation>> {
        self.list_by_status(AttestationStatus::Ready, "ready_at").await
    }

    async fn list_pending(&self) -> BridgeResult<Vec<Attestation>> {
        self.list_by_status(AttestationStatus::Pending, "created_at").await
    }

    async fn stats(&self, stuck_before: DateTime<Utc>) -> BridgeResult<StoreStats> {
        let row = sqlx::query(
            r#"SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'ready') AS ready,
                COUNT(*) FILTER (WHERE status = 'relayed') AS relayed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'pending' AND created_at < $1) AS stuck
               FROM attestations"#,
        )
        .bind(stuck_before)
        .fetch_one(&self.pool)
        .await?;

        let get = |name: &str| -> BridgeResult<u64> { u64_from_db(row.try_get(name)?, name) };
        Ok(StoreStats {
            total: get("total")?,
            pending: get("pending")?,
            ready: get("ready")?,
            relayed: get("relayed")?,
            failed: get("failed")?,
            stuck: get("stuck")?,
        })
    }

    async fn last_processed_block(&self, chain_id: ChainId) -> BridgeResult<Option<u64>> {
        let row: Option<(i64,)> =
            sqlx::query_as(r#"SELECT last_processed_block FROM chain_cursors WHERE chain_id = $1"#)
                .bind(chain_to_db(chain_id))
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| u64_from_db(r.0, "last_processed_block")).transpose()
    }

    async fn set_last_processed_block(&self, chain_id: ChainId, block: u64) -> BridgeResult<()> {
        let block = i64::try_from(block)
            .map_err(|_| BridgeError::Storage(format!("block {} out of range", block)))?;
        sqlx::query(
            r#"
            INSERT INTO chain_cursors (chain_id, last_processed_block)
            VALUES ($1, $2)
            ON CONFLICT (chain_id) DO UPDATE SET last_processed_block = $2, updated_at = NOW()
            "#,
        )
        .bind(chain_to_db(chain_id))
        .bind(block)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ping(&self) -> BridgeResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn chain_to_db(chain_id: ChainId) -> i64 {
    chain_id.to_u32() as i64
}

fn nonce_to_db(nonce: u64) -> BridgeResult<i64> {
    i64::try_from(nonce).map_err(|_| BridgeError::Storage(format!("nonce {} exceeds BIGINT", nonce)))
}

fn u64_from_db(value: i64, column: &str) -> BridgeResult<u64> {
    u64::try_from(value).map_err(|_| BridgeError::Storage(format!("{} is negative: {}", column, value)))
}

fn chain_from_db(value: i64) -> BridgeResult<ChainId> {
    u32::try_from(value)
        .map(ChainId)
        .map_err(|_| BridgeError::Storage(format!("chain id {} out of range", value)))
}

fn b256_from_db(bytes: &[u8], column: &str) -> BridgeResult<B256> {
    B256::try_from(bytes).map_err(|_| BridgeError::Storage(format!("{} is not 32 bytes", column)))
}

fn address_from_db(bytes: &[u8], column: &str) -> BridgeResult<ChainAddress> {
    ChainAddress::from_hex(&hex::encode(bytes))
        .map_err(|e| BridgeError::Storage(format!("{}: {}", column, e)))
}

fn row_key(row: &PgRow) -> BridgeResult<AttestationKey> {
    Ok(AttestationKey::new(
        chain_from_db(row.try_get("source_chain_id")?)?,
        u64_from_db(row.try_get("nonce")?, "nonce")?,
    ))
}

fn row_to_attestation(row: &PgRow, signatures: Vec<SignatureEntry>) -> BridgeResult<Attestation> {
    let amount: String = row.try_get("amount")?;
    let status: String = row.try_get("status")?;
    let dest_tx_hash: Option<Vec<u8>> = row.try_get("dest_tx_hash")?;

    Ok(Attestation {
        source_chain_id: chain_from_db(row.try_get("source_chain_id")?)?,
        dest_chain_id: chain_from_db(row.try_get("dest_chain_id")?)?,
        nonce: u64_from_db(row.try_get("nonce")?, "nonce")?,
        token: address_from_db(&row.try_get::<Vec<u8>, _>("token")?, "token")?,
        recipient: address_from_db(&row.try_get::<Vec<u8>, _>("recipient")?, "recipient")?,
        amount: amount
            .parse::<Amount>()
            .map_err(|e| BridgeError::Storage(e.to_string()))?,
        source_tx_hash: b256_from_db(&row.try_get::<Vec<u8>, _>("source_tx_hash")?, "source_tx_hash")?,
        message_hash: b256_from_db(&row.try_get::<Vec<u8>, _>("message_hash")?, "message_hash")?,
        mint_id: b256_from_db(&row.try_get::<Vec<u8>, _>("mint_id")?, "mint_id")?,
        signatures,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        ready_at: row.try_get("ready_at")?,
        relayed_at: row.try_get("relayed_at")?,
        dest_tx_hash: dest_tx_hash
            .map(|h| b256_from_db(&h, "dest_tx_hash"))
            .transpose()?,
        failure_reason: row.try_get("failure_reason")?,
        relay_attempts: u32::try_from(row.try_get::<i32, _>("relay_attempts")?)
            .map_err(|_| BridgeError::Storage("relay_attempts is negative".into()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_range() {
        assert_eq!(nonce_to_db(42).unwrap(), 42);
        assert!(nonce_to_db(u64::MAX).is_err());
    }

    #[test]
    fn test_negative_columns_rejected() {
        assert_eq!(u64_from_db(7, "nonce").unwrap(), 7);
        assert!(matches!(u64_from_db(-1, "nonce"), Err(BridgeError::Storage(_))));
    }

    #[test]
    fn test_address_width_round_trip() {
        let evm = address_from_db(&[0xab; 20], "token").unwrap();
        assert_eq!(evm, ChainAddress::Evm([0xab; 20]));
        let sub = address_from_db(&[0xcd; 32], "recipient").unwrap();
        assert_eq!(sub, ChainAddress::Substrate([0xcd; 32]));
        assert!(address_from_db(&[0u8; 7], "token").is_err());
    }

    #[test]
    fn test_b256_length_checked() {
        assert!(b256_from_db(&[0u8; 32], "x").is_ok());
        assert!(b256_from_db(&[0u8; 31], "x").is_err());
    }
}
