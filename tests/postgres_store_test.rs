//! Attestation store contract against a live PostgreSQL
//!
//! Run with: DATABASE_URL=postgres://... cargo test --test postgres_store_test -- --ignored
//!
//! Rows are never deleted, so each test uses nonces derived from the clock.

use std::sync::Arc;

use alloy::primitives::B256;
use chrono::Utc;

use etrid_bridge::signing::{LocalSigner, SignatureScheme, WatchtowerSet};
use etrid_bridge::store::{postgres, AttestationStore, PostgresStore};
use etrid_bridge::types::{Amount, AttestationStatus, ChainAddress, ChainId, NewAttestation};
use etrid_bridge::BridgeError;

fn signers() -> Vec<LocalSigner> {
    (1..=3u8)
        .map(|n| LocalSigner::from_hex(SignatureScheme::Secp256k1, &hex::encode([n; 32])).unwrap())
        .collect()
}

async fn store() -> Option<(PostgresStore, Vec<LocalSigner>)> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = postgres::create_pool(&url).await.ok()?;
    postgres::run_migrations(&pool).await.unwrap();

    let signers = signers();
    let keys = signers
        .iter()
        .enumerate()
        .map(|(i, s)| s.watchtower_key(format!("wt-{}", i)))
        .collect();
    let set = Arc::new(WatchtowerSet::new(2, keys).unwrap());
    Some((PostgresStore::new(pool, set), signers))
}

fn fresh_nonce() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64 >> 1
}

fn payload(nonce: u64) -> NewAttestation {
    NewAttestation {
        source_chain_id: ChainId::ETHEREUM,
        dest_chain_id: ChainId::ETRID,
        nonce,
        token: ChainAddress::Evm([0x70; 20]),
        recipient: ChainAddress::Substrate([0xb0; 32]),
        amount: Amount::from(400_000_000_000_000_000_000u128),
        source_tx_hash: B256::repeat_byte(0x11),
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_lifecycle() {
    let Some((store, signers)) = store().await else {
        eprintln!("SKIPPED: DATABASE_URL not set or unreachable");
        return;
    };
    store.ping().await.unwrap();

    let nonce = fresh_nonce();
    let created = store.get_or_create(&payload(nonce)).await.unwrap();
    assert_eq!(created.status, AttestationStatus::Pending);

    // idempotent
    let again = store.get_or_create(&payload(nonce)).await.unwrap();
    assert_eq!(again.mint_id, created.mint_id);
    assert_eq!(again.amount, created.amount);

    // same key, different payload
    let mut other = payload(nonce);
    other.amount = Amount::from(1u128);
    assert!(matches!(
        store.get_or_create(&other).await,
        Err(BridgeError::PayloadMismatch(_))
    ));

    let key = created.key();
    let forged = signers[1].sign(&created.message_hash).unwrap();
    assert!(matches!(
        store.add_signature(key, "wt-0", forged).await,
        Err(BridgeError::InvalidSignature { .. })
    ));

    let sig0 = signers[0].sign(&created.message_hash).unwrap();
    let att = store.add_signature(key, "wt-0", sig0.clone()).await.unwrap();
    assert_eq!(att.status, AttestationStatus::Pending);
    let att = store.add_signature(key, "wt-0", sig0).await.unwrap();
    assert_eq!(att.signature_count(), 1);

    // relayed before ready is refused
    assert!(matches!(
        store.mark_relayed(key, B256::repeat_byte(0x22)).await,
        Err(BridgeError::InvalidTransition { .. })
    ));

    let sig1 = signers[1].sign(&created.message_hash).unwrap();
    let att = store.add_signature(key, "wt-1", sig1).await.unwrap();
    assert_eq!(att.status, AttestationStatus::Ready);
    assert!(att.ready_at.is_some());

    let ready = store.list_ready().await.unwrap();
    assert!(ready.iter().any(|a| a.key() == key));

    let att = store.record_relay_attempt(key, Some("underpriced")).await.unwrap();
    assert_eq!(att.relay_attempts, 1);

    let att = store.mark_relayed(key, B256::repeat_byte(0x22)).await.unwrap();
    assert_eq!(att.status, AttestationStatus::Relayed);
    assert_eq!(att.dest_tx_hash, Some(B256::repeat_byte(0x22)));

    assert!(matches!(
        store.mark_failed(key, "late").await,
        Err(BridgeError::InvalidTransition { .. })
    ));

    let found = store.find_by_nonce(key).await.unwrap();
    assert_eq!(found.status, AttestationStatus::Relayed);
    assert_eq!(found.signature_count(), 2);
    assert_eq!(found.amount, payload(nonce).amount);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_concurrent_signatures() {
    let Some((store, signers)) = store().await else {
        eprintln!("SKIPPED: DATABASE_URL not set or unreachable");
        return;
    };
    let store = Arc::new(store);
    let att = store.get_or_create(&payload(fresh_nonce())).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        for (i, signer) in signers.iter().enumerate() {
            let store = store.clone();
            let sig = signer.sign(&att.message_hash).unwrap();
            let key = att.key();
            handles.push(tokio::spawn(async move {
                let id = format!("wt-{}", i);
                store.add_signature(key, &id, sig).await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let att = store.find_by_nonce(att.key()).await.unwrap();
    assert_eq!(att.status, AttestationStatus::Ready);
    assert_eq!(att.signature_count(), 3);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_cursor_and_stats() {
    let Some((store, _signers)) = store().await else {
        eprintln!("SKIPPED: DATABASE_URL not set or unreachable");
        return;
    };

    let block = fresh_nonce() % 1_000_000;
    store
        .set_last_processed_block(ChainId::OPTIMISM, block)
        .await
        .unwrap();
    assert_eq!(
        store.last_processed_block(ChainId::OPTIMISM).await.unwrap(),
        Some(block)
    );

    store.get_or_create(&payload(fresh_nonce())).await.unwrap();
    let stats = store.stats(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
    assert!(stats.total >= 1);
    assert!(stats.pending >= 1);
    assert!(stats.stuck >= 1);
}
