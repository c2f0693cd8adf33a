//! Watchtower clients
//!
//! A watchtower observes the same burn the service saw and co-signs its
//! message hash. Local watchtowers hold a key in-process; remote ones are
//! reached over HTTP.

use std::time::Duration;

use alloy::primitives::Bytes;
use async_trait::async_trait;
use eyre::WrapErr;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::signing::LocalSigner;
use crate::types::Attestation;

#[async_trait]
pub trait Watchtower: Send + Sync {
    fn id(&self) -> &str;

    /// Produce this watchtower's signature over `attestation.message_hash`
    async fn sign(&self, attestation: &Attestation) -> BridgeResult<Bytes>;
}

/// In-process watchtower backed by a [`LocalSigner`]
#[derive(Debug, Clone)]
pub struct LocalWatchtower {
    id: String,
    signer: LocalSigner,
}

impl LocalWatchtower {
    pub fn new(id: impl Into<String>, signer: LocalSigner) -> Self {
        Self {
            id: id.into(),
            signer,
        }
    }

    pub fn signer(&self) -> &LocalSigner {
        &self.signer
    }
}

#[async_trait]
impl Watchtower for LocalWatchtower {
    fn id(&self) -> &str {
        &self.id
    }

    async fn sign(&self, attestation: &Attestation) -> BridgeResult<Bytes> {
        // Recompute rather than trust the stored hash
        let hash = attestation.payload().message_hash();
        if hash != attestation.message_hash {
            return Err(BridgeError::PayloadMismatch(attestation.key().to_string()));
        }
        self.signer.sign(&hash)
    }
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: Bytes,
}

/// Remote watchtower: `POST {url}/sign` with the attestation JSON
#[derive(Debug, Clone)]
pub struct HttpWatchtower {
    id: String,
    url: String,
    client: Client,
}

impl HttpWatchtower {
    pub fn new(id: impl Into<String>, url: impl Into<String>, timeout: Duration) -> eyre::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to create HTTP client")?;
        Ok(Self {
            id: id.into(),
            url: url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Watchtower for HttpWatchtower {
    fn id(&self) -> &str {
        &self.id
    }

    async fn sign(&self, attestation: &Attestation) -> BridgeResult<Bytes> {
        let url = format!("{}/sign", self.url);
        debug!(watchtower = %self.id, url = %url, key = %attestation.key(), "Requesting signature");

        let response = self
            .client
            .post(&url)
            .json(attestation)
            .send()
            .await
            .map_err(|e| BridgeError::ChainSubmission(format!("watchtower {} unreachable: {}", self.id, e)))?;

        if !response.status().is_success() {
            return Err(BridgeError::ChainSubmission(format!(
                "watchtower {} returned {}",
                self.id,
                response.status()
            )));
        }

        let body: SignResponse = response.json().await.map_err(|e| {
            BridgeError::InvalidSignature {
                watchtower: format!("{} (bad response: {})", self.id, e),
            }
        })?;
        Ok(body.signature)
    }
}
