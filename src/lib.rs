//! Ëtrid Bridge - attestation service and relayer
//!
//! Re-exports internal modules for use in integration tests.

pub mod adapters;
pub mod api;
pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod relayer;
pub mod retry;
pub mod service;
pub mod signing;
pub mod store;
pub mod types;
pub mod watchers;
pub mod watchtower;

pub use error::{BridgeError, BridgeResult};
