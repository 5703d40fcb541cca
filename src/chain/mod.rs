//! Chain module - RPC access for nonce reconciliation and batched rebroadcast
//!
//! This module provides:
//! - The narrow `ChainClient` capability consumed by the resender
//! - Multi-RPC provider management with automatic failover
//! - Per-call timeouts so a batch fails rather than hangs

pub mod client;

pub use client::RpcClient;

use crate::error::Result;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};

/// One element of a batched broadcast. Carries its own result/error slot,
/// populated by the client; a batch never fails as a whole because one
/// element was rejected.
#[derive(Debug, Clone)]
pub struct BatchCall {
    /// Signed raw transaction bytes
    pub signed_raw: Bytes,
    /// Transaction hash on success
    pub result: Option<H256>,
    /// Node-side rejection or transport error for this element
    pub error: Option<String>,
}

impl BatchCall {
    pub fn new(signed_raw: Bytes) -> Self {
        Self {
            signed_raw,
            result: None,
            error: None,
        }
    }
}

/// Chain access needed by the resender
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current on-chain nonce for an address
    async fn sequence_at(&self, address: Address) -> Result<u64>;

    /// Submit a group of signed transactions in one round-trip, filling
    /// each element's result or error slot
    async fn batch_send_raw(&self, batch: &mut [BatchCall]) -> Result<()>;
}
