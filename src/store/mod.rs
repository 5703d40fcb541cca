//! Transaction store - durable record of transactions and their attempts
//!
//! The resender only ever talks to the `TxStore` trait; the crate ships an
//! in-memory implementation and embedders may bring a persistent one.

pub mod memory;

pub use memory::InMemoryTxStore;

use crate::error::Result;
use crate::tx::types::{Tx, TxAttempt, TxState};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use uuid::Uuid;

/// Storage operations used during reconciliation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxStore: Send + Sync {
    /// Insert a transaction, returning the store-assigned ID
    async fn insert_tx(&self, tx: Tx) -> Result<Uuid>;

    async fn get_tx_by_id(&self, id: Uuid) -> Result<Tx>;

    /// Unconfirmed transactions for an address, ordered by sequence ascending
    async fn find_unconfirmed(&self, from_address: Address) -> Result<Vec<Tx>>;

    async fn count_unconfirmed(&self, from_address: Address) -> Result<u32>;

    async fn update_tx_state(&self, id: Uuid, state: TxState) -> Result<()>;

    /// Append a broadcast attempt and refresh the broadcast timestamp
    async fn save_attempt(
        &self,
        id: Uuid,
        attempt: TxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Refresh the broadcast timestamp without a new attempt (rebroadcast
    /// of an existing attempt at its last fee)
    async fn update_broadcast_at(&self, id: Uuid, broadcast_at: DateTime<Utc>) -> Result<()>;
}
