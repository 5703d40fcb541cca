//! In-memory transaction store

use super::TxStore;
use crate::error::{Error, Result};
use crate::tx::types::{Tx, TxAttempt, TxState};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Transaction store backed by a process-local map
pub struct InMemoryTxStore {
    txs: RwLock<HashMap<Uuid, Tx>>,
}

impl InMemoryTxStore {
    pub fn new() -> Self {
        Self {
            txs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxStore for InMemoryTxStore {
    async fn insert_tx(&self, mut tx: Tx) -> Result<Uuid> {
        let id = Uuid::new_v4();
        tx.id = id;
        for attempt in &mut tx.attempts {
            attempt.tx_id = id;
        }
        self.txs.write().await.insert(id, tx);
        Ok(id)
    }

    async fn get_tx_by_id(&self, id: Uuid) -> Result<Tx> {
        self.txs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::TxNotFound { tx_id: id })
    }

    async fn find_unconfirmed(&self, from_address: Address) -> Result<Vec<Tx>> {
        let mut txs: Vec<Tx> = self
            .txs
            .read()
            .await
            .values()
            .filter(|tx| tx.from_address == from_address && tx.state == TxState::Unconfirmed)
            .cloned()
            .collect();

        txs.sort_by_key(|tx| tx.sequence);
        Ok(txs)
    }

    async fn count_unconfirmed(&self, from_address: Address) -> Result<u32> {
        let count = self
            .txs
            .read()
            .await
            .values()
            .filter(|tx| tx.from_address == from_address && tx.state == TxState::Unconfirmed)
            .count();
        Ok(count as u32)
    }

    async fn update_tx_state(&self, id: Uuid, state: TxState) -> Result<()> {
        let mut txs = self.txs.write().await;
        let tx = txs.get_mut(&id).ok_or(Error::TxNotFound { tx_id: id })?;
        tx.state = state;
        Ok(())
    }

    async fn save_attempt(
        &self,
        id: Uuid,
        attempt: TxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut txs = self.txs.write().await;
        let tx = txs.get_mut(&id).ok_or(Error::TxNotFound { tx_id: id })?;
        tx.attempts.push(attempt);
        tx.broadcast_at = Some(broadcast_at);
        if tx.initial_broadcast_at.is_none() {
            tx.initial_broadcast_at = Some(broadcast_at);
        }
        Ok(())
    }

    async fn update_broadcast_at(&self, id: Uuid, broadcast_at: DateTime<Utc>) -> Result<()> {
        let mut txs = self.txs.write().await;
        let tx = txs.get_mut(&id).ok_or(Error::TxNotFound { tx_id: id })?;
        tx.broadcast_at = Some(broadcast_at);
        Ok(())
    }
}
