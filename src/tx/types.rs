//! Transaction and attempt value types shared by the store and the resender

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use uuid::Uuid;

/// Lifecycle state of a tracked transaction
///
/// Reconciliation only moves transactions from Unconfirmed to Confirmed;
/// the remaining states belong to the submission path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Unstarted,
    InProgress,
    Unconfirmed,
    Confirmed,
    ConfirmedMissingReceipt,
    FatalError,
}

/// Fee for a single attempt, legacy or EIP-1559
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fee {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl Fee {
    /// Componentwise comparison: true when every component of `self` is at
    /// least the matching component of `other`. Mixed fee kinds never cover
    /// each other.
    pub fn covers(&self, other: &Fee) -> bool {
        match (self, other) {
            (Fee::Legacy(a), Fee::Legacy(b)) => a >= b,
            (
                Fee::Eip1559 {
                    max_fee_per_gas: a_max,
                    max_priority_fee_per_gas: a_prio,
                },
                Fee::Eip1559 {
                    max_fee_per_gas: b_max,
                    max_priority_fee_per_gas: b_prio,
                },
            ) => a_max >= b_max && a_prio >= b_prio,
            _ => false,
        }
    }
}

/// Broadcast state of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    InProgress,
    Broadcast,
}

/// One signed broadcast of a transaction at a particular fee
#[derive(Debug, Clone)]
pub struct TxAttempt {
    pub tx_id: Uuid,
    pub fee: Fee,
    pub gas_limit: u64,
    pub hash: H256,
    pub signed_raw: Bytes,
    pub state: AttemptState,
    pub created_at: DateTime<Utc>,
}

/// A tracked transaction and its attempts
#[derive(Debug, Clone)]
pub struct Tx {
    /// Store-assigned ID; nil until inserted
    pub id: Uuid,
    /// Nonce; None until assigned by the submission path
    pub sequence: Option<u64>,
    pub from_address: Address,
    pub to_address: Address,
    pub encoded_payload: Bytes,
    pub value: U256,
    /// Gas limit
    pub fee_limit: u64,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub initial_broadcast_at: Option<DateTime<Utc>>,
    pub state: TxState,
    pub attempts: Vec<TxAttempt>,
}

impl Tx {
    /// Most recently created attempt, if any
    pub fn latest_attempt(&self) -> Option<&TxAttempt> {
        self.attempts.last()
    }

    /// Number of bump cycles this tx has been through: every attempt past
    /// the first market-fee broadcast was a bump.
    pub fn bump_count(&self) -> u32 {
        self.attempts.len().saturating_sub(1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_covers_legacy() {
        let low = Fee::Legacy(U256::from(10));
        let high = Fee::Legacy(U256::from(12));
        assert!(high.covers(&low));
        assert!(high.covers(&high));
        assert!(!low.covers(&high));
    }

    #[test]
    fn fee_covers_eip1559_componentwise() {
        let prev = Fee::Eip1559 {
            max_fee_per_gas: U256::from(100),
            max_priority_fee_per_gas: U256::from(2),
        };
        let bumped = Fee::Eip1559 {
            max_fee_per_gas: U256::from(120),
            max_priority_fee_per_gas: U256::from(3),
        };
        let lopsided = Fee::Eip1559 {
            max_fee_per_gas: U256::from(120),
            max_priority_fee_per_gas: U256::from(1),
        };
        assert!(bumped.covers(&prev));
        assert!(!lopsided.covers(&prev));
    }

    #[test]
    fn fee_kinds_never_cover_each_other() {
        let legacy = Fee::Legacy(U256::from(100));
        let dynamic = Fee::Eip1559 {
            max_fee_per_gas: U256::from(100),
            max_priority_fee_per_gas: U256::from(2),
        };
        assert!(!legacy.covers(&dynamic));
        assert!(!dynamic.covers(&legacy));
    }
}
