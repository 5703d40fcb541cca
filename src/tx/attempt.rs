//! Building and signing broadcast attempts

use crate::error::{Error, Result};
use crate::keystore::KeyStore;
use crate::tx::fees::FeeEstimator;
use crate::tx::types::{AttemptState, Fee, Tx, TxAttempt};

use chrono::Utc;
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, Eip1559TransactionRequest, TransactionRequest, H256};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::debug;

/// Builds signed attempts for a transaction at market or bumped fees
pub struct AttemptBuilder {
    chain_id: u64,
    estimator: Arc<dyn FeeEstimator>,
    keystore: Arc<dyn KeyStore>,
}

impl AttemptBuilder {
    pub fn new(chain_id: u64, estimator: Arc<dyn FeeEstimator>, keystore: Arc<dyn KeyStore>) -> Self {
        Self {
            chain_id,
            estimator,
            keystore,
        }
    }

    /// Attempt at the current market fee
    pub async fn new_attempt(&self, tx: &Tx) -> Result<TxAttempt> {
        let (fee, gas_limit) = self.estimator.get_fee(&tx.encoded_payload, tx.fee_limit).await?;
        self.sign_attempt(tx, fee, gas_limit).await
    }

    /// Replacement attempt bumped from a previous one. The bumped fee must
    /// cover the previous fee or the builder refuses it.
    pub async fn new_bump_attempt(&self, tx: &Tx, previous: &TxAttempt) -> Result<TxAttempt> {
        let (fee, gas_limit) = self.estimator.bump_fee(&previous.fee, tx.fee_limit).await?;

        if !fee.covers(&previous.fee) {
            return Err(Error::FeeEstimation(format!(
                "bumped fee {:?} does not cover previous fee {:?}",
                fee, previous.fee
            )));
        }

        self.sign_attempt(tx, fee, gas_limit).await
    }

    async fn sign_attempt(&self, tx: &Tx, fee: Fee, gas_limit: u64) -> Result<TxAttempt> {
        let sequence = tx
            .sequence
            .ok_or_else(|| Error::InvalidTx(format!("tx {} has no sequence", tx.id)))?;

        let typed = self.build_typed_tx(tx, sequence, gas_limit, &fee);

        let wallet = self.keystore.signer(tx.from_address)?.with_chain_id(self.chain_id);
        let signature = wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| Error::Signing {
                address: tx.from_address,
                message: e.to_string(),
            })?;

        let signed_raw: Bytes = typed.rlp_signed(&signature);
        let hash = H256::from(keccak256(&signed_raw));

        debug!(
            "Built attempt {:?} for tx {} at nonce {} (payload {})",
            hash,
            tx.id,
            sequence,
            hex::encode(&tx.encoded_payload)
        );

        Ok(TxAttempt {
            tx_id: tx.id,
            fee,
            gas_limit,
            hash,
            signed_raw,
            state: AttemptState::InProgress,
            created_at: Utc::now(),
        })
    }

    fn build_typed_tx(&self, tx: &Tx, nonce: u64, gas_limit: u64, fee: &Fee) -> TypedTransaction {
        match fee {
            Fee::Legacy(price) => {
                let request = TransactionRequest::new()
                    .to(tx.to_address)
                    .value(tx.value)
                    .data(tx.encoded_payload.clone())
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(*price)
                    .chain_id(self.chain_id);
                TypedTransaction::Legacy(request)
            }
            Fee::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let request = Eip1559TransactionRequest::new()
                    .to(tx.to_address)
                    .value(tx.value)
                    .data(tx.encoded_payload.clone())
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .chain_id(self.chain_id);
                TypedTransaction::Eip1559(request)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::StaticKeyStore;
    use crate::tx::fees::MockFeeEstimator;
    use crate::tx::types::TxState;
    use ethers::signers::LocalWallet;
    use ethers::types::{Address, U256};
    use uuid::Uuid;

    const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn test_wallet() -> LocalWallet {
        TEST_KEY.parse().unwrap()
    }

    fn test_tx(from: Address) -> Tx {
        Tx {
            id: Uuid::new_v4(),
            sequence: Some(7),
            from_address: from,
            to_address: Address::random(),
            encoded_payload: Bytes::from(vec![1, 2, 3]),
            value: U256::from(142),
            fee_limit: 242,
            broadcast_at: None,
            initial_broadcast_at: None,
            state: TxState::Unconfirmed,
            attempts: vec![],
        }
    }

    fn builder(estimator: MockFeeEstimator) -> (AttemptBuilder, Address) {
        let wallet = test_wallet();
        let from = wallet.address();
        let keystore = Arc::new(StaticKeyStore::from_wallets(vec![wallet]));
        (AttemptBuilder::new(1, Arc::new(estimator), keystore), from)
    }

    #[tokio::test]
    async fn market_attempt_is_signed_at_quoted_fee() {
        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .returning(|_, _| Ok((Fee::Legacy(U256::from(32)), 500)));

        let (builder, from) = builder(estimator);
        let tx = test_tx(from);

        let attempt = builder.new_attempt(&tx).await.unwrap();
        assert_eq!(attempt.fee, Fee::Legacy(U256::from(32)));
        assert_eq!(attempt.gas_limit, 500);
        assert_eq!(attempt.tx_id, tx.id);
        assert_eq!(attempt.state, AttemptState::InProgress);
        assert!(!attempt.signed_raw.is_empty());
        assert_eq!(attempt.hash, H256::from(keccak256(&attempt.signed_raw)));
    }

    #[tokio::test]
    async fn bump_attempt_carries_a_covering_fee() {
        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .returning(|_, _| Ok((Fee::Legacy(U256::from(32)), 500)));
        estimator
            .expect_bump_fee()
            .returning(|_, _| Ok((Fee::Legacy(U256::from(42)), 500)));

        let (builder, from) = builder(estimator);
        let tx = test_tx(from);

        let market = builder.new_attempt(&tx).await.unwrap();
        let bumped = builder.new_bump_attempt(&tx, &market).await.unwrap();

        assert!(bumped.fee.covers(&market.fee));
        assert_ne!(bumped.hash, market.hash);
    }

    #[tokio::test]
    async fn bump_below_previous_fee_is_refused() {
        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .returning(|_, _| Ok((Fee::Legacy(U256::from(32)), 500)));
        estimator
            .expect_bump_fee()
            .returning(|_, _| Ok((Fee::Legacy(U256::from(30)), 500)));

        let (builder, from) = builder(estimator);
        let tx = test_tx(from);

        let market = builder.new_attempt(&tx).await.unwrap();
        let result = builder.new_bump_attempt(&tx, &market).await;
        assert!(matches!(result, Err(Error::FeeEstimation(_))));
    }

    #[tokio::test]
    async fn missing_sequence_is_rejected() {
        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .returning(|_, _| Ok((Fee::Legacy(U256::from(32)), 500)));

        let (builder, from) = builder(estimator);
        let mut tx = test_tx(from);
        tx.sequence = None;

        assert!(matches!(builder.new_attempt(&tx).await, Err(Error::InvalidTx(_))));
    }
}
