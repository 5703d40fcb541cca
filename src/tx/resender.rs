//! Unconfirmed-transaction resender
//!
//! Reconciles broadcast-but-unconfirmed transactions against on-chain nonce
//! state once per scheduled cycle: anything the chain has moved past is
//! marked confirmed, anything stuck past the bump threshold is rebroadcast
//! at a bumped fee, in batches bounded by the RPC batch size.

use crate::chain::{BatchCall, ChainClient};
use crate::config::ResenderConfig;
use crate::error::{Error, Result};
use crate::keystore::KeyStore;
use crate::metrics;
use crate::store::TxStore;
use crate::tx::attempt::AttemptBuilder;
use crate::tx::types::{AttemptState, Tx, TxAttempt, TxState};

use chrono::Utc;
use ethers::types::Address;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One rebroadcast queued for batch submission
struct Resend {
    tx_id: Uuid,
    attempt: TxAttempt,
    /// False when rebroadcasting an existing attempt at its last fee
    is_new: bool,
}

/// Reconciles and rebroadcasts unconfirmed transactions per enabled address
pub struct Resender {
    config: ResenderConfig,
    client: Arc<dyn ChainClient>,
    store: Arc<dyn TxStore>,
    keystore: Arc<dyn KeyStore>,
    builder: AttemptBuilder,
}

impl Resender {
    pub fn new(
        config: ResenderConfig,
        client: Arc<dyn ChainClient>,
        store: Arc<dyn TxStore>,
        keystore: Arc<dyn KeyStore>,
        builder: AttemptBuilder,
    ) -> Self {
        Self {
            config,
            client,
            store,
            keystore,
            builder,
        }
    }

    /// Run one reconciliation cycle over every enabled address.
    ///
    /// The caller must not overlap cycles. A failure for one address never
    /// aborts the others; failures are collected and reported as an
    /// aggregate error once the cycle has finished.
    pub async fn resend_unconfirmed(&self) -> Result<()> {
        let addresses = self.keystore.enabled_addresses();
        if addresses.is_empty() {
            debug!("No enabled addresses; nothing to resend");
            return Ok(());
        }

        // Independent addresses touch disjoint nonce spaces
        let cycles = addresses.iter().map(|address| self.process_address(*address));
        let outcomes = futures::future::join_all(cycles).await;

        let total = addresses.len();
        let mut failed = 0;
        for (address, outcome) in addresses.iter().zip(outcomes) {
            if let Err(e) = outcome {
                failed += 1;
                metrics::record_cycle_error(address);
                warn!("Reconciliation failed for {:?}: {}", address, e);
            }
        }

        metrics::record_resend_cycle();

        if failed > 0 {
            return Err(Error::ResendCycle { failed, total });
        }
        Ok(())
    }

    async fn process_address(&self, address: Address) -> Result<()> {
        let on_chain_nonce = self.client.sequence_at(address).await?;
        let unconfirmed = self.store.find_unconfirmed(address).await?;
        if unconfirmed.is_empty() {
            debug!("No unconfirmed txs for {:?}", address);
            return Ok(());
        }

        let in_flight = self.confirm_stale(address, on_chain_nonce, unconfirmed).await?;
        let due = self.collect_due(in_flight).await?;
        if due.is_empty() {
            return Ok(());
        }

        self.submit_batches(address, due).await
    }

    /// Mark every tx the chain has moved past as confirmed; return the rest
    /// bounded to the `max_in_flight` lowest sequences.
    async fn confirm_stale(
        &self,
        address: Address,
        on_chain_nonce: u64,
        unconfirmed: Vec<Tx>,
    ) -> Result<Vec<Tx>> {
        let mut in_flight = Vec::new();
        let mut confirmed = 0usize;

        for tx in unconfirmed {
            match tx.sequence {
                Some(sequence) if sequence < on_chain_nonce => {
                    self.store.update_tx_state(tx.id, TxState::Confirmed).await?;
                    confirmed += 1;
                }
                Some(_) => in_flight.push(tx),
                None => {
                    error!("Unconfirmed tx {} has no sequence; skipping", tx.id);
                }
            }
        }

        if confirmed > 0 {
            info!(
                "Marked {} txs confirmed for {:?} (on-chain nonce {})",
                confirmed, address, on_chain_nonce
            );
            metrics::record_txs_confirmed(confirmed);
        }

        // Lowest sequence first: it blocks every higher one
        in_flight.sort_by_key(|tx| tx.sequence);
        if in_flight.len() > self.config.max_in_flight {
            warn!(
                "{} unconfirmed txs for {:?}; considering the oldest {}",
                in_flight.len(),
                address,
                self.config.max_in_flight
            );
            in_flight.truncate(self.config.max_in_flight);
        }

        Ok(in_flight)
    }

    /// Build a rebroadcast for every tx whose last broadcast is older than
    /// the bump threshold.
    async fn collect_due(&self, in_flight: Vec<Tx>) -> Result<Vec<Resend>> {
        let now = Utc::now();
        let threshold = chrono::Duration::seconds(self.config.bump_after_threshold_secs as i64);

        let mut due = Vec::new();
        for tx in in_flight {
            let Some(broadcast_at) = tx.broadcast_at else {
                error!("Unconfirmed tx {} has no broadcast timestamp; skipping", tx.id);
                continue;
            };
            if now.signed_duration_since(broadcast_at) < threshold {
                continue;
            }

            if tx.bump_count() >= self.config.max_bump_cycles {
                let Some(last) = tx.latest_attempt().cloned() else {
                    error!("Unconfirmed tx {} has no attempts; skipping", tx.id);
                    continue;
                };
                warn!(
                    "Tx {} still unconfirmed after {} bumps; resending at last fee",
                    tx.id,
                    tx.bump_count()
                );
                metrics::record_stuck_tx();
                due.push(Resend {
                    tx_id: tx.id,
                    attempt: last,
                    is_new: false,
                });
                continue;
            }

            let market = self.builder.new_attempt(&tx).await?;
            // Seed the bump with the stored attempt if the market has fallen
            // below it, so the replacement always covers what is already in
            // the mempool.
            let seed = match tx.latest_attempt() {
                Some(previous) if !market.fee.covers(&previous.fee) => previous.clone(),
                _ => market,
            };
            let bumped = self.builder.new_bump_attempt(&tx, &seed).await?;
            due.push(Resend {
                tx_id: tx.id,
                attempt: bumped,
                is_new: true,
            });
        }

        Ok(due)
    }

    /// Submit rebroadcasts in groups no larger than the RPC batch size,
    /// applying per-element results.
    async fn submit_batches(&self, address: Address, due: Vec<Resend>) -> Result<()> {
        let now = Utc::now();
        info!("Rebroadcasting {} txs for {:?}", due.len(), address);

        for chunk in due.chunks(self.config.rpc_default_batch_size) {
            let mut batch: Vec<BatchCall> = chunk
                .iter()
                .map(|resend| BatchCall::new(resend.attempt.signed_raw.clone()))
                .collect();

            self.client.batch_send_raw(&mut batch).await?;

            for (resend, call) in chunk.iter().zip(batch.iter()) {
                if let Some(message) = &call.error {
                    warn!("Rebroadcast of tx {} rejected: {}", resend.tx_id, message);
                    metrics::record_resend_rejected();
                    continue;
                }

                if resend.is_new {
                    let mut attempt = resend.attempt.clone();
                    attempt.state = AttemptState::Broadcast;
                    if let Some(hash) = call.result {
                        attempt.hash = hash;
                    }
                    self.store.save_attempt(resend.tx_id, attempt, now).await?;
                } else {
                    self.store.update_broadcast_at(resend.tx_id, now).await?;
                }
                metrics::record_tx_resent();
            }
        }

        Ok(())
    }
}

/// Drive `resend_unconfirmed` on the configured interval until shutdown.
/// Ticks never overlap: the next cycle starts only after the previous one
/// returned.
pub async fn run_resend_loop(resender: Arc<Resender>, shutdown: Arc<tokio::sync::Notify>) {
    let mut interval = tokio::time::interval(resender.config.resend_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = resender.resend_unconfirmed().await {
                    warn!("Resend cycle finished with errors: {}", e);
                }
            }
            _ = shutdown.notified() => {
                info!("Resend loop stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::keystore::StaticKeyStore;
    use crate::store::{InMemoryTxStore, TxStore};
    use crate::tx::fees::MockFeeEstimator;
    use crate::tx::types::Fee;
    use chrono::DateTime;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::{Bytes, H256, U256};

    const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const OTHER_KEY: &str = "6c3699283bda56ad74f6b855546325b68d482e983852a7a82979cc4807b3c2a8";

    fn test_config() -> ResenderConfig {
        ResenderConfig {
            bump_after_threshold_secs: 6,
            max_bump_cycles: 3,
            max_in_flight: 16,
            resend_interval_secs: 2,
            rpc_default_batch_size: 1,
        }
    }

    fn build_resender(
        config: ResenderConfig,
        client: MockChainClient,
        estimator: MockFeeEstimator,
        wallets: Vec<LocalWallet>,
    ) -> (Resender, Arc<InMemoryTxStore>) {
        let store = Arc::new(InMemoryTxStore::new());
        let keystore = Arc::new(StaticKeyStore::from_wallets(wallets));
        let builder = AttemptBuilder::new(0, Arc::new(estimator), keystore.clone());
        let resender = Resender::new(config, Arc::new(client), store.clone(), keystore, builder);
        (resender, store)
    }

    fn initial_attempt(fee_gwei: u64) -> TxAttempt {
        TxAttempt {
            tx_id: Uuid::nil(),
            fee: Fee::Legacy(U256::from(fee_gwei) * U256::exp10(9)),
            gas_limit: 242,
            hash: H256::random(),
            signed_raw: Bytes::from(vec![0xaa, 0xbb]),
            state: AttemptState::Broadcast,
            created_at: Utc::now(),
        }
    }

    fn unconfirmed_tx(from: Address, sequence: u64, broadcast_at: DateTime<Utc>) -> Tx {
        Tx {
            id: Uuid::nil(),
            sequence: Some(sequence),
            from_address: from,
            to_address: Address::random(),
            encoded_payload: Bytes::from(vec![1, 2, 3]),
            value: U256::from(142),
            fee_limit: 242,
            broadcast_at: Some(broadcast_at),
            initial_broadcast_at: Some(broadcast_at),
            state: TxState::Unconfirmed,
            attempts: vec![initial_attempt(30)],
        }
    }

    fn an_hour_ago() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(1)
    }

    #[tokio::test]
    async fn no_enabled_addresses() {
        let (resender, _) = build_resender(
            test_config(),
            MockChainClient::new(),
            MockFeeEstimator::new(),
            vec![],
        );

        resender.resend_unconfirmed().await.unwrap();
    }

    #[tokio::test]
    async fn no_txs_at_all_for_enabled_address() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();

        let mut client = MockChainClient::new();
        client.expect_sequence_at().times(1).returning(|_| Ok(0));

        let (resender, _) =
            build_resender(test_config(), client, MockFeeEstimator::new(), vec![wallet]);

        resender.resend_unconfirmed().await.unwrap();
    }

    #[tokio::test]
    async fn marks_unconfirmed_txs_confirmed_before_the_on_chain_nonce() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let from = wallet.address();

        let mut client = MockChainClient::new();
        client.expect_sequence_at().times(1).returning(|_| Ok(1));

        let (resender, store) =
            build_resender(test_config(), client, MockFeeEstimator::new(), vec![wallet]);

        // Broadcast just now, so the survivor is not yet bump-eligible
        let stale_id = store.insert_tx(unconfirmed_tx(from, 0, Utc::now())).await.unwrap();
        let live_id = store.insert_tx(unconfirmed_tx(from, 1, Utc::now())).await.unwrap();

        // A tx already confirmed earlier is outside the reconciliation scope
        let mut done = unconfirmed_tx(from, 2, Utc::now());
        done.state = TxState::Confirmed;
        store.insert_tx(done).await.unwrap();

        resender.resend_unconfirmed().await.unwrap();

        assert_eq!(store.count_unconfirmed(from).await.unwrap(), 1);
        assert_eq!(
            store.get_tx_by_id(stale_id).await.unwrap().state,
            TxState::Confirmed
        );
        assert_eq!(
            store.get_tx_by_id(live_id).await.unwrap().state,
            TxState::Unconfirmed
        );
    }

    #[tokio::test]
    async fn batch_sends_transactions_that_require_gas_bumping() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let from = wallet.address();
        let gwei = |n: u64| U256::from(n) * U256::exp10(9);

        let mut client = MockChainClient::new();
        client.expect_sequence_at().times(1).returning(|_| Ok(1));
        // Batch size 1 and two due txs: exactly two round-trips of one element
        client
            .expect_batch_send_raw()
            .times(2)
            .returning(|batch| {
                assert_eq!(batch.len(), 1);
                batch[0].result = Some(H256::random());
                Ok(())
            });

        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .times(2)
            .returning(move |_, _| Ok((Fee::Legacy(gwei(32)), 500)));
        estimator
            .expect_bump_fee()
            .times(2)
            .returning(move |previous, _| {
                assert_eq!(*previous, Fee::Legacy(gwei(32)));
                Ok((Fee::Legacy(gwei(42)), 500))
            });

        let (resender, store) = build_resender(test_config(), client, estimator, vec![wallet]);

        let before = an_hour_ago();
        let id1 = store.insert_tx(unconfirmed_tx(from, 1, before)).await.unwrap();
        let id2 = store.insert_tx(unconfirmed_tx(from, 2, before)).await.unwrap();

        resender.resend_unconfirmed().await.unwrap();

        for id in [id1, id2] {
            let tx = store.get_tx_by_id(id).await.unwrap();
            // A successful send stays unconfirmed until the next nonce check
            assert_eq!(tx.state, TxState::Unconfirmed);
            assert_eq!(tx.attempts.len(), 2);
            assert!(tx.broadcast_at.unwrap() > before);

            let bumped = tx.latest_attempt().unwrap();
            assert_eq!(bumped.fee, Fee::Legacy(gwei(42)));
            assert!(bumped.fee.covers(&tx.attempts[0].fee));
            assert_eq!(bumped.state, AttemptState::Broadcast);
        }
    }

    #[tokio::test]
    async fn max_in_flight_bounds_resends_to_the_lowest_sequences() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let from = wallet.address();
        let gwei = |n: u64| U256::from(n) * U256::exp10(9);

        let mut config = test_config();
        config.max_in_flight = 1;

        let mut client = MockChainClient::new();
        client.expect_sequence_at().times(1).returning(|_| Ok(0));
        client.expect_batch_send_raw().times(1).returning(|batch| {
            assert_eq!(batch.len(), 1);
            batch[0].result = Some(H256::random());
            Ok(())
        });

        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .times(1)
            .returning(move |_, _| Ok((Fee::Legacy(gwei(32)), 500)));
        estimator
            .expect_bump_fee()
            .times(1)
            .returning(move |_, _| Ok((Fee::Legacy(gwei(42)), 500)));

        let (resender, store) = build_resender(config, client, estimator, vec![wallet]);

        let before = an_hour_ago();
        let oldest = store.insert_tx(unconfirmed_tx(from, 0, before)).await.unwrap();
        let newer = store.insert_tx(unconfirmed_tx(from, 1, before)).await.unwrap();

        // Aggregate error is not expected: the overflow is not a failure
        resender.resend_unconfirmed().await.unwrap();

        assert_eq!(store.get_tx_by_id(oldest).await.unwrap().attempts.len(), 2);
        assert_eq!(store.get_tx_by_id(newer).await.unwrap().attempts.len(), 1);
    }

    #[tokio::test]
    async fn bump_cap_resends_at_last_fee_without_a_new_attempt() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let from = wallet.address();

        let mut config = test_config();
        config.max_bump_cycles = 1;

        let before = an_hour_ago();
        let mut tx = unconfirmed_tx(from, 0, before);
        // Already bumped once: at the cap
        let mut capped = initial_attempt(40);
        capped.signed_raw = Bytes::from(vec![0xca, 0xfe]);
        tx.attempts.push(capped.clone());

        let mut client = MockChainClient::new();
        client.expect_sequence_at().times(1).returning(|_| Ok(0));
        let expected_raw = capped.signed_raw.clone();
        client
            .expect_batch_send_raw()
            .times(1)
            .returning(move |batch| {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].signed_raw, expected_raw);
                batch[0].result = Some(H256::random());
                Ok(())
            });

        // No estimator expectations: a capped tx must not request quotes
        let (resender, store) =
            build_resender(config, client, MockFeeEstimator::new(), vec![wallet]);
        let id = store.insert_tx(tx).await.unwrap();

        resender.resend_unconfirmed().await.unwrap();

        let tx = store.get_tx_by_id(id).await.unwrap();
        assert_eq!(tx.attempts.len(), 2);
        assert!(tx.broadcast_at.unwrap() > before);
        assert_eq!(tx.state, TxState::Unconfirmed);
    }

    #[tokio::test]
    async fn nonce_query_failure_only_aborts_that_address() {
        let wallet_ok: LocalWallet = TEST_KEY.parse().unwrap();
        let wallet_bad: LocalWallet = OTHER_KEY.parse().unwrap();
        let from_ok = wallet_ok.address();
        let from_bad = wallet_bad.address();

        let mut client = MockChainClient::new();
        client.expect_sequence_at().times(2).returning(move |address| {
            if address == from_bad {
                Err(Error::ChainCommunication {
                    address,
                    message: "connection refused".to_string(),
                })
            } else {
                Ok(1)
            }
        });

        let (resender, store) = build_resender(
            test_config(),
            client,
            MockFeeEstimator::new(),
            vec![wallet_ok, wallet_bad],
        );

        let stale = store.insert_tx(unconfirmed_tx(from_ok, 0, Utc::now())).await.unwrap();

        let result = resender.resend_unconfirmed().await;
        assert!(matches!(result, Err(Error::ResendCycle { failed: 1, total: 2 })));

        // The healthy address was still reconciled
        assert_eq!(
            store.get_tx_by_id(stale).await.unwrap().state,
            TxState::Confirmed
        );
    }

    #[tokio::test]
    async fn rejected_batch_element_leaves_tx_untouched() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let from = wallet.address();
        let gwei = |n: u64| U256::from(n) * U256::exp10(9);

        let mut client = MockChainClient::new();
        client.expect_sequence_at().times(1).returning(|_| Ok(0));
        client.expect_batch_send_raw().times(1).returning(|batch| {
            batch[0].error = Some("nonce too low".to_string());
            Ok(())
        });

        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .returning(move |_, _| Ok((Fee::Legacy(gwei(32)), 500)));
        estimator
            .expect_bump_fee()
            .returning(move |_, _| Ok((Fee::Legacy(gwei(42)), 500)));

        let (resender, store) = build_resender(test_config(), client, estimator, vec![wallet]);

        let before = an_hour_ago();
        let id = store.insert_tx(unconfirmed_tx(from, 0, before)).await.unwrap();

        resender.resend_unconfirmed().await.unwrap();

        let tx = store.get_tx_by_id(id).await.unwrap();
        assert_eq!(tx.attempts.len(), 1);
        assert_eq!(tx.broadcast_at, Some(before));
    }
}
