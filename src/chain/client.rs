//! RPC client with multi-provider support and automatic failover

use super::{BatchCall, ChainClient};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{Error, Result};
use crate::tx::fees::GasPriceSource;
use crate::tx::types::Fee;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockNumber, U256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Multi-provider RPC wrapper with automatic failover
pub struct RpcClient {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl RpcClient {
    pub fn new(config: ChainConfig) -> Result<Self> {
        let mut providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if providers.is_empty() {
            return Err(Error::Config("No valid RPC providers".to_string()));
        }

        Ok(Self {
            config,
            providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.rpc_timeout_secs)
    }

    /// Estimate EIP-1559 fees from the latest block
    async fn estimate_eip1559_fees(&self) -> Result<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| Error::FeeEstimation(e.to_string()))?
            .ok_or_else(|| Error::FeeEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| Error::FeeEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei default

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        // Cap at configured max
        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, priority_fee))
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn sequence_at(&self, address: Address) -> Result<u64> {
        for _ in 0..self.providers.len() {
            let count = timeout(
                self.call_timeout(),
                self.http().get_transaction_count(address, None),
            )
            .await;

            match count {
                Ok(Ok(nonce)) => return Ok(nonce.as_u64()),
                Ok(Err(e)) => {
                    warn!("Nonce query failed for {:?}: {}", address, e);
                    self.failover();
                }
                Err(_) => {
                    warn!("Nonce query timed out for {:?}", address);
                    self.failover();
                }
            }
        }

        Err(Error::ChainCommunication {
            address,
            message: "All providers failed".to_string(),
        })
    }

    async fn batch_send_raw(&self, batch: &mut [BatchCall]) -> Result<()> {
        let call_timeout = self.call_timeout();

        let sends = batch.iter().map(|call| {
            let raw = call.signed_raw.clone();
            async move {
                match timeout(call_timeout, self.http().send_raw_transaction(raw)).await {
                    Ok(Ok(pending)) => Ok(pending.tx_hash()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("send timeout".to_string()),
                }
            }
        });

        let results = futures::future::join_all(sends).await;

        for (call, result) in batch.iter_mut().zip(results) {
            match result {
                Ok(hash) => call.result = Some(hash),
                Err(message) => {
                    warn!("Batch element rejected: {}", message);
                    call.error = Some(message);
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl GasPriceSource for RpcClient {
    async fn current_fee(&self) -> Result<Fee> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| Error::FeeEstimation(e.to_string()))?;
                Ok(Fee::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(Fee::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }
}
