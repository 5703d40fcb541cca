//! Key management: enabled sending addresses and their signers
//!
//! Injected as a collaborator so tests and embedders control the address
//! set; nothing in the crate reaches for a process-wide singleton.

use crate::config::KeystoreConfig;
use crate::error::{Error, Result};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use std::collections::HashMap;

/// The set of enabled sending addresses and a signer per address
#[cfg_attr(test, mockall::automock)]
pub trait KeyStore: Send + Sync {
    /// Addresses the resender reconciles, in a stable order
    fn enabled_addresses(&self) -> Vec<Address>;

    /// Signer for one of the enabled addresses
    fn signer(&self, address: Address) -> Result<LocalWallet>;
}

/// Keystore backed by a fixed set of in-memory wallets
pub struct StaticKeyStore {
    wallets: HashMap<Address, LocalWallet>,
    /// Insertion order, kept so cycles visit addresses deterministically
    order: Vec<Address>,
}

impl StaticKeyStore {
    /// Load wallets from the environment variables named in the config
    pub fn from_env(config: &KeystoreConfig, chain_id: u64) -> Result<Self> {
        let mut wallets = Vec::new();

        for env_name in &config.private_key_envs {
            let key = std::env::var(env_name).map_err(|_| {
                Error::Keystore(format!("Environment variable {} is not set", env_name))
            })?;
            let wallet = key
                .parse::<LocalWallet>()
                .map_err(|e| Error::Keystore(format!("Invalid private key in {}: {}", env_name, e)))?
                .with_chain_id(chain_id);
            wallets.push(wallet);
        }

        Ok(Self::from_wallets(wallets))
    }

    pub fn from_wallets(wallets: Vec<LocalWallet>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();

        for wallet in wallets {
            let address = wallet.address();
            if map.insert(address, wallet).is_none() {
                order.push(address);
            }
        }

        Self { wallets: map, order }
    }
}

impl KeyStore for StaticKeyStore {
    fn enabled_addresses(&self) -> Vec<Address> {
        self.order.clone()
    }

    fn signer(&self, address: Address) -> Result<LocalWallet> {
        self.wallets
            .get(&address)
            .cloned()
            .ok_or_else(|| Error::Keystore(format!("No key for address {:?}", address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn static_keystore_round_trip() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let address = wallet.address();
        let ks = StaticKeyStore::from_wallets(vec![wallet]);

        assert_eq!(ks.enabled_addresses(), vec![address]);
        assert_eq!(ks.signer(address).unwrap().address(), address);
        assert!(ks.signer(Address::zero()).is_err());
    }

    #[test]
    fn empty_keystore_has_no_addresses() {
        let ks = StaticKeyStore::from_wallets(vec![]);
        assert!(ks.enabled_addresses().is_empty());
    }
}
