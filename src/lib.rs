//! chainward - node-operator toolkit for EVM chains
//!
//! Two core subsystems, consumable as a library or run as a service:
//! - `tx::Resender`: reconciles broadcast-but-unconfirmed transactions
//!   against on-chain nonce state and rebroadcasts stuck ones with bumped
//!   fees, in batches
//! - `logbuffer::LogBuffer`: bounded, deduplicating buffer of log events
//!   per entity with fair, size-capped dequeue batches

pub mod chain;
pub mod config;
pub mod error;
pub mod keystore;
pub mod logbuffer;
pub mod metrics;
pub mod store;
pub mod tx;

pub use error::{Error, Result};
