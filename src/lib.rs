//! # Relay
//!
//! Library for a transaction relay that sponsors gas for ERC-4337-style
//! smart accounts, bundles their user operations on chain, indexes the
//! resulting events and republishes them as signed Nostr events.

pub mod blossom;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod evm;
pub mod indexer;
pub mod metrics;
pub mod nostr;
pub mod paymaster;
pub mod queue;
pub mod rpc;
pub mod spawn;
pub mod storage;
pub mod types;
pub mod version;
pub mod webhook;
pub mod ws;
