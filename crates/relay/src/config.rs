//! Node configuration.
//!
//! Everything the core needs from the environment arrives through this
//! struct at startup; nothing reads process variables at runtime.

use std::time::Duration;

use channel::WIN_PROB_ALWAYS;

/// Which chain the node settles on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Production,
    Development,
    Test,
}

/// Configuration for a relay node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Chain RPC endpoint.
    pub provider_url: String,
    /// Address of the channel contract.
    pub contract_address: String,
    pub network: Network,
    /// Per-hop payment subtracted at each intermediate relay.
    pub relay_fee: u64,
    /// Deadline for a cooperative settlement before settling unilaterally.
    pub settlement_timeout: Duration,
    /// Win probability attached to issued tickets.
    pub win_prob: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            provider_url: "ws://127.0.0.1:8545".into(),
            contract_address: String::new(),
            network: Network::Development,
            relay_fee: 1,
            settlement_timeout: channel::SETTLEMENT_TIMEOUT,
            win_prob: WIN_PROB_ALWAYS,
        }
    }
}
