//! Abstract chain backend.
//!
//! The node never talks RPC directly; everything on-chain is reached through
//! the [`ChainBackend`] trait. The contract encodes a channel's lifecycle
//! position in its state counter (`state_counter mod 10`), and emits
//! `OpenedChannel` / `ClosedChannel` events the channel module subscribes to.
//!
//! [`mock::MockLedger`] implements the trait in-process for the test suites.

use async_trait::async_trait;
use crypto::Address;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

pub mod mock;

pub use mock::{MockChain, MockLedger};

/// On-chain channel state as returned by the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnChainChannel {
    pub deposit: u64,
    pub party_a_balance: u64,
    /// Unix timestamp after which a pending closure becomes withdrawable.
    /// Zero while no closure is pending.
    pub closure_time: u64,
    pub state_counter: u64,
}

impl OnChainChannel {
    /// Lifecycle status, refined by the current block time: a pending
    /// closure whose deadline has elapsed is withdrawable.
    pub fn status(&self, block_time: u64) -> ChannelStatus {
        let status = ChannelStatus::from_state_counter(self.state_counter);
        if status == ChannelStatus::PendingClosure && block_time >= self.closure_time {
            ChannelStatus::Withdrawable
        } else {
            status
        }
    }
}

/// Channel lifecycle status. The on-chain encoding is `state_counter mod 10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Uninitialised,
    Funding,
    Open,
    PendingClosure,
    Withdrawable,
    Closed,
}

impl ChannelStatus {
    pub fn from_state_counter(counter: u64) -> Self {
        match counter % 10 {
            0 => ChannelStatus::Uninitialised,
            1 => ChannelStatus::Funding,
            2 => ChannelStatus::Open,
            3 => ChannelStatus::PendingClosure,
            4 => ChannelStatus::Withdrawable,
            _ => ChannelStatus::Closed,
        }
    }
}

/// A block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub timestamp: u64,
}

/// Contract events the channel module reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    OpenedChannel { channel_id: [u8; 32] },
    ClosedChannel { channel_id: [u8; 32] },
}

impl ChainEvent {
    pub fn channel_id(&self) -> [u8; 32] {
        match self {
            ChainEvent::OpenedChannel { channel_id } => *channel_id,
            ChainEvent::ClosedChannel { channel_id } => *channel_id,
        }
    }
}

/// Components of a signed settlement submitted to the contract.
#[derive(Debug, Clone, Copy)]
pub struct SettlementArgs {
    pub channel_id: [u8; 32],
    pub index: u64,
    /// Anti-replay nonce of the submitted update (hash-of-signature prefix).
    pub nonce: u64,
    pub value: u64,
    pub curve_point: [u8; 33],
    pub signature: [u8; 64],
    pub recovery: u8,
}

/// Chain error type.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// Transient RPC failure; retry with backoff.
    #[error("rpc failure: {0}")]
    Rpc(String),

    /// The contract rejected the call.
    #[error("reverted: {0}")]
    Revert(String),

    #[error("operation not supported by this backend")]
    Unsupported,
}

/// Identifier of the channel between two accounts: `SHA256(a ‖ b)` with the
/// addresses in ascending order, so both parties derive the same id.
pub fn channel_id(a: Address, b: Address) -> [u8; 32] {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(low.as_bytes());
    hasher.update(high.as_bytes());
    hasher.finalize().into()
}

/// Interface to the settlement layer.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Read a channel's on-chain state. A channel that was never funded
    /// reports `state_counter = 0` (Uninitialised), not an error.
    async fn get_channel(&self, channel_id: [u8; 32]) -> Result<OnChainChannel, ChainError>;

    /// Fund and open the channel with `counterparty`, depositing `amount`
    /// from the calling node's account.
    async fn open_channel(&self, counterparty: Address, amount: u64) -> Result<(), ChainError>;

    /// Start the unilateral closure timeout.
    async fn initiate_channel_closure(&self, counterparty: Address) -> Result<(), ChainError>;

    /// Finalize a closure whose timeout has elapsed.
    async fn claim_channel_closure(&self, counterparty: Address) -> Result<(), ChainError>;

    /// Submit a signed settlement (the latest off-chain update).
    async fn close_channel(&self, args: SettlementArgs) -> Result<(), ChainError>;

    /// Pay out the calling node's share after closure.
    async fn withdraw(&self, counterparty: Address) -> Result<u64, ChainError>;

    /// Broadcast a raw transaction.
    async fn send_transaction(&self, raw: Vec<u8>) -> Result<(), ChainError>;

    /// Latest block header.
    async fn get_block(&self) -> Result<Block, ChainError>;

    /// Subscribe to new block headers.
    fn subscribe_blocks(&self) -> broadcast::Receiver<Block>;

    /// Subscribe to contract events. Callers filter by channel id.
    fn subscribe_events(&self) -> broadcast::Receiver<ChainEvent>;

    /// Advance block time. Implemented only by test backends; the test
    /// harness is the sole caller.
    async fn test_block_advance(&self, _seconds: u64) -> Result<(), ChainError> {
        Err(ChainError::Unsupported)
    }
}
