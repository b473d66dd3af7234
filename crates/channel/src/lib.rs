//! Payment channel implementation.
//!
//! Per-counterparty bidirectional channels funded on-chain, updated by
//! signed off-chain transactions carried inside relayed packets, and settled
//! on-chain cooperatively or unilaterally after a timeout.
//!
//! ## Lifecycle
//!
//! ```text
//! 1. FUND      open_or_fund() deposits on-chain; OpenedChannel confirms
//! 2. UPDATE    each relayed packet embeds one signed UpdateTransaction;
//!              the recipient validates index, direction and nonce, then
//!              persists value and a pending ticket
//! 3. CLOSE     close_channel() asks the counterparty over SETTLE_CHANNEL,
//!              settles unilaterally after the timeout
//! 4. WITHDRAW  once block time passes the closure deadline, each party
//!              withdraws its share and local state is pruned
//! ```

pub mod manager;
pub mod messages;
pub mod state;
pub mod ticket;
pub mod transaction;

pub use manager::{
    ChannelEvent, ChannelManager, SettlementPeer, SETTLEMENT_TIMEOUT,
};
pub use messages::{SettleChannelRequest, SettleChannelResponse, SETTLE_CHANNEL_PROTOCOL};
pub use state::{embedded_money, Channel, ChannelId, ChannelRecord, ChannelStatus};
pub use ticket::{is_winning, Ticket, WIN_PROB_ALWAYS};
pub use transaction::{UpdateTransaction, TRANSACTION_SIZE};

use store::StoreError;

/// Channel error types, classified for the packet pipeline: adversarial
/// input drops silently, transient failures retry, divergence and nonce
/// reuse are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    // ---- adversarial input (silent drops) ----
    #[error("channel is not open")]
    NotOpen,

    #[error("malformed payload")]
    Malformed,

    #[error("update signer mismatch")]
    BadSigner,

    #[error("update addresses the wrong channel")]
    WrongChannel,

    #[error("update index regression: expected {expected}, got {got}")]
    StaleIndex { expected: u64, got: u64 },

    #[error("balance update out of range")]
    ValueOutOfRange,

    #[error("insufficient fee: carried {carried}, required {required}")]
    InsufficientFee { carried: u64, required: u64 },

    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u64, need: u64 },

    #[error("losing ticket cannot be redeemed")]
    LosingTicket,

    // ---- local, recoverable ----
    #[error("channel not found")]
    NotFound,

    #[error("store failure: {0}")]
    Store(String),

    #[error("chain failure: {0}")]
    Chain(#[from] chain::ChainError),

    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),

    // ---- fatal ----
    #[error("on-chain channel exists without a local record")]
    StateDivergence,

    #[error("nonce reuse detected")]
    NonceReuse,
}

impl ChannelError {
    /// Divergence the node cannot reconcile; the affected channel must be
    /// shut down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::StateDivergence | ChannelError::NonceReuse
        )
    }

    /// Transient failure worth retrying with backoff.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChannelError::Store(_)
                | ChannelError::Chain(chain::ChainError::Rpc(_))
                | ChannelError::NotFound
        )
    }
}

impl From<StoreError> for ChannelError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ChannelError::NotFound,
            StoreError::Backend(msg) => ChannelError::Store(msg),
        }
    }
}
