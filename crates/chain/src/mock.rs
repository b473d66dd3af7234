//! In-process chain backend for the test suites.
//!
//! One [`MockLedger`] plays the contract; each node gets a [`MockChain`]
//! handle bound to its own account. Block time only moves through
//! [`ChainBackend::test_block_advance`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use crypto::Address;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::{
    channel_id, Block, ChainBackend, ChainError, ChainEvent, ChannelStatus, OnChainChannel,
    SettlementArgs,
};

/// Seconds a pending closure stays contestable before it becomes
/// withdrawable.
pub const DEFAULT_CLOSURE_WINDOW_SECS: u64 = 60;

struct ChannelSlot {
    /// Ordered participants: `.0` is partyA.
    participants: (Address, Address),
    deposit: u64,
    party_a_balance: u64,
    closure_time: u64,
    state_counter: u64,
    settled_index: u64,
    withdrawn: (bool, bool),
}

impl ChannelSlot {
    fn snapshot(&self) -> OnChainChannel {
        OnChainChannel {
            deposit: self.deposit,
            party_a_balance: self.party_a_balance,
            closure_time: self.closure_time,
            state_counter: self.state_counter,
        }
    }

    fn set_status(&mut self, status: ChannelStatus) {
        let digit = match status {
            ChannelStatus::Uninitialised => 0,
            ChannelStatus::Funding => 1,
            ChannelStatus::Open => 2,
            ChannelStatus::PendingClosure => 3,
            ChannelStatus::Withdrawable => 4,
            ChannelStatus::Closed => 5,
        };
        self.state_counter = self.state_counter - self.state_counter % 10 + digit;
    }
}

struct LedgerState {
    channels: HashMap<[u8; 32], ChannelSlot>,
    block: Block,
    closure_window: u64,
    payouts: HashMap<Address, u64>,
}

/// The shared mock contract.
#[derive(Clone)]
pub struct MockLedger {
    state: Arc<RwLock<LedgerState>>,
    blocks: broadcast::Sender<Block>,
    events: broadcast::Sender<ChainEvent>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::with_closure_window(DEFAULT_CLOSURE_WINDOW_SECS)
    }

    pub fn with_closure_window(closure_window: u64) -> Self {
        let (blocks, _) = broadcast::channel(64);
        let (events, _) = broadcast::channel(64);
        MockLedger {
            state: Arc::new(RwLock::new(LedgerState {
                channels: HashMap::new(),
                block: Block {
                    number: 1,
                    timestamp: 1_000,
                },
                closure_window,
                payouts: HashMap::new(),
            })),
            blocks,
            events,
        }
    }

    /// Backend handle bound to one node's account.
    pub fn backend_for(&self, node: Address) -> MockChain {
        MockChain {
            ledger: self.clone(),
            node,
        }
    }

    /// Total amount paid out to an address so far.
    pub async fn payout_of(&self, address: Address) -> u64 {
        self.state
            .read()
            .await
            .payouts
            .get(&address)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of the mock contract.
#[derive(Clone)]
pub struct MockChain {
    ledger: MockLedger,
    node: Address,
}

impl MockChain {
    fn ordered_with(&self, counterparty: Address) -> (Address, Address) {
        if self.node <= counterparty {
            (self.node, counterparty)
        } else {
            (counterparty, self.node)
        }
    }
}

#[async_trait]
impl ChainBackend for MockChain {
    async fn get_channel(&self, channel_id: [u8; 32]) -> Result<OnChainChannel, ChainError> {
        let state = self.ledger.state.read().await;
        Ok(state
            .channels
            .get(&channel_id)
            .map(|slot| slot.snapshot())
            .unwrap_or(OnChainChannel {
                deposit: 0,
                party_a_balance: 0,
                closure_time: 0,
                state_counter: 0,
            }))
    }

    async fn open_channel(&self, counterparty: Address, amount: u64) -> Result<(), ChainError> {
        let id = channel_id(self.node, counterparty);
        let participants = self.ordered_with(counterparty);
        let mut state = self.ledger.state.write().await;

        let slot = state.channels.entry(id).or_insert(ChannelSlot {
            participants,
            deposit: 0,
            party_a_balance: 0,
            closure_time: 0,
            state_counter: 0,
            settled_index: 0,
            withdrawn: (false, false),
        });

        match ChannelStatus::from_state_counter(slot.state_counter) {
            ChannelStatus::Uninitialised | ChannelStatus::Funding | ChannelStatus::Open => {}
            other => {
                return Err(ChainError::Revert(format!(
                    "cannot fund channel in status {:?}",
                    other
                )))
            }
        }

        slot.deposit += amount;
        if self.node == slot.participants.0 {
            slot.party_a_balance += amount;
        }
        slot.set_status(ChannelStatus::Open);
        debug!(channel = %hex_id(&id), amount, "channel funded");

        let _ = self
            .ledger
            .events
            .send(ChainEvent::OpenedChannel { channel_id: id });
        Ok(())
    }

    async fn initiate_channel_closure(&self, counterparty: Address) -> Result<(), ChainError> {
        let id = channel_id(self.node, counterparty);
        let mut state = self.ledger.state.write().await;
        let block_time = state.block.timestamp;
        let window = state.closure_window;
        let slot = state
            .channels
            .get_mut(&id)
            .ok_or_else(|| ChainError::Revert("no such channel".into()))?;

        if ChannelStatus::from_state_counter(slot.state_counter) != ChannelStatus::Open {
            return Err(ChainError::Revert("channel is not open".into()));
        }
        slot.closure_time = block_time + window;
        slot.set_status(ChannelStatus::PendingClosure);
        Ok(())
    }

    async fn claim_channel_closure(&self, counterparty: Address) -> Result<(), ChainError> {
        let id = channel_id(self.node, counterparty);
        let mut state = self.ledger.state.write().await;
        let block_time = state.block.timestamp;
        let slot = state
            .channels
            .get_mut(&id)
            .ok_or_else(|| ChainError::Revert("no such channel".into()))?;

        match slot.snapshot().status(block_time) {
            ChannelStatus::Withdrawable => {
                slot.set_status(ChannelStatus::Closed);
                Ok(())
            }
            // Claiming an already-closed channel is a no-op.
            ChannelStatus::Closed => Ok(()),
            _ => Err(ChainError::Revert("closure period not elapsed".into())),
        }
    }

    async fn close_channel(&self, args: SettlementArgs) -> Result<(), ChainError> {
        let mut state = self.ledger.state.write().await;
        let block_time = state.block.timestamp;
        let window = state.closure_window;
        let slot = state
            .channels
            .get_mut(&args.channel_id)
            .ok_or_else(|| ChainError::Revert("no such channel".into()))?;

        match ChannelStatus::from_state_counter(slot.state_counter) {
            ChannelStatus::Open | ChannelStatus::PendingClosure => {}
            other => {
                return Err(ChainError::Revert(format!(
                    "cannot settle channel in status {:?}",
                    other
                )))
            }
        }
        if args.index <= slot.settled_index {
            return Err(ChainError::Revert("stale settlement".into()));
        }
        if args.value > slot.deposit {
            return Err(ChainError::Revert("settlement exceeds deposit".into()));
        }

        slot.party_a_balance = args.value;
        slot.settled_index = args.index;
        if ChannelStatus::from_state_counter(slot.state_counter) == ChannelStatus::Open {
            slot.closure_time = block_time + window;
            slot.set_status(ChannelStatus::PendingClosure);
        }
        debug!(
            channel = %hex_id(&args.channel_id),
            index = args.index,
            value = args.value,
            "settlement accepted"
        );

        let _ = self.ledger.events.send(ChainEvent::ClosedChannel {
            channel_id: args.channel_id,
        });
        Ok(())
    }

    async fn withdraw(&self, counterparty: Address) -> Result<u64, ChainError> {
        let id = channel_id(self.node, counterparty);
        let mut state = self.ledger.state.write().await;
        let block_time = state.block.timestamp;
        let slot = state
            .channels
            .get_mut(&id)
            .ok_or_else(|| ChainError::Revert("no such channel".into()))?;

        match slot.snapshot().status(block_time) {
            ChannelStatus::Withdrawable | ChannelStatus::Closed => {}
            _ => return Err(ChainError::Revert("closure period not elapsed".into())),
        }

        let is_party_a = self.node == slot.participants.0;
        let already = if is_party_a {
            &mut slot.withdrawn.0
        } else {
            &mut slot.withdrawn.1
        };
        if *already {
            return Err(ChainError::Revert("already withdrawn".into()));
        }
        *already = true;

        let share = if is_party_a {
            slot.party_a_balance
        } else {
            slot.deposit - slot.party_a_balance
        };
        if slot.withdrawn.0 && slot.withdrawn.1 {
            slot.set_status(ChannelStatus::Closed);
        }
        *state.payouts.entry(self.node).or_insert(0) += share;
        Ok(share)
    }

    async fn send_transaction(&self, _raw: Vec<u8>) -> Result<(), ChainError> {
        Ok(())
    }

    async fn get_block(&self) -> Result<Block, ChainError> {
        Ok(self.ledger.state.read().await.block)
    }

    fn subscribe_blocks(&self) -> broadcast::Receiver<Block> {
        self.ledger.blocks.subscribe()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChainEvent> {
        self.ledger.events.subscribe()
    }

    async fn test_block_advance(&self, seconds: u64) -> Result<(), ChainError> {
        let block = {
            let mut state = self.ledger.state.write().await;
            state.block.number += 1;
            state.block.timestamp += seconds;
            state.block
        };
        let _ = self.ledger.blocks.send(block);
        Ok(())
    }
}

fn hex_id(id: &[u8; 32]) -> String {
    id[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses() -> (Address, Address) {
        // Fixed bytes give a deterministic partyA assignment.
        (
            Address::from_bytes([1u8; 20]),
            Address::from_bytes([9u8; 20]),
        )
    }

    #[tokio::test]
    async fn test_fund_and_read_back() {
        let ledger = MockLedger::new();
        let (a, b) = addresses();
        let chain_a = ledger.backend_for(a);

        chain_a.open_channel(b, 10).await.unwrap();

        let id = channel_id(a, b);
        let channel = chain_a.get_channel(id).await.unwrap();
        assert_eq!(channel.deposit, 10);
        assert_eq!(channel.party_a_balance, 10);
        assert_eq!(
            ChannelStatus::from_state_counter(channel.state_counter),
            ChannelStatus::Open
        );
    }

    #[tokio::test]
    async fn test_unknown_channel_reads_uninitialised() {
        let ledger = MockLedger::new();
        let (a, _) = addresses();
        let chain = ledger.backend_for(a);

        let channel = chain.get_channel([0xee; 32]).await.unwrap();
        assert_eq!(channel.state_counter, 0);
    }

    #[tokio::test]
    async fn test_withdraw_before_closure_time_reverts() {
        let ledger = MockLedger::new();
        let (a, b) = addresses();
        let chain_a = ledger.backend_for(a);

        chain_a.open_channel(b, 10).await.unwrap();
        chain_a.initiate_channel_closure(b).await.unwrap();

        assert!(matches!(
            chain_a.withdraw(b).await,
            Err(ChainError::Revert(_))
        ));

        chain_a
            .test_block_advance(DEFAULT_CLOSURE_WINDOW_SECS + 1)
            .await
            .unwrap();
        assert_eq!(chain_a.withdraw(b).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_settlement_splits_deposit() {
        let ledger = MockLedger::new();
        let (a, b) = addresses();
        let chain_a = ledger.backend_for(a);
        let chain_b = ledger.backend_for(b);
        let id = channel_id(a, b);

        chain_a.open_channel(b, 10).await.unwrap();
        chain_a
            .close_channel(SettlementArgs {
                channel_id: id,
                index: 1,
                nonce: 0,
                value: 3,
                curve_point: [2u8; 33],
                signature: [0u8; 64],
                recovery: 0,
            })
            .await
            .unwrap();

        chain_a
            .test_block_advance(DEFAULT_CLOSURE_WINDOW_SECS + 1)
            .await
            .unwrap();
        assert_eq!(chain_a.withdraw(b).await.unwrap(), 3);
        assert_eq!(chain_b.withdraw(a).await.unwrap(), 7);
        assert_eq!(ledger.payout_of(a).await, 3);
        assert_eq!(ledger.payout_of(b).await, 7);
    }

    #[tokio::test]
    async fn test_stale_settlement_rejected() {
        let ledger = MockLedger::new();
        let (a, b) = addresses();
        let chain_a = ledger.backend_for(a);
        let id = channel_id(a, b);

        chain_a.open_channel(b, 10).await.unwrap();
        let args = SettlementArgs {
            channel_id: id,
            index: 5,
            nonce: 0,
            value: 4,
            curve_point: [2u8; 33],
            signature: [0u8; 64],
            recovery: 0,
        };
        chain_a.close_channel(args).await.unwrap();

        // Same or lower index cannot displace the accepted settlement.
        assert!(matches!(
            chain_a.close_channel(SettlementArgs { index: 5, ..args }).await,
            Err(ChainError::Revert(_))
        ));
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let ledger = MockLedger::new();
        let (a, b) = addresses();
        let chain_a = ledger.backend_for(a);
        let mut events = chain_a.subscribe_events();

        chain_a.open_channel(b, 10).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ChainEvent::OpenedChannel {
                channel_id: channel_id(a, b)
            }
        );
    }
}
