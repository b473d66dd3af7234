//! Channel Manager
//!
//! High-level API over the per-counterparty payment channels: funding,
//! off-chain transfers, absorbing updates carried by packets, cooperative and
//! unilateral settlement, withdrawal, and ticket bookkeeping.
//!
//! All durable state lives in the kv store under the documented key layout;
//! the chain backend is authoritative whenever the two disagree.

use std::time::Duration;

use async_trait::async_trait;
use chain::{ChainBackend, ChainEvent, ChannelStatus, SettlementArgs};
use crypto::{combine_key_halves, Address, Identity};
use secp256k1::PublicKey;
use store::{keys, BatchOp, KvStore, StoreError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::messages::{SettleChannelRequest, SettleChannelResponse};
use crate::state::{embedded_money, Channel, ChannelId, ChannelRecord};
use crate::ticket::Ticket;
use crate::transaction::UpdateTransaction;
use crate::ChannelError;

/// How long a cooperative settlement request may take before the node
/// settles unilaterally with whatever update it holds.
pub const SETTLEMENT_TIMEOUT: Duration = Duration::from_secs(40);

/// Counterparty reachable over the `SETTLE_CHANNEL` stream protocol.
#[async_trait]
pub trait SettlementPeer: Send + Sync {
    async fn request_settlement(
        &self,
        counterparty: &PublicKey,
        request: SettleChannelRequest,
    ) -> anyhow::Result<SettleChannelResponse>;
}

/// Events emitted by the channel manager.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    /// Channel funded and usable.
    Opened {
        channel_id: ChannelId,
        counterparty: Address,
        balance: u64,
    },
    /// An update was accepted.
    Updated {
        channel_id: ChannelId,
        index: u64,
        current_value: u64,
        received: u64,
    },
    /// A pending ticket was registered.
    TicketRegistered { channel_id: ChannelId, amount: u64 },
    /// Settlement was submitted.
    Closing { channel_id: ChannelId },
    /// Funds withdrawn, channel pruned.
    Closed {
        channel_id: ChannelId,
        withdrawn: u64,
    },
}

/// Channel manager for one node.
pub struct ChannelManager<C, S> {
    identity: Identity,
    chain: C,
    store: S,
    event_tx: Option<mpsc::UnboundedSender<ChannelEvent>>,
}

impl<C: ChainBackend, S: KvStore> ChannelManager<C, S> {
    pub fn new(identity: Identity, chain: C, store: S) -> Self {
        ChannelManager {
            identity,
            chain,
            store,
            event_tx: None,
        }
    }

    /// Set event channel for receiving notifications.
    pub fn set_event_channel(&mut self, tx: mpsc::UnboundedSender<ChannelEvent>) {
        self.event_tx = Some(tx);
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Channel id shared with a counterparty.
    pub fn channel_id_with(&self, counterparty: &PublicKey) -> ChannelId {
        ChannelId::derive(self.identity.address(), Address::from_public_key(counterparty))
    }

    fn emit(&self, event: ChannelEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn we_are_party_a(&self, counterparty: &PublicKey) -> bool {
        self.identity.address() <= Address::from_public_key(counterparty)
    }

    // ========================================
    // Local state access
    // ========================================

    async fn get_u64(&self, key: &[u8]) -> Result<u64, ChannelError> {
        match self.store.get(key).await {
            Ok(bytes) if bytes.len() == 8 => {
                Ok(u64::from_be_bytes(bytes.try_into().expect("checked length")))
            }
            Ok(_) => Err(ChannelError::Malformed),
            Err(StoreError::NotFound) => Err(ChannelError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the local view of the channel with `counterparty`.
    pub async fn load_channel(&self, counterparty: &PublicKey) -> Result<Channel, ChannelError> {
        let record_key = keys::channel_record(&counterparty.serialize());
        let record = match self.store.get(&record_key).await {
            Ok(bytes) => ChannelRecord::from_bytes(&bytes).map_err(|_| ChannelError::Malformed)?,
            Err(StoreError::NotFound) => return Err(ChannelError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let id = ChannelId(record.channel_id);
        let index = self.get_u64(&keys::index(id.as_bytes())).await.unwrap_or(0);
        let current_value = self
            .get_u64(&keys::current_value(id.as_bytes()))
            .await
            .unwrap_or(0);

        Ok(Channel {
            id,
            counterparty: *counterparty,
            we_are_party_a: self.we_are_party_a(counterparty),
            balance: record.balance,
            current_value,
            index,
            status: record.status(),
            closure_time: record.closure_time,
        })
    }

    /// Write the local record and balance keys from on-chain state.
    async fn persist_from_chain(&self, counterparty: &PublicKey) -> Result<(), ChannelError> {
        let id = self.channel_id_with(counterparty);
        let on_chain = self.chain.get_channel(*id.as_bytes()).await?;

        let record = ChannelRecord {
            channel_id: *id.as_bytes(),
            counterparty: counterparty.serialize(),
            balance: on_chain.deposit,
            closure_time: on_chain.closure_time,
            status_digit: (on_chain.state_counter % 10) as u8,
        };

        let mut ops = vec![
            BatchOp::Put(
                keys::channel_record(&counterparty.serialize()),
                record.to_bytes(),
            ),
            BatchOp::Put(
                keys::counterparty_key(id.as_bytes()),
                counterparty.serialize().to_vec(),
            ),
            BatchOp::Put(
                keys::on_chain_balance(id.as_bytes()),
                on_chain.deposit.to_be_bytes().to_vec(),
            ),
            BatchOp::Put(
                keys::total_balance(id.as_bytes()),
                on_chain.deposit.to_be_bytes().to_vec(),
            ),
        ];

        // Never clobber off-chain progress when re-syncing.
        if self.get_u64(&keys::index(id.as_bytes())).await.is_err() {
            ops.push(BatchOp::Put(
                keys::index(id.as_bytes()),
                0u64.to_be_bytes().to_vec(),
            ));
            ops.push(BatchOp::Put(
                keys::current_value(id.as_bytes()),
                on_chain.party_a_balance.to_be_bytes().to_vec(),
            ));
            ops.push(BatchOp::Put(
                keys::initial_balance(id.as_bytes()),
                on_chain.party_a_balance.to_be_bytes().to_vec(),
            ));
        }

        self.store.batch(ops).await?;
        Ok(())
    }

    /// Delete every key belonging to the channel.
    async fn prune_channel(&self, counterparty: &PublicKey) -> Result<(), ChannelError> {
        let id = self.channel_id_with(counterparty);
        let mut ops: Vec<BatchOp> = keys::all_channel_keys(id.as_bytes())
            .into_iter()
            .map(BatchOp::Del)
            .collect();
        ops.push(BatchOp::Del(keys::channel_record(&counterparty.serialize())));

        let (gte, lte) = keys::challenge_range(id.as_bytes());
        for (key, _) in self.store.range(&gte, &lte).await? {
            ops.push(BatchOp::Del(key));
        }
        let nonce_gte = keys::nonce(id.as_bytes(), &[0x00; 32]);
        let nonce_lte = keys::nonce(id.as_bytes(), &[0xff; 32]);
        for (key, _) in self.store.range(&nonce_gte, &nonce_lte).await? {
            ops.push(BatchOp::Del(key));
        }

        self.store.batch(ops).await?;
        debug!(channel = %id, "pruned local channel state");
        Ok(())
    }

    // ========================================
    // Funding
    // ========================================

    /// Ensure an open funded channel with `counterparty` exists.
    ///
    /// On-chain state is authoritative: a stale local record is pruned, a
    /// missing one is rebuilt, and only a channel absent on both sides is
    /// funded fresh.
    pub async fn open_or_fund(
        &self,
        counterparty: &PublicKey,
        amount: u64,
    ) -> Result<(), ChannelError> {
        let id = self.channel_id_with(counterparty);
        let on_chain = self.chain.get_channel(*id.as_bytes()).await?;
        let on_chain_present =
            ChannelStatus::from_state_counter(on_chain.state_counter) != ChannelStatus::Uninitialised;
        let local_present = self
            .store
            .get(&keys::channel_record(&counterparty.serialize()))
            .await
            .is_ok();

        match (on_chain_present, local_present) {
            (true, true) => return Ok(()),
            (true, false) => {
                // Rebuild from chain; no new funding.
                self.persist_from_chain(counterparty).await?;
            }
            (false, present) => {
                if present {
                    warn!(channel = %id, "local record without on-chain channel, pruning");
                    self.prune_channel(counterparty).await?;
                }
                self.chain
                    .open_channel(Address::from_public_key(counterparty), amount)
                    .await?;
                self.persist_from_chain(counterparty).await?;
            }
        }

        let channel = self.load_channel(counterparty).await?;
        info!(channel = %id, balance = channel.balance, "channel open");
        self.emit(ChannelEvent::Opened {
            channel_id: id,
            counterparty: Address::from_public_key(counterparty),
            balance: channel.balance,
        });
        Ok(())
    }

    /// Whether packets may be relayed over the channel with `counterparty`.
    ///
    /// True iff the on-chain channel is Open or PendingClosure *and* a local
    /// record exists. An on-chain channel without local state is a
    /// divergence the node cannot reconcile.
    pub async fn is_open(&self, counterparty: &PublicKey) -> Result<bool, ChannelError> {
        let id = self.channel_id_with(counterparty);
        let on_chain = self.chain.get_channel(*id.as_bytes()).await?;
        let status = ChannelStatus::from_state_counter(on_chain.state_counter);
        let local_present = self
            .store
            .get(&keys::channel_record(&counterparty.serialize()))
            .await
            .is_ok();

        match status {
            ChannelStatus::Open | ChannelStatus::PendingClosure => {
                if local_present {
                    Ok(true)
                } else {
                    Err(ChannelError::StateDivergence)
                }
            }
            ChannelStatus::Uninitialised => {
                if local_present {
                    self.prune_channel(counterparty).await?;
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    // ========================================
    // Off-chain transfers
    // ========================================

    /// Construct a signed update moving `amount` toward `counterparty`.
    ///
    /// Nothing is persisted here; the sender confirms with
    /// [`confirm_transfer`](Self::confirm_transfer) once the packet is on its
    /// way, and the recipient persists when it absorbs the update.
    pub async fn transfer(
        &self,
        counterparty: &PublicKey,
        amount: u64,
        curve_point: PublicKey,
    ) -> Result<UpdateTransaction, ChannelError> {
        let channel = self.load_channel(counterparty).await?;
        if !channel.accepts_updates() {
            return Err(ChannelError::NotOpen);
        }
        let new_value = channel.value_after_sending(amount)?;
        Ok(UpdateTransaction::create(
            &self.identity,
            channel.id,
            channel.index + 1,
            new_value,
            curve_point,
        ))
    }

    /// Persist a transfer this node created, after the packet carrying it
    /// was handed to the transport.
    pub async fn confirm_transfer(&self, tx: &UpdateTransaction) -> Result<(), ChannelError> {
        let id = tx.channel_id;
        let mut ops = vec![
            BatchOp::Put(keys::index(id.as_bytes()), tx.index.to_be_bytes().to_vec()),
            BatchOp::Put(
                keys::current_value(id.as_bytes()),
                tx.value.to_be_bytes().to_vec(),
            ),
            BatchOp::Put(keys::latest_tx(id.as_bytes()), tx.to_bytes().to_vec()),
        ];
        if self.store.get(&keys::restore_tx(id.as_bytes())).await.is_err() {
            ops.push(BatchOp::Put(
                keys::restore_tx(id.as_bytes()),
                tx.to_bytes().to_vec(),
            ));
        }
        self.store.batch(ops).await?;
        Ok(())
    }

    /// Record a signature nonce, failing on the second appearance.
    ///
    /// The sole defense against a counterparty replaying the same signed
    /// update; reuse is fatal for the channel.
    pub async fn test_and_set_nonce(
        &self,
        channel_id: &ChannelId,
        nonce_hash: &[u8; 32],
    ) -> Result<(), ChannelError> {
        let key = keys::nonce(channel_id.as_bytes(), nonce_hash);
        match self.store.get(&key).await {
            Ok(_) => Err(ChannelError::NonceReuse),
            Err(StoreError::NotFound) => {
                self.store.put(&key, &[1u8]).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Validate and persist an update received from `prev`, returning the
    /// amount it moved toward this node.
    pub async fn absorb_transaction(
        &self,
        prev: &PublicKey,
        tx: &UpdateTransaction,
    ) -> Result<u64, ChannelError> {
        let channel = self.load_channel(prev).await?;
        if tx.channel_id != channel.id {
            return Err(ChannelError::WrongChannel);
        }
        if !channel.accepts_updates() {
            return Err(ChannelError::NotOpen);
        }
        tx.verify_signer(prev)?;
        if tx.index != channel.index + 1 {
            return Err(ChannelError::StaleIndex {
                expected: channel.index + 1,
                got: tx.index,
            });
        }
        let received = embedded_money(
            !channel.we_are_party_a,
            channel.balance,
            channel.current_value,
            tx.value,
        )?;

        self.test_and_set_nonce(&channel.id, &tx.nonce_hash()).await?;

        let id = channel.id;
        let mut ops = vec![
            BatchOp::Put(keys::index(id.as_bytes()), tx.index.to_be_bytes().to_vec()),
            BatchOp::Put(
                keys::current_value(id.as_bytes()),
                tx.value.to_be_bytes().to_vec(),
            ),
            BatchOp::Put(keys::latest_tx(id.as_bytes()), tx.to_bytes().to_vec()),
            BatchOp::Put(
                keys::challenge(id.as_bytes(), &tx.curve_point.serialize()),
                vec![1u8],
            ),
        ];
        if self.store.get(&keys::restore_tx(id.as_bytes())).await.is_err() {
            ops.push(BatchOp::Put(
                keys::restore_tx(id.as_bytes()),
                tx.to_bytes().to_vec(),
            ));
        }
        self.store.batch(ops).await?;

        debug!(
            channel = %id,
            index = tx.index,
            received,
            "absorbed channel update"
        );
        self.emit(ChannelEvent::Updated {
            channel_id: id,
            index: tx.index,
            current_value: tx.value,
            received,
        });
        Ok(received)
    }

    // ========================================
    // Tickets and challenges
    // ========================================

    /// Persist a pending ticket keyed by its hashed key half.
    pub async fn register_ticket(&self, ticket: &Ticket) -> Result<(), ChannelError> {
        self.store
            .put(&keys::ticket(&ticket.hashed_key_half), &ticket.to_bytes())
            .await?;
        self.emit(ChannelEvent::TicketRegistered {
            channel_id: ticket.channel_id,
            amount: ticket.amount,
        });
        Ok(())
    }

    pub async fn get_ticket(&self, hashed_key_half: &[u8; 32]) -> Result<Ticket, ChannelError> {
        match self.store.get(&keys::ticket(hashed_key_half)).await {
            Ok(bytes) => Ticket::from_bytes(&bytes).map_err(|_| ChannelError::Malformed),
            Err(StoreError::NotFound) => Err(ChannelError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Redeem a pending ticket. Losing tickets would revert on-chain and are
    /// rejected here.
    pub async fn redeem_ticket(
        &self,
        hashed_key_half: &[u8; 32],
        pre_image: &[u8; 32],
    ) -> Result<u64, ChannelError> {
        let ticket = self.get_ticket(hashed_key_half).await?;
        if !ticket.is_winning(pre_image) {
            return Err(ChannelError::LosingTicket);
        }
        self.store.del(&keys::ticket(hashed_key_half)).await?;
        Ok(ticket.amount)
    }

    /// Combine every stored key-half point of the channel by elliptic-curve
    /// addition into the aggregate redemption point.
    pub async fn get_previous_challenges(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<PublicKey>, ChannelError> {
        let (gte, lte) = keys::challenge_range(channel_id.as_bytes());
        let entries = self.store.range(&gte, &lte).await?;
        let mut points = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            let point_bytes = &key[key.len() - 33..];
            let point =
                PublicKey::from_slice(point_bytes).map_err(|_| ChannelError::Malformed)?;
            points.push(point);
        }
        if points.is_empty() {
            return Ok(None);
        }
        Ok(Some(combine_key_halves(&points)?))
    }

    // ========================================
    // Settlement and withdrawal
    // ========================================

    /// Submit the best settlement this node holds, trying the latest update,
    /// then the restore transaction, then the stashed restore transaction.
    pub async fn submit_settlement(&self, channel_id: &ChannelId) -> Result<(), ChannelError> {
        let tx = self.best_settlement(channel_id).await?;
        let nonce = u64::from_be_bytes(
            tx.nonce_hash()[..8].try_into().expect("fixed slice"),
        );
        self.chain
            .close_channel(SettlementArgs {
                channel_id: *channel_id.as_bytes(),
                index: tx.index,
                nonce,
                value: tx.value,
                curve_point: tx.curve_point.serialize(),
                signature: tx.signature,
                recovery: tx.recovery,
            })
            .await?;
        self.emit(ChannelEvent::Closing {
            channel_id: *channel_id,
        });
        Ok(())
    }

    /// Answer a counterparty's `SETTLE_CHANNEL` request with the most
    /// recent update this node holds.
    pub async fn handle_settle_request(
        &self,
        request: &SettleChannelRequest,
    ) -> SettleChannelResponse {
        match self.best_settlement(&request.channel_id).await {
            Ok(tx) => SettleChannelResponse::with_transaction(&tx),
            Err(_) => SettleChannelResponse::empty(),
        }
    }

    async fn best_settlement(
        &self,
        channel_id: &ChannelId,
    ) -> Result<UpdateTransaction, ChannelError> {
        for key in [
            keys::latest_tx(channel_id.as_bytes()),
            keys::restore_tx(channel_id.as_bytes()),
            keys::stashed_restore_tx(channel_id.as_bytes()),
        ] {
            match self.store.get(&key).await {
                Ok(bytes) => return UpdateTransaction::from_bytes(&bytes),
                Err(StoreError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ChannelError::NotFound)
    }

    /// Close the channel with `counterparty` and withdraw this node's share.
    ///
    /// If the counterparty holds a more recent update than we do, it is
    /// asked for it over `SETTLE_CHANNEL` first; after
    /// [`SETTLEMENT_TIMEOUT`] the locally stored update is submitted anyway.
    pub async fn close_channel(
        &self,
        counterparty: &PublicKey,
        peer: Option<&dyn SettlementPeer>,
        settlement_timeout: Duration,
    ) -> Result<u64, ChannelError> {
        let id = self.channel_id_with(counterparty);
        let on_chain = self.chain.get_channel(*id.as_bytes()).await?;
        let block = self.chain.get_block().await?;

        match on_chain.status(block.timestamp) {
            ChannelStatus::Uninitialised => {
                self.prune_channel(counterparty).await?;
                Err(ChannelError::NotFound)
            }
            ChannelStatus::Funding | ChannelStatus::Open | ChannelStatus::PendingClosure => {
                self.cooperative_update(counterparty, id, peer, settlement_timeout)
                    .await;

                let mut events = self.chain.subscribe_events();
                match self.submit_settlement(&id).await {
                    Ok(()) => {
                        self.await_closed_event(&mut events, &id).await?;
                    }
                    Err(ChannelError::NotFound) => {
                        // No update was ever exchanged; fall back to a plain
                        // on-chain closure.
                        self.chain
                            .initiate_channel_closure(Address::from_public_key(counterparty))
                            .await?;
                    }
                    Err(e) => return Err(e),
                }
                self.withdraw(counterparty).await
            }
            ChannelStatus::Withdrawable => self.withdraw(counterparty).await,
            ChannelStatus::Closed => {
                self.prune_channel(counterparty).await?;
                Ok(0)
            }
        }
    }

    /// Ask the counterparty for a newer settlement if ours lags behind the
    /// channel's accepted index. Failure or timeout falls through to the
    /// stored update.
    async fn cooperative_update(
        &self,
        counterparty: &PublicKey,
        id: ChannelId,
        peer: Option<&dyn SettlementPeer>,
        settlement_timeout: Duration,
    ) {
        let Some(peer) = peer else { return };

        let local_index = self.get_u64(&keys::index(id.as_bytes())).await.unwrap_or(0);
        let stored_index = match self.best_settlement(&id).await {
            Ok(tx) => tx.index,
            Err(_) => 0,
        };
        if local_index <= stored_index {
            return;
        }

        debug!(channel = %id, local_index, stored_index, "requesting cooperative settlement");
        let request = SettleChannelRequest { channel_id: id };
        let response = timeout(
            settlement_timeout,
            peer.request_settlement(counterparty, request),
        )
        .await;

        match response {
            Ok(Ok(response)) => match response.into_transaction() {
                Ok(Some(tx))
                    if tx.channel_id == id
                        && tx.index > stored_index
                        && tx.verify_signer(counterparty).is_ok() =>
                {
                    if let Err(e) = self
                        .store
                        .put(&keys::latest_tx(id.as_bytes()), &tx.to_bytes())
                        .await
                    {
                        warn!(channel = %id, error = %e, "failed to stash cooperative settlement");
                    }
                }
                _ => debug!(channel = %id, "counterparty offered no usable settlement"),
            },
            Ok(Err(e)) => warn!(channel = %id, error = %e, "cooperative settlement failed"),
            Err(_) => warn!(channel = %id, "cooperative settlement timed out, settling unilaterally"),
        }
    }

    async fn await_closed_event(
        &self,
        events: &mut broadcast::Receiver<ChainEvent>,
        id: &ChannelId,
    ) -> Result<(), ChannelError> {
        loop {
            match events.recv().await {
                Ok(event) if event.channel_id() == *id.as_bytes() => {
                    if matches!(event, ChainEvent::ClosedChannel { .. }) {
                        return Ok(());
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ChannelError::Chain(chain::ChainError::Rpc(
                        "event stream closed".into(),
                    )))
                }
            }
        }
    }

    /// Wait until block time passes the closure deadline, withdraw this
    /// node's share, and prune all channel state.
    ///
    /// The deadline is re-read from chain state on every pass, so a
    /// reconnect or an out-of-order block re-derives it instead of trusting
    /// a cached value.
    pub async fn withdraw(&self, counterparty: &PublicKey) -> Result<u64, ChannelError> {
        let id = self.channel_id_with(counterparty);
        let mut blocks = self.chain.subscribe_blocks();
        let mut resubscribed = false;

        loop {
            let on_chain = self.chain.get_channel(*id.as_bytes()).await?;
            let block = self.chain.get_block().await?;
            if on_chain.closure_time > 0 && block.timestamp > on_chain.closure_time {
                break;
            }
            match blocks.recv().await {
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) if !resubscribed => {
                    blocks = self.chain.subscribe_blocks();
                    resubscribed = true;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ChannelError::Chain(chain::ChainError::Rpc(
                        "block stream closed".into(),
                    )))
                }
            }
        }

        let counterparty_address = Address::from_public_key(counterparty);
        self.chain
            .claim_channel_closure(counterparty_address)
            .await?;
        let amount = self.chain.withdraw(counterparty_address).await?;
        self.prune_channel(counterparty).await?;

        info!(channel = %id, amount, "withdrew channel balance");
        self.emit(ChannelEvent::Closed {
            channel_id: id,
            withdrawn: amount,
        });
        Ok(amount)
    }
}
