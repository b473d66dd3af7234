//! The packet pipeline driver.
//!
//! Glues the onion transform to the payment channels: a frame comes in from
//! the transport, and exactly one of three effects comes out: forward a
//! same-size frame to the next hop, deliver plaintext upward, or drop.
//! Adversarial input drops silently (counted, logged at debug); transient
//! and fatal failures surface as typed errors for the supervisor.
//!
//! Per-channel mutual exclusion covers everything from the channel read to
//! the outgoing transfer, so a suspended task can never interleave updates
//! on the same channel. The replay tag is inserted before any channel
//! mutation and stays inserted on failure, so retrying a half-processed
//! packet cannot recover the payment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use channel::{ChannelError, ChannelId, ChannelManager, Ticket, UpdateTransaction};
use chain::ChainBackend;
use crypto::{hash, hashed_key_half, Identity};
use packet::{ForwardPacket, Packet, PacketError, PacketOutline, Transform};
use secp256k1::PublicKey;
use store::{KvStore, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::NodeConfig;
use crate::replay::ReplayGuard;

/// Why a packet was silently dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Frame length is not the packet size.
    BadLength,
    /// Header MAC mismatch.
    BadMac,
    /// Replay tag already present.
    Replay,
    /// Challenge unbound or signed by the wrong peer.
    BadChallenge,
    /// Embedded transaction malformed or signed by the wrong peer.
    BadTransaction,
    /// Update index regression.
    StaleIndex,
    /// Carried value below the relay fee.
    InsufficientFee,
    /// No channel with the paying or the next peer.
    NoChannel,
    /// Channel exists but accepts no updates.
    ChannelClosed,
    /// Not enough outgoing capacity to forward.
    NoOutgoingCapacity,
    /// Any other malformed component.
    Malformed,
}

/// Outcome of processing one frame.
pub enum Effect {
    /// Hand the frame to the transport, addressed to `next_hop`.
    Forward {
        next_hop: PublicKey,
        frame: Vec<u8>,
    },
    /// The packet terminated here.
    Deliver { plaintext: Vec<u8> },
    /// Silently dropped.
    Drop(DropReason),
}

/// Non-drop pipeline failures.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("store failure: {0}")]
    Store(String),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        RelayError::Store(e.to_string())
    }
}

impl RelayError {
    /// Fatal failures require shutting down the affected channel.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Channel(e) if e.is_fatal())
    }
}

/// Drop and throughput counters.
#[derive(Default)]
pub struct PipelineStats {
    forwarded: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub forwarded: u64,
    pub delivered: u64,
    pub dropped: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// An outbound frame produced by [`PacketPipeline::send`].
pub struct Outbound {
    pub first_hop: PublicKey,
    pub frame: Vec<u8>,
}

/// One node's packet pipeline.
pub struct PacketPipeline<C, S> {
    manager: ChannelManager<C, S>,
    guard: ReplayGuard<S>,
    config: NodeConfig,
    channel_locks: Mutex<HashMap<ChannelId, Arc<Mutex<()>>>>,
    stats: PipelineStats,
}

enum Outcome {
    Forward(ForwardPacket),
    Deliver(Vec<u8>),
}

impl<C: ChainBackend, S: KvStore + Clone> PacketPipeline<C, S> {
    pub fn new(identity: Identity, chain: C, store: S, config: NodeConfig) -> Self {
        let guard = ReplayGuard::new(store.clone());
        let manager = ChannelManager::new(identity, chain, store);
        PacketPipeline {
            manager,
            guard,
            config,
            channel_locks: Mutex::new(HashMap::new()),
            stats: PipelineStats::default(),
        }
    }

    pub fn manager(&self) -> &ChannelManager<C, S> {
        &self.manager
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Construct a packet for `path` (last position is the destination) and
    /// prepay `(hops − 1) · relay_fee` to the first hop.
    pub async fn send(&self, path: &[PublicKey], plaintext: &[u8]) -> Result<Outbound, RelayError> {
        let outline = PacketOutline::plan(path)?;
        let first_hop = *outline.first_hop();
        let curve_point = outline.first_curve_point()?;
        let identity = self.manager.identity().clone();
        let loopback = &first_hop == identity.public_key();

        let transaction = if loopback {
            // Self-addressed packets carry a formally valid zero payment.
            UpdateTransaction::create(
                &identity,
                self.manager.channel_id_with(&first_hop),
                1,
                0,
                curve_point,
            )
        } else {
            let total_fee = (path.len() as u64 - 1) * self.config.relay_fee;
            self.manager
                .transfer(&first_hop, total_fee, curve_point)
                .await?
        };

        let packet = outline.finalize(&identity, plaintext, &transaction)?;
        if !loopback {
            self.manager.confirm_transfer(&transaction).await?;
        }
        Ok(Outbound {
            first_hop,
            frame: packet.to_bytes(),
        })
    }

    /// Process one frame received from `prev`.
    pub async fn process(&self, prev: &PublicKey, frame: &[u8]) -> Result<Effect, RelayError> {
        let packet = match Packet::from_bytes(frame) {
            Ok(packet) => packet,
            Err(PacketError::WrongSize(_)) => {
                return Ok(self.drop_packet(DropReason::BadLength))
            }
            Err(_) => return Ok(self.drop_packet(DropReason::Malformed)),
        };

        let transformed = match packet.transform(self.manager.identity(), prev) {
            Ok(transformed) => transformed,
            Err(PacketError::BadMac) => return Ok(self.drop_packet(DropReason::BadMac)),
            Err(PacketError::BadChallenge) => {
                return Ok(self.drop_packet(DropReason::BadChallenge))
            }
            Err(_) => return Ok(self.drop_packet(DropReason::Malformed)),
        };
        let (receipt, outcome) = match transformed {
            Transform::Forward { receipt, forward } => (receipt, Outcome::Forward(forward)),
            Transform::Deliver { receipt, plaintext } => (receipt, Outcome::Deliver(plaintext)),
        };

        // Replay check precedes every channel mutation; the tag stays
        // inserted no matter what happens below.
        if self.guard.seen_or_insert(&receipt.packet_tag).await? {
            return Ok(self.drop_packet(DropReason::Replay));
        }

        // Self-addressed packets never touch a channel.
        if prev == self.manager.identity().public_key() {
            return match outcome {
                Outcome::Deliver(plaintext) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    Ok(Effect::Deliver { plaintext })
                }
                Outcome::Forward(_) => Ok(self.drop_packet(DropReason::Malformed)),
            };
        }

        let channel_id = self.manager.channel_id_with(prev);
        let lock = self.channel_lock(&channel_id).await;
        let _held = lock.lock().await;

        let received = match self.manager.absorb_transaction(prev, &receipt.transaction).await {
            Ok(received) => received,
            Err(e) => return self.channel_failure(e),
        };

        match outcome {
            Outcome::Deliver(plaintext) => {
                // The terminal hop still registers its ticket; zero fee is
                // legal for the last transaction.
                let ticket = Ticket {
                    channel_id,
                    challenge: receipt.transaction.curve_point.serialize(),
                    hashed_key_half: hashed_key_half(&receipt.own_key_half_point),
                    amount: received,
                    win_prob: self.config.win_prob,
                    on_chain_secret: hash(&receipt.own_key_half_point.serialize()),
                };
                self.manager.register_ticket(&ticket).await?;

                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(Effect::Deliver { plaintext })
            }
            Outcome::Forward(forward) => {
                if received < self.config.relay_fee {
                    return Ok(self.drop_packet(DropReason::InsufficientFee));
                }
                let curve_point =
                    match forward.outgoing_curve_point(&receipt.own_key_half_point) {
                        Ok(point) => point,
                        Err(_) => return Ok(self.drop_packet(DropReason::Malformed)),
                    };
                let outgoing = match self
                    .manager
                    .transfer(
                        &forward.next_hop,
                        received - self.config.relay_fee,
                        curve_point,
                    )
                    .await
                {
                    Ok(tx) => tx,
                    Err(ChannelError::NotFound) => {
                        return Ok(self.drop_packet(DropReason::NoChannel))
                    }
                    Err(ChannelError::NotOpen) => {
                        return Ok(self.drop_packet(DropReason::ChannelClosed))
                    }
                    Err(ChannelError::InsufficientBalance { have, need }) => {
                        warn!(have, need, "cannot forward, outgoing channel underfunded");
                        return Ok(self.drop_packet(DropReason::NoOutgoingCapacity));
                    }
                    Err(e) => return self.channel_failure(e),
                };

                let ticket = Ticket {
                    channel_id,
                    challenge: receipt.transaction.curve_point.serialize(),
                    hashed_key_half: hashed_key_half(&forward.next_key_half),
                    amount: received,
                    win_prob: self.config.win_prob,
                    on_chain_secret: hash(&receipt.own_key_half_point.serialize()),
                };
                self.manager.register_ticket(&ticket).await?;

                let next_hop = forward.next_hop;
                let next_packet = match forward.assemble(self.manager.identity(), &outgoing) {
                    Ok(packet) => packet,
                    Err(_) => return Ok(self.drop_packet(DropReason::Malformed)),
                };
                self.manager.confirm_transfer(&outgoing).await?;

                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(Effect::Forward {
                    next_hop,
                    frame: next_packet.to_bytes(),
                })
            }
        }
    }

    async fn channel_lock(&self, id: &ChannelId) -> Arc<Mutex<()>> {
        let mut locks = self.channel_locks.lock().await;
        locks.entry(*id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn drop_packet(&self, reason: DropReason) -> Effect {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(?reason, "dropping packet");
        Effect::Drop(reason)
    }

    /// Classify a channel failure: adversarial input drops, everything else
    /// surfaces for the supervisor to retry or shut down.
    fn channel_failure(&self, e: ChannelError) -> Result<Effect, RelayError> {
        let reason = match &e {
            ChannelError::NotOpen => DropReason::ChannelClosed,
            ChannelError::NotFound => DropReason::NoChannel,
            ChannelError::WrongChannel
            | ChannelError::BadSigner
            | ChannelError::Malformed
            | ChannelError::ValueOutOfRange => DropReason::BadTransaction,
            ChannelError::StaleIndex { .. } => DropReason::StaleIndex,
            ChannelError::InsufficientFee { .. } => DropReason::InsufficientFee,
            _ => return Err(e.into()),
        };
        Ok(self.drop_packet(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain::MockLedger;
    use store::MemoryStore;

    fn pipeline(ledger: &MockLedger, identity: Identity) -> PacketPipeline<chain::MockChain, MemoryStore> {
        let chain = ledger.backend_for(identity.address());
        PacketPipeline::new(identity, chain, MemoryStore::new(), NodeConfig::default())
    }

    #[tokio::test]
    async fn test_wrong_length_frame_is_counted_drop() {
        let ledger = MockLedger::new();
        let node = Identity::generate();
        let other = Identity::generate();
        let p = pipeline(&ledger, node);

        let effect = p.process(other.public_key(), &[0u8; 10]).await.unwrap();
        assert!(matches!(effect, Effect::Drop(DropReason::BadLength)));
        assert_eq!(p.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_self_addressed_roundtrip() {
        let ledger = MockLedger::new();
        let node = Identity::generate();
        let p = pipeline(&ledger, node.clone());

        let outbound = p.send(&[*node.public_key()], b"note to self").await.unwrap();
        assert_eq!(&outbound.first_hop, node.public_key());

        let effect = p.process(node.public_key(), &outbound.frame).await.unwrap();
        match effect {
            Effect::Deliver { plaintext } => assert_eq!(plaintext, b"note to self"),
            _ => panic!("self-addressed packet must deliver"),
        }
        assert_eq!(p.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_unknown_sender_drops_without_channel() {
        let ledger = MockLedger::new();
        let node = Identity::generate();
        let stranger = Identity::generate();
        let p = pipeline(&ledger, node.clone());
        let sender = pipeline(&ledger, stranger.clone());

        // The stranger addresses us without any channel anywhere. Packet
        // construction needs a channel on the sender side, so fabricate the
        // frame via a loopback-style transaction.
        let outline = packet::PacketOutline::plan(&[*node.public_key()]).unwrap();
        let tx = UpdateTransaction::create(
            &stranger,
            sender.manager().channel_id_with(node.public_key()),
            1,
            0,
            outline.first_curve_point().unwrap(),
        );
        let frame = outline
            .finalize(&stranger, b"hi", &tx)
            .unwrap()
            .to_bytes();

        let effect = p.process(stranger.public_key(), &frame).await.unwrap();
        assert!(matches!(effect, Effect::Drop(DropReason::NoChannel)));
    }
}
