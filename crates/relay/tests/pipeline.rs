//! End-to-end scenarios: packets relayed across real channel state, with the
//! mock ledger playing the contract.

use std::time::Duration;

use chain::{ChainBackend, MockChain, MockLedger};
use channel::ChannelError;
use crypto::Identity;
use relay::{DropReason, Effect, NodeConfig, PacketPipeline};
use secp256k1::PublicKey;
use store::MemoryStore;

struct Node {
    identity: Identity,
    pipeline: PacketPipeline<MockChain, MemoryStore>,
}

impl Node {
    fn new(ledger: &MockLedger) -> Self {
        let identity = Identity::generate();
        let chain = ledger.backend_for(identity.address());
        let pipeline =
            PacketPipeline::new(identity.clone(), chain, MemoryStore::new(), NodeConfig::default());
        Node { identity, pipeline }
    }

    fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    async fn balance_with(&self, peer: &Node) -> u64 {
        self.pipeline
            .manager()
            .load_channel(peer.public_key())
            .await
            .unwrap()
            .our_balance()
    }

    async fn index_with(&self, peer: &Node) -> u64 {
        self.pipeline
            .manager()
            .load_channel(peer.public_key())
            .await
            .unwrap()
            .index
    }
}

/// Fund a channel from `funder` and let `recipient` pick it up from chain.
async fn open_channel(funder: &Node, recipient: &Node, amount: u64) {
    funder
        .pipeline
        .manager()
        .open_or_fund(recipient.public_key(), amount)
        .await
        .unwrap();
    recipient
        .pipeline
        .manager()
        .open_or_fund(funder.public_key(), 0)
        .await
        .unwrap();
}

/// Spawn a task that keeps advancing mock block time.
fn tick_blocks(chain: MockChain) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = chain.test_block_advance(10).await;
        }
    })
}

#[tokio::test]
async fn three_hop_delivery_full_success() {
    let ledger = MockLedger::new();
    let a = Node::new(&ledger);
    let b = Node::new(&ledger);
    let c = Node::new(&ledger);
    let d = Node::new(&ledger);

    open_channel(&a, &b, 10).await;
    open_channel(&b, &c, 10).await;
    open_channel(&c, &d, 10).await;

    let path = vec![*b.public_key(), *c.public_key(), *d.public_key()];
    let outbound = a.pipeline.send(&path, b"hello").await.unwrap();
    assert_eq!(&outbound.first_hop, b.public_key());

    // B: receives the prepaid (hops − 1) · fee = 2, keeps 1, forwards 1.
    let effect = b
        .pipeline
        .process(a.public_key(), &outbound.frame)
        .await
        .unwrap();
    let (next, frame_b) = match effect {
        Effect::Forward { next_hop, frame } => (next_hop, frame),
        _ => panic!("B must forward"),
    };
    assert_eq!(&next, c.public_key());
    assert_eq!(frame_b.len(), outbound.frame.len(), "packet size constancy");
    assert_eq!(b.balance_with(&a).await, 2);
    assert_eq!(b.index_with(&a).await, 1);

    // C: receives 1, forwards 0.
    let effect = c.pipeline.process(b.public_key(), &frame_b).await.unwrap();
    let (next, frame_c) = match effect {
        Effect::Forward { next_hop, frame } => (next_hop, frame),
        _ => panic!("C must forward"),
    };
    assert_eq!(&next, d.public_key());
    assert_eq!(frame_c.len(), frame_b.len(), "packet size constancy");
    assert_eq!(c.balance_with(&b).await, 1);
    assert_eq!(c.index_with(&b).await, 1);

    // D: terminal hop, zero fee is legal.
    let effect = d.pipeline.process(c.public_key(), &frame_c).await.unwrap();
    match effect {
        Effect::Deliver { plaintext } => assert_eq!(plaintext, b"hello"),
        _ => panic!("D must deliver"),
    }
    assert_eq!(d.balance_with(&c).await, 0);
    assert_eq!(d.index_with(&c).await, 1);

    assert_eq!(b.pipeline.stats().forwarded, 1);
    assert_eq!(d.pipeline.stats().delivered, 1);
    assert_eq!(a.pipeline.stats().dropped, 0);
}

#[tokio::test]
async fn replay_at_first_relay_is_dropped() {
    let ledger = MockLedger::new();
    let a = Node::new(&ledger);
    let b = Node::new(&ledger);
    let c = Node::new(&ledger);

    open_channel(&a, &b, 10).await;
    open_channel(&b, &c, 10).await;

    let path = vec![*b.public_key(), *c.public_key()];
    let outbound = a.pipeline.send(&path, b"hello").await.unwrap();

    let first = b
        .pipeline
        .process(a.public_key(), &outbound.frame)
        .await
        .unwrap();
    assert!(matches!(first, Effect::Forward { .. }));
    let value_after_first = b.balance_with(&a).await;
    let index_after_first = b.index_with(&a).await;

    // A resends the identical packet.
    let second = b
        .pipeline
        .process(a.public_key(), &outbound.frame)
        .await
        .unwrap();
    assert!(matches!(second, Effect::Drop(DropReason::Replay)));

    // No channel movement from the replay.
    assert_eq!(b.balance_with(&a).await, value_after_first);
    assert_eq!(b.index_with(&a).await, index_after_first);
}

#[tokio::test]
async fn flipped_header_bit_drops_silently() {
    let ledger = MockLedger::new();
    let a = Node::new(&ledger);
    let b = Node::new(&ledger);
    let c = Node::new(&ledger);

    open_channel(&a, &b, 10).await;
    open_channel(&b, &c, 10).await;

    let path = vec![*b.public_key(), *c.public_key()];
    let outbound = a.pipeline.send(&path, b"hello").await.unwrap();

    // Flip one bit inside beta (alpha occupies the first 33 header bytes).
    let mut frame = outbound.frame.clone();
    frame[40] ^= 0x01;

    let effect = b.pipeline.process(a.public_key(), &frame).await.unwrap();
    assert!(matches!(effect, Effect::Drop(DropReason::BadMac)));

    // Nothing was accepted on the channel.
    assert_eq!(b.balance_with(&a).await, 0);
    assert_eq!(b.index_with(&a).await, 0);
}

#[tokio::test]
async fn unilateral_settlement_splits_the_deposit() {
    let ledger = MockLedger::with_closure_window(30);
    let a = Node::new(&ledger);
    let b = Node::new(&ledger);

    open_channel(&a, &b, 10).await;

    // A pays B 7 off-chain, leaving A with 3 of the 10 deposit.
    let tx = a
        .pipeline
        .manager()
        .transfer(
            b.public_key(),
            7,
            *crypto::Identity::generate().public_key(),
        )
        .await
        .unwrap();
    b.pipeline
        .manager()
        .absorb_transaction(a.public_key(), &tx)
        .await
        .unwrap();
    a.pipeline.manager().confirm_transfer(&tx).await.unwrap();

    // B refuses cooperation; A settles unilaterally and waits out the
    // closure window.
    let ticker = tick_blocks(ledger.backend_for(a.identity.address()));
    let withdrawn = a
        .pipeline
        .manager()
        .close_channel(b.public_key(), None, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(withdrawn, 3);

    let withdrawn_b = b
        .pipeline
        .manager()
        .withdraw(a.public_key())
        .await
        .unwrap();
    ticker.await.unwrap();
    assert_eq!(withdrawn_b, 7);

    assert_eq!(ledger.payout_of(a.identity.address()).await, 3);
    assert_eq!(ledger.payout_of(b.identity.address()).await, 7);
}

#[tokio::test]
async fn divergent_state_is_fatal_and_accepts_no_packet() {
    let ledger = MockLedger::new();
    let a = Node::new(&ledger);
    let b = Node::new(&ledger);

    // The channel exists on-chain, but B has no local record of it.
    a.pipeline
        .manager()
        .open_or_fund(b.public_key(), 10)
        .await
        .unwrap();

    assert!(matches!(
        b.pipeline.manager().is_open(a.public_key()).await,
        Err(ChannelError::StateDivergence)
    ));

    // A packet over the divergent channel is not accepted.
    let outbound = a
        .pipeline
        .send(&[*b.public_key()], b"hello")
        .await
        .unwrap();
    let effect = b
        .pipeline
        .process(a.public_key(), &outbound.frame)
        .await
        .unwrap();
    assert!(matches!(effect, Effect::Drop(DropReason::NoChannel)));
}

#[tokio::test]
async fn two_tickets_one_winning() {
    let ledger = MockLedger::new();
    let b = Node::new(&ledger);
    let manager = b.pipeline.manager();

    // Two tickets from the same channel at probability 1/2, with the two
    // extreme pre-images.
    for (slot, hashed) in [([1u8; 32], [0x11; 32]), ([2u8; 32], [0x22; 32])] {
        let ticket = channel::Ticket {
            channel_id: channel::ChannelId(slot),
            challenge: crypto::Identity::generate().public_key().serialize(),
            hashed_key_half: hashed,
            amount: 4,
            win_prob: 1u64 << 63,
            on_chain_secret: [0u8; 32],
        };
        manager.register_ticket(&ticket).await.unwrap();
    }

    // SHA256(0x00…00) < 2^63 wins, SHA256(0xff…ff) loses.
    assert_eq!(manager.redeem_ticket(&[0x11; 32], &[0x00; 32]).await.unwrap(), 4);
    assert!(matches!(
        manager.redeem_ticket(&[0x22; 32], &[0xff; 32]).await,
        Err(ChannelError::LosingTicket)
    ));
}

#[tokio::test]
async fn index_is_strictly_monotonic_across_packets() {
    let ledger = MockLedger::new();
    let a = Node::new(&ledger);
    let b = Node::new(&ledger);

    open_channel(&a, &b, 10).await;

    for expected_index in 1..=3u64 {
        let outbound = a
            .pipeline
            .send(&[*b.public_key()], b"ping")
            .await
            .unwrap();
        let effect = b
            .pipeline
            .process(a.public_key(), &outbound.frame)
            .await
            .unwrap();
        assert!(matches!(effect, Effect::Deliver { .. }));
        assert_eq!(b.index_with(&a).await, expected_index);
    }
}
