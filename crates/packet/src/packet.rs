//! Packet assembly, construction at the source, and the per-hop transform.
//!
//! A packet is the fixed-offset concatenation `header ‖ transaction ‖
//! challenge ‖ message`. Every hop performs identical work: derive the
//! shared secret, verify the MAC, peel one routing layer, open the embedded
//! transaction, check the challenge, remove one message layer, and either
//! terminate or emit the next packet of exactly the same size.

use channel::{UpdateTransaction, TRANSACTION_SIZE};
use crypto::{
    combine_key_halves, derive_packet_tag, derive_shared_secret, derive_shared_secret_for_peer,
    derive_transaction_key, key_half_point, transaction_seal_key, Identity, SharedSecret,
    PACKET_TAG_SIZE,
};
use secp256k1::{PublicKey, SecretKey, SECP256K1};

use crate::challenge::{Challenge, CHALLENGE_SIZE};
use crate::header::{create_header, Header, HEADER_SIZE, MAX_HOPS};
use crate::message::{OnionMessage, MESSAGE_SIZE};
use crate::PacketError;

/// Exact wire size of a packet frame.
pub const PACKET_SIZE: usize = HEADER_SIZE + TRANSACTION_SIZE + CHALLENGE_SIZE + MESSAGE_SIZE;

/// A fixed-size relay packet.
#[derive(Clone)]
pub struct Packet {
    pub header: Header,
    /// Embedded payment, sealed for the receiving hop.
    pub sealed_transaction: [u8; TRANSACTION_SIZE],
    pub challenge: Challenge,
    pub message: OnionMessage,
}

impl Packet {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PACKET_SIZE);
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.sealed_transaction);
        bytes.extend_from_slice(&self.challenge.to_bytes());
        bytes.extend_from_slice(self.message.as_bytes());
        bytes
    }

    /// Parse a frame. Anything but exactly [`PACKET_SIZE`] bytes is
    /// rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() != PACKET_SIZE {
            return Err(PacketError::WrongSize(bytes.len()));
        }
        let header = Header::from_bytes(&bytes[..HEADER_SIZE])?;
        let mut sealed_transaction = [0u8; TRANSACTION_SIZE];
        sealed_transaction.copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + TRANSACTION_SIZE]);
        let challenge = Challenge::from_bytes(
            &bytes[HEADER_SIZE + TRANSACTION_SIZE..HEADER_SIZE + TRANSACTION_SIZE + CHALLENGE_SIZE],
        )?;
        let message =
            OnionMessage::from_bytes(&bytes[HEADER_SIZE + TRANSACTION_SIZE + CHALLENGE_SIZE..])?;
        Ok(Packet {
            header,
            sealed_transaction,
            challenge,
            message,
        })
    }

    /// Process the packet at this hop.
    ///
    /// `prev` is the peer the transport received the frame from; it must
    /// match the challenge's signer. Every failure is a silent drop for the
    /// caller to count.
    pub fn transform(&self, identity: &Identity, prev: &PublicKey) -> Result<Transform, PacketError> {
        let secret = derive_shared_secret(&self.header.alpha, identity.secret_key())?;
        if !self.header.verify(&secret) {
            return Err(PacketError::BadMac);
        }
        let packet_tag = derive_packet_tag(&secret);

        let peeled = self.header.peel(&secret)?;
        let own_key_half = derive_transaction_key(&secret)?;
        let own_key_half_point = key_half_point(&own_key_half);

        // The challenge entering this hop must be bound to our key half and
        // signed by the peer that delivered the frame.
        let signer = self.challenge.get_counterparty(&own_key_half)?;
        if &signer != prev {
            return Err(PacketError::BadChallenge);
        }

        let seal_key = transaction_seal_key(identity.secret_key(), prev)?;
        let transaction = UpdateTransaction::open(&self.sealed_transaction, &seal_key)
            .map_err(|_| PacketError::Malformed)?;

        let mut message = self.message.clone();
        message.peel_layer(&secret);

        let receipt = HopReceipt {
            packet_tag,
            transaction,
            own_key_half,
            own_key_half_point,
        };

        if peeled.next_address == identity.public_key().serialize() {
            let plaintext = message.unwrap_plaintext()?;
            return Ok(Transform::Deliver { receipt, plaintext });
        }

        let next_hop =
            PublicKey::from_slice(&peeled.next_address).map_err(|_| PacketError::Malformed)?;
        let next_key_half =
            PublicKey::from_slice(&peeled.next_key_half).map_err(|_| PacketError::Malformed)?;
        let challenge = Challenge::update(&next_key_half, identity);

        Ok(Transform::Forward {
            receipt,
            forward: ForwardPacket {
                next_hop,
                next_key_half,
                header: peeled.next,
                challenge,
                message,
            },
        })
    }
}

/// What a hop learns from a packet regardless of its position on the path.
pub struct HopReceipt {
    /// Replay tag; insert-or-drop before any channel mutation.
    pub packet_tag: [u8; PACKET_TAG_SIZE],
    /// The opened embedded payment.
    pub transaction: UpdateTransaction,
    /// This hop's transaction key.
    pub own_key_half: SecretKey,
    /// Its curve point.
    pub own_key_half_point: PublicKey,
}

/// Drop-or-forward decision of one transform.
pub enum Transform {
    /// Relay onward after attaching the outgoing payment.
    Forward {
        receipt: HopReceipt,
        forward: ForwardPacket,
    },
    /// Terminal hop: the plaintext surfaced.
    Deliver {
        receipt: HopReceipt,
        plaintext: Vec<u8>,
    },
}

/// A peeled packet waiting for its outgoing transaction.
pub struct ForwardPacket {
    pub next_hop: PublicKey,
    /// The next hop's key-half point, taken from our routing slot.
    pub next_key_half: PublicKey,
    header: Header,
    challenge: Challenge,
    message: OnionMessage,
}

impl ForwardPacket {
    /// Curve point for the outgoing transaction: our key half combined with
    /// the next hop's by point addition.
    pub fn outgoing_curve_point(
        &self,
        own_key_half_point: &PublicKey,
    ) -> Result<PublicKey, PacketError> {
        Ok(combine_key_halves(&[
            *own_key_half_point,
            self.next_key_half,
        ])?)
    }

    /// Seal the outgoing transaction and emit the next packet.
    pub fn assemble(
        self,
        identity: &Identity,
        outgoing: &UpdateTransaction,
    ) -> Result<Packet, PacketError> {
        let seal_key = transaction_seal_key(identity.secret_key(), &self.next_hop)?;
        Ok(Packet {
            header: self.header,
            sealed_transaction: outgoing.seal(&seal_key),
            challenge: self.challenge,
            message: self.message,
        })
    }
}

/// Source-side plan: path secrets derived, waiting for the first payment.
///
/// Construction is two-phase because the first transaction comes from the
/// channel module: [`plan`](Self::plan) derives everything the caller needs
/// to request it, [`finalize`](Self::finalize) assembles the packet.
pub struct PacketOutline {
    path: Vec<PublicKey>,
    alpha: PublicKey,
    secrets: Vec<SharedSecret>,
    transaction_keys: Vec<SecretKey>,
}

impl PacketOutline {
    /// Derive per-hop shared secrets for `path` (`path[n-1]` is the
    /// destination). Paths longer than [`MAX_HOPS`] are rejected here.
    pub fn plan(path: &[PublicKey]) -> Result<Self, PacketError> {
        if path.is_empty() || path.len() > MAX_HOPS {
            return Err(PacketError::BadPathLength(path.len()));
        }

        let mut ephemeral = SecretKey::new(&mut rand::thread_rng());
        let mut alpha = PublicKey::from_secret_key(SECP256K1, &ephemeral);
        let alpha0 = alpha;

        let mut secrets = Vec::with_capacity(path.len());
        for (i, hop) in path.iter().enumerate() {
            let secret = derive_shared_secret_for_peer(hop, &ephemeral)?;
            secrets.push(secret);
            if i + 1 < path.len() {
                let factor = crypto::blinding_factor(&alpha, &secret)?;
                ephemeral = crypto::blind_ephemeral(&ephemeral, &factor)?;
                alpha = crypto::blind_alpha(&alpha, &factor)?;
            }
        }

        let transaction_keys = secrets
            .iter()
            .map(derive_transaction_key)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PacketOutline {
            path: path.to_vec(),
            alpha: alpha0,
            secrets,
            transaction_keys,
        })
    }

    /// First hop of the path.
    pub fn first_hop(&self) -> &PublicKey {
        &self.path[0]
    }

    /// Curve point for the transaction paying the first hop.
    pub fn first_curve_point(&self) -> Result<PublicKey, PacketError> {
        let first = key_half_point(&self.transaction_keys[0]);
        if self.path.len() == 1 {
            return Ok(first);
        }
        let second = key_half_point(&self.transaction_keys[1]);
        Ok(combine_key_halves(&[first, second])?)
    }

    /// Assemble the packet around the first-hop payment.
    pub fn finalize(
        self,
        identity: &Identity,
        plaintext: &[u8],
        transaction: &UpdateTransaction,
    ) -> Result<Packet, PacketError> {
        let key_halves: Vec<PublicKey> =
            self.transaction_keys.iter().map(key_half_point).collect();
        let header = create_header(&self.path, &key_halves, self.alpha, &self.secrets)?;
        let message = OnionMessage::wrap(plaintext, &self.secrets)?;
        let challenge = Challenge::create(&self.transaction_keys[0], identity);
        let seal_key = transaction_seal_key(identity.secret_key(), &self.path[0])?;

        Ok(Packet {
            header,
            sealed_transaction: transaction.seal(&seal_key),
            challenge,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel::ChannelId;

    fn make_transaction(signer: &Identity, curve_point: PublicKey) -> UpdateTransaction {
        UpdateTransaction::create(signer, ChannelId([7u8; 32]), 1, 100, curve_point)
    }

    /// Walk a packet through every hop, asserting size constancy, and
    /// return the delivered plaintext.
    fn relay_to_destination(
        source: &Identity,
        relays: &[Identity],
        packet: Packet,
    ) -> Vec<u8> {
        let mut packet = packet;
        let mut prev = source.clone();
        for (i, hop) in relays.iter().enumerate() {
            let frame = packet.to_bytes();
            assert_eq!(frame.len(), PACKET_SIZE);
            let parsed = Packet::from_bytes(&frame).unwrap();
            match parsed.transform(hop, prev.public_key()).unwrap() {
                Transform::Forward { receipt, forward } => {
                    assert!(i + 1 < relays.len(), "terminated early at hop {}", i);
                    let point = forward
                        .outgoing_curve_point(&receipt.own_key_half_point)
                        .unwrap();
                    let outgoing = make_transaction(hop, point);
                    packet = forward.assemble(hop, &outgoing).unwrap();
                    prev = hop.clone();
                }
                Transform::Deliver { plaintext, .. } => {
                    assert_eq!(i, relays.len() - 1, "terminated early at hop {}", i);
                    return plaintext;
                }
            }
        }
        unreachable!("packet never terminated");
    }

    #[test]
    fn test_three_hop_delivery() {
        let source = Identity::generate();
        let relays: Vec<Identity> = (0..3).map(|_| Identity::generate()).collect();
        let path: Vec<PublicKey> = relays.iter().map(|r| *r.public_key()).collect();

        let outline = PacketOutline::plan(&path).unwrap();
        let tx = make_transaction(&source, outline.first_curve_point().unwrap());
        let packet = outline.finalize(&source, b"hello", &tx).unwrap();

        assert_eq!(relay_to_destination(&source, &relays, packet), b"hello");
    }

    #[test]
    fn test_zero_hop_packet_terminates_at_sender() {
        let source = Identity::generate();
        let path = vec![*source.public_key()];

        let outline = PacketOutline::plan(&path).unwrap();
        let tx = make_transaction(&source, outline.first_curve_point().unwrap());
        let packet = outline.finalize(&source, b"to myself", &tx).unwrap();

        match packet.transform(&source, source.public_key()).unwrap() {
            Transform::Deliver { plaintext, .. } => assert_eq!(plaintext, b"to myself"),
            Transform::Forward { .. } => panic!("self-addressed packet must terminate"),
        }
    }

    #[test]
    fn test_flipped_beta_bit_drops_at_first_hop() {
        let source = Identity::generate();
        let relay = Identity::generate();
        let path = vec![*relay.public_key()];

        let outline = PacketOutline::plan(&path).unwrap();
        let tx = make_transaction(&source, outline.first_curve_point().unwrap());
        let mut packet = outline.finalize(&source, b"hello", &tx).unwrap();

        packet.header.beta[0] ^= 0x01;
        assert!(matches!(
            packet.transform(&relay, source.public_key()),
            Err(PacketError::BadMac)
        ));
    }

    #[test]
    fn test_challenge_signer_must_match_sender() {
        let source = Identity::generate();
        let stranger = Identity::generate();
        let relay = Identity::generate();
        let path = vec![*relay.public_key()];

        let outline = PacketOutline::plan(&path).unwrap();
        let tx = make_transaction(&source, outline.first_curve_point().unwrap());
        let packet = outline.finalize(&source, b"hello", &tx).unwrap();

        // Frame claims to come from a different peer than the challenge
        // signer.
        assert!(matches!(
            packet.transform(&relay, stranger.public_key()),
            Err(PacketError::BadChallenge)
        ));
    }

    #[test]
    fn test_wrong_size_frame_rejected() {
        assert!(matches!(
            Packet::from_bytes(&vec![0u8; PACKET_SIZE - 1]),
            Err(PacketError::WrongSize(_))
        ));
        assert!(matches!(
            Packet::from_bytes(&vec![0u8; PACKET_SIZE + 1]),
            Err(PacketError::WrongSize(_))
        ));
    }

    #[test]
    fn test_frame_roundtrip_is_bit_exact() {
        let source = Identity::generate();
        let relay = Identity::generate();
        let path = vec![*relay.public_key()];

        let outline = PacketOutline::plan(&path).unwrap();
        let tx = make_transaction(&source, outline.first_curve_point().unwrap());
        let packet = outline.finalize(&source, b"roundtrip", &tx).unwrap();

        let bytes = packet.to_bytes();
        let reparsed = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(reparsed.to_bytes(), bytes);
    }

    #[test]
    fn test_too_long_path_rejected_at_construction() {
        let path: Vec<PublicKey> = (0..MAX_HOPS + 1)
            .map(|_| *Identity::generate().public_key())
            .collect();
        assert!(matches!(
            PacketOutline::plan(&path),
            Err(PacketError::BadPathLength(_))
        ));
    }
}
