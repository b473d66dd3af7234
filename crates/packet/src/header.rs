//! Routing header: alpha, beta and the MAC over beta.
//!
//! Beta encodes the whole remaining route onion-style. Each per-hop slot is
//! `next_address(33) ‖ next_mac(32) ‖ next_key_half(33)`; the creator builds
//! beta right-to-left, prepending one encrypted slot per hop over
//! deterministic filler, so a peeled beta is indistinguishable from a fresh
//! one and the packet never shrinks.

use crypto::{
    blind_alpha, blinding_factor, header_stream, mac, verify_mac, xor_inplace, SharedSecret,
    MAC_SIZE, PUBLIC_KEY_SIZE,
};
use secp256k1::PublicKey;

use crate::PacketError;

/// Maximum number of path positions a header can encode.
pub const MAX_HOPS: usize = 5;

/// One routing slot: next address, MAC for the next hop, next key half.
pub const PER_HOP_SIZE: usize = PUBLIC_KEY_SIZE + MAC_SIZE + PUBLIC_KEY_SIZE;

/// Size of beta.
pub const ROUTING_INFO_SIZE: usize = MAX_HOPS * PER_HOP_SIZE;

/// Serialized header size: alpha ‖ beta ‖ mac.
pub const HEADER_SIZE: usize = PUBLIC_KEY_SIZE + ROUTING_INFO_SIZE + MAC_SIZE;

/// The routing header of a packet.
#[derive(Clone)]
pub struct Header {
    /// Group element the hop multiplies by its private key.
    pub alpha: PublicKey,
    /// Onion-encrypted routing information.
    pub beta: [u8; ROUTING_INFO_SIZE],
    /// MAC over beta, keyed by the current hop's shared secret.
    pub mac: [u8; MAC_SIZE],
}

/// Result of peeling one layer off a header.
pub struct PeeledHeader {
    /// Routing slot fields for this hop. The address is compared against
    /// the node's own public key to detect termination; the key half is
    /// only parsed when forwarding.
    pub next_address: [u8; PUBLIC_KEY_SIZE],
    pub next_key_half: [u8; PUBLIC_KEY_SIZE],
    /// Header for the next hop: blinded alpha, shifted beta, next MAC.
    pub next: Header,
}

impl Header {
    /// Verify the MAC over beta. Constant-time comparison.
    pub fn verify(&self, secret: &SharedSecret) -> bool {
        verify_mac(secret, &self.beta, &self.mac)
    }

    /// Peel one routing layer: XOR the PRG stream over `beta ‖ filler`,
    /// split off this hop's slot, and blind alpha for the next hop.
    ///
    /// The caller must have verified the MAC first.
    pub fn peel(&self, secret: &SharedSecret) -> Result<PeeledHeader, PacketError> {
        let mut extended = [0u8; ROUTING_INFO_SIZE + PER_HOP_SIZE];
        extended[..ROUTING_INFO_SIZE].copy_from_slice(&self.beta);
        xor_inplace(
            &mut extended,
            &header_stream(secret, ROUTING_INFO_SIZE + PER_HOP_SIZE),
        );

        let mut next_address = [0u8; PUBLIC_KEY_SIZE];
        next_address.copy_from_slice(&extended[..PUBLIC_KEY_SIZE]);
        let mut next_mac = [0u8; MAC_SIZE];
        next_mac.copy_from_slice(&extended[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + MAC_SIZE]);
        let mut next_key_half = [0u8; PUBLIC_KEY_SIZE];
        next_key_half.copy_from_slice(&extended[PUBLIC_KEY_SIZE + MAC_SIZE..PER_HOP_SIZE]);

        let mut next_beta = [0u8; ROUTING_INFO_SIZE];
        next_beta.copy_from_slice(&extended[PER_HOP_SIZE..]);

        let factor = blinding_factor(&self.alpha, secret)?;
        let next_alpha = blind_alpha(&self.alpha, &factor)?;

        Ok(PeeledHeader {
            next_address,
            next_key_half,
            next: Header {
                alpha: next_alpha,
                beta: next_beta,
                mac: next_mac,
            },
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..PUBLIC_KEY_SIZE].copy_from_slice(&self.alpha.serialize());
        bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + ROUTING_INFO_SIZE].copy_from_slice(&self.beta);
        bytes[PUBLIC_KEY_SIZE + ROUTING_INFO_SIZE..].copy_from_slice(&self.mac);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() != HEADER_SIZE {
            return Err(PacketError::Malformed);
        }
        let alpha = PublicKey::from_slice(&bytes[..PUBLIC_KEY_SIZE])
            .map_err(|_| PacketError::Malformed)?;
        let mut beta = [0u8; ROUTING_INFO_SIZE];
        beta.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + ROUTING_INFO_SIZE]);
        let mut mac_tag = [0u8; MAC_SIZE];
        mac_tag.copy_from_slice(&bytes[PUBLIC_KEY_SIZE + ROUTING_INFO_SIZE..]);
        Ok(Header {
            alpha,
            beta,
            mac: mac_tag,
        })
    }
}

/// Deterministic filler compensating the slots consumed before the last
/// hop, so that every intermediate MAC verifies over a full-size beta.
fn generate_filler(secrets: &[SharedSecret]) -> Vec<u8> {
    let mut filler: Vec<u8> = Vec::new();
    for secret in &secrets[..secrets.len() - 1] {
        filler.extend_from_slice(&[0u8; PER_HOP_SIZE]);
        let stream = header_stream(secret, ROUTING_INFO_SIZE + PER_HOP_SIZE);
        let offset = ROUTING_INFO_SIZE + PER_HOP_SIZE - filler.len();
        for (j, byte) in filler.iter_mut().enumerate() {
            *byte ^= stream[offset + j];
        }
    }
    filler
}

/// Build the header for `path` right-to-left.
///
/// `key_halves[i]` is hop `i`'s key-half point; slot `i` carries
/// `key_halves[i + 1]` so a relayer can re-bind the challenge and build the
/// outgoing transaction without knowing any downstream secret. The
/// destination slot holds the destination's own address and zero padding.
pub fn create_header(
    path: &[PublicKey],
    key_halves: &[PublicKey],
    alpha: PublicKey,
    secrets: &[SharedSecret],
) -> Result<Header, PacketError> {
    debug_assert_eq!(path.len(), secrets.len());
    debug_assert_eq!(path.len(), key_halves.len());
    let n = path.len();
    if n == 0 || n > MAX_HOPS {
        return Err(PacketError::BadPathLength(n));
    }

    // Destination layer: own address, zero padding, filler tail.
    let filler = generate_filler(secrets);
    let mut beta = [0u8; ROUTING_INFO_SIZE];
    beta[..PUBLIC_KEY_SIZE].copy_from_slice(&path[n - 1].serialize());
    let keep = ROUTING_INFO_SIZE - filler.len();
    let stream = header_stream(&secrets[n - 1], ROUTING_INFO_SIZE);
    for j in 0..keep {
        beta[j] ^= stream[j];
    }
    beta[keep..].copy_from_slice(&filler);
    let mut tag = mac(&secrets[n - 1], &beta);

    // Wrap one layer per intermediate hop, right to left.
    for i in (0..n - 1).rev() {
        let mut wrapped = [0u8; ROUTING_INFO_SIZE];
        wrapped[..PUBLIC_KEY_SIZE].copy_from_slice(&path[i + 1].serialize());
        wrapped[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + MAC_SIZE].copy_from_slice(&tag);
        wrapped[PUBLIC_KEY_SIZE + MAC_SIZE..PER_HOP_SIZE]
            .copy_from_slice(&key_halves[i + 1].serialize());
        wrapped[PER_HOP_SIZE..].copy_from_slice(&beta[..ROUTING_INFO_SIZE - PER_HOP_SIZE]);
        xor_inplace(&mut wrapped, &header_stream(&secrets[i], ROUTING_INFO_SIZE));
        beta = wrapped;
        tag = mac(&secrets[i], &beta);
    }

    Ok(Header {
        alpha,
        beta,
        mac: tag,
    })
}
