//! Shared-secret derivation and the symmetric primitives built on it.
//!
//! Every per-hop key in the packet format is derived from one 32-byte shared
//! secret with a distinct HKDF label, so a re-derived secret reproduces the
//! exact same keystream, MAC and tag bytes. Nothing here touches system
//! randomness: nonces are HKDF outputs of the secret they belong to.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::CryptoError;

/// Size of a MAC tag in bytes.
pub const MAC_SIZE: usize = 32;

/// Size of a per-packet replay tag in bytes.
pub const PACKET_TAG_SIZE: usize = 16;

/// HKDF domain-separation labels. Distinct labels on the same secret yield
/// independent keys.
mod labels {
    pub const BLINDING: &[u8] = b"hopr-blinding-v1";
    pub const MAC_KEY: &[u8] = b"hopr-header-mac-key-v1";
    pub const HEADER_PRG: &[u8] = b"hopr-header-prg-key-v1";
    pub const PAYLOAD_PRG: &[u8] = b"hopr-payload-prg-key-v1";
    pub const TRANSACTION_KEY: &[u8] = b"hopr-transaction-key-v1";
    pub const PACKET_TAG: &[u8] = b"hopr-packet-tag-v1";
    pub const STREAM_NONCE: &[u8] = b"hopr-stream-nonce-v1";
    pub const TRANSACTION_SEAL: &[u8] = b"hopr-transaction-seal-v1";
}

/// A 32-byte secret shared between the packet creator and one hop.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SharedSecret(pub [u8; 32]);

impl SharedSecret {
    /// Hash a curve point down to a shared secret.
    fn from_point(point: &PublicKey) -> Self {
        SharedSecret(Sha256::digest(point.serialize()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material.
        write!(f, "SharedSecret(..)")
    }
}

/// Expand `n` bytes from a secret under a label.
fn expand(secret: &[u8; 32], label: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(None, secret);
    hk.expand(label, out)
        .expect("HKDF expand should never fail with valid output length");
}

/// Expand a secret under a label into a valid secp256k1 scalar.
///
/// The raw HKDF output exceeds the curve order with probability < 2^-127;
/// a counter byte is appended to the label until the output is in range.
fn expand_scalar(secret: &[u8; 32], label: &[u8]) -> Result<Scalar, CryptoError> {
    for counter in 0u8..=255 {
        let mut info = label.to_vec();
        info.push(counter);
        let mut okm = [0u8; 32];
        expand(secret, &info, &mut okm);
        if let Ok(scalar) = Scalar::from_be_bytes(okm) {
            // A zero scalar would erase the group element it tweaks.
            if okm != [0u8; 32] {
                return Ok(scalar);
            }
        }
    }
    Err(CryptoError::ScalarDerivation)
}

/// Derive the shared secret a hop holds with the packet creator:
/// `s = privKey · alpha`.
pub fn derive_shared_secret(
    alpha: &PublicKey,
    secret_key: &SecretKey,
) -> Result<SharedSecret, CryptoError> {
    let point = alpha
        .mul_tweak(SECP256K1, &Scalar::from(*secret_key))
        .map_err(|_| CryptoError::PointArithmetic)?;
    Ok(SharedSecret::from_point(&point))
}

/// Derive the shared secret the creator holds with a hop:
/// `s = (x · Π blindingⱼ) · pubKey`, where the accumulated ephemeral scalar
/// is passed in as `ephemeral`.
pub fn derive_shared_secret_for_peer(
    peer: &PublicKey,
    ephemeral: &SecretKey,
) -> Result<SharedSecret, CryptoError> {
    let point = peer
        .mul_tweak(SECP256K1, &Scalar::from(*ephemeral))
        .map_err(|_| CryptoError::PointArithmetic)?;
    Ok(SharedSecret::from_point(&point))
}

/// Blinding factor applied to alpha after a hop. Bound to both the current
/// alpha and the shared secret so each hop blinds differently.
pub fn blinding_factor(alpha: &PublicKey, secret: &SharedSecret) -> Result<Scalar, CryptoError> {
    let mut ikm = [0u8; 32];
    let mut hasher = Sha256::new();
    hasher.update(alpha.serialize());
    hasher.update(secret.as_bytes());
    ikm.copy_from_slice(&hasher.finalize());
    expand_scalar(&ikm, labels::BLINDING)
}

/// Blind alpha for the next hop: `alpha' = blinding · alpha`.
pub fn blind_alpha(alpha: &PublicKey, factor: &Scalar) -> Result<PublicKey, CryptoError> {
    alpha
        .mul_tweak(SECP256K1, factor)
        .map_err(|_| CryptoError::PointArithmetic)
}

/// Fold a blinding factor into the creator's ephemeral scalar.
pub fn blind_ephemeral(ephemeral: &SecretKey, factor: &Scalar) -> Result<SecretKey, CryptoError> {
    ephemeral
        .mul_tweak(factor)
        .map_err(|_| CryptoError::PointArithmetic)
}

/// Deterministic keystream of length `n` under a 32-byte key.
///
/// The ChaCha20 nonce is itself derived from the key, so identical keys
/// always produce identical streams.
pub fn keystream(key: &[u8; 32], n: usize) -> Vec<u8> {
    let mut nonce = [0u8; 12];
    expand(key, labels::STREAM_NONCE, &mut nonce);
    let mut cipher = ChaCha20::new(key.into(), (&nonce).into());
    let mut out = vec![0u8; n];
    cipher.apply_keystream(&mut out);
    out
}

/// PRG stream for the routing header, derived from a hop's shared secret.
pub fn header_stream(secret: &SharedSecret, n: usize) -> Vec<u8> {
    let mut key = [0u8; 32];
    expand(secret.as_bytes(), labels::HEADER_PRG, &mut key);
    keystream(&key, n)
}

/// PRG stream for one onion layer of the message body.
pub fn payload_stream(secret: &SharedSecret, n: usize) -> Vec<u8> {
    let mut key = [0u8; 32];
    expand(secret.as_bytes(), labels::PAYLOAD_PRG, &mut key);
    keystream(&key, n)
}

/// MAC over `data` under a key derived from the shared secret.
pub fn mac(secret: &SharedSecret, data: &[u8]) -> [u8; MAC_SIZE] {
    let mut key = [0u8; 32];
    expand(secret.as_bytes(), labels::MAC_KEY, &mut key);
    let mut hmac =
        Hmac::<Sha256>::new_from_slice(&key).expect("HMAC accepts any key length");
    hmac.update(data);
    hmac.finalize().into_bytes().into()
}

/// Constant-time MAC comparison.
pub fn verify_mac(secret: &SharedSecret, data: &[u8], tag: &[u8; MAC_SIZE]) -> bool {
    let expected = mac(secret, data);
    expected.ct_eq(tag).into()
}

/// Per-hop transaction key (the hop's key half).
pub fn derive_transaction_key(secret: &SharedSecret) -> Result<SecretKey, CryptoError> {
    let scalar = expand_scalar(secret.as_bytes(), labels::TRANSACTION_KEY)?;
    SecretKey::from_slice(&scalar.to_be_bytes()).map_err(|_| CryptoError::ScalarDerivation)
}

/// Curve point of a transaction key: `K = k·G`.
pub fn key_half_point(transaction_key: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(SECP256K1, transaction_key)
}

/// Hash of a key-half curve point, used to index tickets.
pub fn hashed_key_half(point: &PublicKey) -> [u8; 32] {
    Sha256::digest(point.serialize()).into()
}

/// Replay tag of a packet at one hop.
pub fn derive_packet_tag(secret: &SharedSecret) -> [u8; PACKET_TAG_SIZE] {
    let mut tag = [0u8; PACKET_TAG_SIZE];
    expand(secret.as_bytes(), labels::PACKET_TAG, &mut tag);
    tag
}

/// Symmetric key sealing the transaction between two adjacent hops, derived
/// from their node-level ECDH point. Either side computes it from its own
/// secret key and the neighbour's public key; nobody else can.
pub fn transaction_seal_key(
    secret_key: &SecretKey,
    peer: &PublicKey,
) -> Result<[u8; 32], CryptoError> {
    let point = peer
        .mul_tweak(SECP256K1, &Scalar::from(*secret_key))
        .map_err(|_| CryptoError::PointArithmetic)?;
    let mut hasher = Sha256::new();
    hasher.update(labels::TRANSACTION_SEAL);
    hasher.update(point.serialize());
    Ok(hasher.finalize().into())
}

/// Combine key-half points by elliptic-curve addition.
pub fn combine_key_halves(points: &[PublicKey]) -> Result<PublicKey, CryptoError> {
    let refs: Vec<&PublicKey> = points.iter().collect();
    PublicKey::combine_keys(&refs).map_err(|_| CryptoError::PointArithmetic)
}

/// XOR `b` into `a`. Panics if lengths differ.
pub fn xor_inplace(a: &mut [u8], b: &[u8]) {
    assert_eq!(a.len(), b.len(), "xor operands must have equal length");
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x ^= y;
    }
}

/// SHA-256 convenience wrapper.
pub fn hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn secret(byte: u8) -> SharedSecret {
        SharedSecret([byte; 32])
    }

    #[test]
    fn test_shared_secret_agreement() {
        // Creator side: s = ephemeral · pubKey; hop side: s = privKey · alpha.
        let hop = Identity::generate();
        let ephemeral = SecretKey::new(&mut rand::thread_rng());
        let alpha = PublicKey::from_secret_key(SECP256K1, &ephemeral);

        let creator_side = derive_shared_secret_for_peer(hop.public_key(), &ephemeral).unwrap();
        let hop_side = derive_shared_secret(&alpha, hop.secret_key()).unwrap();

        assert_eq!(creator_side.as_bytes(), hop_side.as_bytes());
    }

    #[test]
    fn test_blinding_commutes() {
        // Blinding the creator's ephemeral scalar and the hop's alpha must
        // land on the same group element.
        let hop = Identity::generate();
        let ephemeral = SecretKey::new(&mut rand::thread_rng());
        let alpha = PublicKey::from_secret_key(SECP256K1, &ephemeral);

        let s = derive_shared_secret(&alpha, hop.secret_key()).unwrap();
        let factor = blinding_factor(&alpha, &s).unwrap();

        let blinded_alpha = blind_alpha(&alpha, &factor).unwrap();
        let blinded_ephemeral = blind_ephemeral(&ephemeral, &factor).unwrap();

        assert_eq!(
            blinded_alpha,
            PublicKey::from_secret_key(SECP256K1, &blinded_ephemeral)
        );
    }

    #[test]
    fn test_derivations_are_deterministic() {
        let s = secret(7);
        assert_eq!(header_stream(&s, 64), header_stream(&s, 64));
        assert_eq!(mac(&s, b"data"), mac(&s, b"data"));
        assert_eq!(derive_packet_tag(&s), derive_packet_tag(&s));
        assert_eq!(
            derive_transaction_key(&s).unwrap(),
            derive_transaction_key(&s).unwrap()
        );
    }

    #[test]
    fn test_labels_separate_keys() {
        let s = secret(7);
        let header = header_stream(&s, 32);
        let payload = payload_stream(&s, 32);
        assert_ne!(header, payload);
    }

    #[test]
    fn test_keystream_prefix_property() {
        // A longer stream from the same key must extend the shorter one.
        let key = [3u8; 32];
        let short = keystream(&key, 32);
        let long = keystream(&key, 64);
        assert_eq!(short[..], long[..32]);
    }

    #[test]
    fn test_mac_rejects_flipped_bit() {
        let s = secret(1);
        let data = b"routing header bytes";
        let tag = mac(&s, data);
        assert!(verify_mac(&s, data, &tag));

        let mut tampered = data.to_vec();
        tampered[0] ^= 0x01;
        assert!(!verify_mac(&s, &tampered, &tag));
    }

    #[test]
    fn test_transaction_seal_key_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_eq!(
            transaction_seal_key(a.secret_key(), b.public_key()).unwrap(),
            transaction_seal_key(b.secret_key(), a.public_key()).unwrap()
        );
    }

    #[test]
    fn test_combine_key_halves_is_point_addition() {
        let a = SecretKey::new(&mut rand::thread_rng());
        let b = SecretKey::new(&mut rand::thread_rng());
        let combined =
            combine_key_halves(&[key_half_point(&a), key_half_point(&b)]).unwrap();

        // k_a·G + k_b·G = (k_a + k_b)·G
        let sum = a.add_tweak(&Scalar::from(b)).unwrap();
        assert_eq!(combined, key_half_point(&sum));
    }
}
