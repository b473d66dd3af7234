//! Cryptographic primitives for the packet pipeline.
//!
//! Two halves:
//! - [`identity`]: secp256k1 node keypairs, on-chain addresses, recoverable
//!   signatures
//! - [`primitives`]: shared-secret derivation, alpha blinding, and the
//!   HKDF-labelled symmetric toolbox (PRG, MAC, replay tags, key halves)

pub mod identity;
pub mod primitives;

pub use identity::{recover_signer, Address, Identity, ADDRESS_SIZE, PUBLIC_KEY_SIZE};
pub use primitives::{
    blind_alpha, blind_ephemeral, blinding_factor, combine_key_halves, derive_packet_tag,
    derive_shared_secret, derive_shared_secret_for_peer, derive_transaction_key, hash,
    hashed_key_half, header_stream, key_half_point, keystream, mac, payload_stream,
    transaction_seal_key, verify_mac, xor_inplace, SharedSecret, MAC_SIZE, PACKET_TAG_SIZE,
};

/// Error type for primitive failures.
///
/// Both variants are negligible-probability events on honest input; hitting
/// one during packet processing is treated as adversarial.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("derived bytes do not form a usable scalar")]
    ScalarDerivation,

    #[error("point arithmetic produced an invalid group element")]
    PointArithmetic,
}
