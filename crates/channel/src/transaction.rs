//! Signed channel updates.
//!
//! An [`UpdateTransaction`] is the payment a packet carries between two
//! adjacent hops: the post-transfer partyA balance of their channel, a
//! strictly increasing index, and the curve point whose discrete log redeems
//! the attached ticket. The payer signs recoverably, so the recipient can
//! identify the signer without a separate key exchange.
//!
//! On the wire the update is sealed with a ChaCha20 keystream under the
//! pairwise seal key only the two adjacent hops can derive.

use crypto::{keystream, recover_signer, xor_inplace, Identity};
use secp256k1::PublicKey;
use sha2::{Digest, Sha256};

use crate::{ChannelError, ChannelId};

/// Serialized size: channel_id(32) ‖ index(8) ‖ value(8) ‖ curve_point(33) ‖
/// signature(64) ‖ recovery(1).
pub const TRANSACTION_SIZE: usize = 32 + 8 + 8 + 33 + 64 + 1;

const SIGN_CONTEXT: &[u8] = b"hopr-channel-update-v1";

/// A signed off-chain balance update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateTransaction {
    pub channel_id: ChannelId,
    /// Strictly increasing per channel.
    pub index: u64,
    /// PartyA balance after this transfer.
    pub value: u64,
    /// Aggregated key-half point redeeming the attached ticket.
    pub curve_point: PublicKey,
    pub signature: [u8; 64],
    pub recovery: u8,
}

impl UpdateTransaction {
    /// Create and sign an update.
    pub fn create(
        signer: &Identity,
        channel_id: ChannelId,
        index: u64,
        value: u64,
        curve_point: PublicKey,
    ) -> Self {
        let digest = signing_digest(&channel_id, index, value, &curve_point);
        let (recovery_id, signature) = signer.sign_recoverable(digest);
        UpdateTransaction {
            channel_id,
            index,
            value,
            curve_point,
            signature,
            recovery: recovery_id.to_i32() as u8,
        }
    }

    /// Recover the signing party.
    pub fn counterparty(&self) -> Result<PublicKey, ChannelError> {
        let digest = signing_digest(&self.channel_id, self.index, self.value, &self.curve_point);
        recover_signer(digest, &self.signature, self.recovery)
            .map_err(|_| ChannelError::BadSigner)
    }

    /// Check that the update was signed by `expected`.
    pub fn verify_signer(&self, expected: &PublicKey) -> Result<(), ChannelError> {
        if &self.counterparty()? == expected {
            Ok(())
        } else {
            Err(ChannelError::BadSigner)
        }
    }

    /// Fixed-offset serialization.
    pub fn to_bytes(&self) -> [u8; TRANSACTION_SIZE] {
        let mut bytes = [0u8; TRANSACTION_SIZE];
        bytes[..32].copy_from_slice(self.channel_id.as_bytes());
        bytes[32..40].copy_from_slice(&self.index.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.value.to_be_bytes());
        bytes[48..81].copy_from_slice(&self.curve_point.serialize());
        bytes[81..145].copy_from_slice(&self.signature);
        bytes[145] = self.recovery;
        bytes
    }

    /// Parse from fixed offsets. Fails on malformed curve points.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChannelError> {
        if bytes.len() != TRANSACTION_SIZE {
            return Err(ChannelError::Malformed);
        }
        let mut channel_id = [0u8; 32];
        channel_id.copy_from_slice(&bytes[..32]);
        let index = u64::from_be_bytes(bytes[32..40].try_into().expect("fixed slice"));
        let value = u64::from_be_bytes(bytes[40..48].try_into().expect("fixed slice"));
        let curve_point =
            PublicKey::from_slice(&bytes[48..81]).map_err(|_| ChannelError::Malformed)?;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[81..145]);

        Ok(UpdateTransaction {
            channel_id: ChannelId(channel_id),
            index,
            value,
            curve_point,
            signature,
            recovery: bytes[145],
        })
    }

    /// Seal for embedding into a packet, keyed for the two adjacent hops.
    pub fn seal(&self, xor_key: &[u8; 32]) -> [u8; TRANSACTION_SIZE] {
        let mut bytes = self.to_bytes();
        xor_inplace(&mut bytes, &keystream(xor_key, TRANSACTION_SIZE));
        bytes
    }

    /// Open a sealed update.
    pub fn open(sealed: &[u8], xor_key: &[u8; 32]) -> Result<Self, ChannelError> {
        if sealed.len() != TRANSACTION_SIZE {
            return Err(ChannelError::Malformed);
        }
        let mut bytes = sealed.to_vec();
        xor_inplace(&mut bytes, &keystream(xor_key, TRANSACTION_SIZE));
        Self::from_bytes(&bytes)
    }

    /// Hash of the signature, used as the update's anti-replay nonce.
    pub fn nonce_hash(&self) -> [u8; 32] {
        Sha256::digest(self.signature).into()
    }
}

fn signing_digest(
    channel_id: &ChannelId,
    index: u64,
    value: u64,
    curve_point: &PublicKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SIGN_CONTEXT);
    hasher.update(channel_id.as_bytes());
    hasher.update(index.to_be_bytes());
    hasher.update(value.to_be_bytes());
    hasher.update(curve_point.serialize());
    hasher.finalize().into()
}
