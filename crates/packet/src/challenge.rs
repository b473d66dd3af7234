//! Per-hop payment challenge.
//!
//! A challenge is a recoverable signature over the hash of a key-half curve
//! point. On entry to hop `i` it must have been signed by peer `i−1` over
//! hop `i`'s own key-half point; on exit hop `i` re-signs over the next
//! hop's point taken from its routing slot. The recipient can thus identify
//! the paying party with nothing but its own derived transaction key.

use crypto::{key_half_point, recover_signer, Identity};
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use crate::PacketError;

/// Serialized size: signature(64) ‖ recovery(1).
pub const CHALLENGE_SIZE: usize = 65;

const SIGN_CONTEXT: &[u8] = b"hopr-challenge-v1";

/// Signature binding a payment to knowledge of a key half.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Challenge {
    pub signature: [u8; 64],
    pub recovery: u8,
}

fn digest_for(key_half: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SIGN_CONTEXT);
    hasher.update(key_half.serialize());
    hasher.finalize().into()
}

impl Challenge {
    /// Sign the challenge for the holder of `transaction_key`.
    pub fn create(transaction_key: &SecretKey, signer: &Identity) -> Self {
        Self::update(&key_half_point(transaction_key), signer)
    }

    /// Re-bind the challenge to a key-half point and re-sign.
    pub fn update(key_half: &PublicKey, signer: &Identity) -> Self {
        let (recovery_id, signature) = signer.sign_recoverable(digest_for(key_half));
        Challenge {
            signature,
            recovery: recovery_id.to_i32() as u8,
        }
    }

    /// Recover the signer, given the transaction key the challenge is bound
    /// to. A challenge signed over any other key half recovers to garbage.
    pub fn get_counterparty(&self, transaction_key: &SecretKey) -> Result<PublicKey, PacketError> {
        let digest = digest_for(&key_half_point(transaction_key));
        recover_signer(digest, &self.signature, self.recovery)
            .map_err(|_| PacketError::BadChallenge)
    }

    pub fn to_bytes(&self) -> [u8; CHALLENGE_SIZE] {
        let mut bytes = [0u8; CHALLENGE_SIZE];
        bytes[..64].copy_from_slice(&self.signature);
        bytes[64] = self.recovery;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() != CHALLENGE_SIZE {
            return Err(PacketError::Malformed);
        }
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[..64]);
        Ok(Challenge {
            signature,
            recovery: bytes[64],
        })
    }
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Challenge(recovery={})", self.recovery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction_key() -> SecretKey {
        SecretKey::new(&mut rand::thread_rng())
    }

    #[test]
    fn test_create_then_recover_signer() {
        let signer = Identity::generate();
        let key = transaction_key();

        let challenge = Challenge::create(&key, &signer);
        let recovered = challenge.get_counterparty(&key).unwrap();
        assert_eq!(&recovered, signer.public_key());
    }

    #[test]
    fn test_update_rebinds_to_new_key_half() {
        let first_signer = Identity::generate();
        let second_signer = Identity::generate();
        let first_key = transaction_key();
        let second_key = transaction_key();

        let challenge = Challenge::create(&first_key, &first_signer);
        let updated = Challenge::update(&key_half_point(&second_key), &second_signer);

        assert_eq!(
            &updated.get_counterparty(&second_key).unwrap(),
            second_signer.public_key()
        );
        // The stale binding no longer recovers the original signer.
        if let Ok(recovered) = updated.get_counterparty(&first_key) {
            assert_ne!(&recovered, first_signer.public_key());
        }
        let _ = challenge;
    }

    #[test]
    fn test_wrong_key_recovers_wrong_signer() {
        let signer = Identity::generate();
        let key = transaction_key();
        let wrong_key = transaction_key();

        let challenge = Challenge::create(&key, &signer);
        match challenge.get_counterparty(&wrong_key) {
            Ok(recovered) => assert_ne!(&recovered, signer.public_key()),
            Err(_) => {}
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        let signer = Identity::generate();
        let challenge = Challenge::create(&transaction_key(), &signer);
        let decoded = Challenge::from_bytes(&challenge.to_bytes()).unwrap();
        assert_eq!(decoded, challenge);
    }
}
