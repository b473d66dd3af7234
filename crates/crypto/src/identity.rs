//! Node identity on secp256k1.
//!
//! Every node holds one secp256k1 keypair. The public key doubles as the
//! routing address inside packet headers; the 20-byte [`Address`] derived
//! from it orders the two parties of a payment channel and keys on-chain
//! accounts.
//!
//! Address = SHA256(compressed_pubkey)[..20]

use anyhow::{Context, Result};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};

/// Size of a compressed secp256k1 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Size of an on-chain account address in bytes.
pub const ADDRESS_SIZE: usize = 20;

/// On-chain account address of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    /// Derive the address of a public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.serialize());
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&digest[..ADDRESS_SIZE]);
        Address(bytes)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Address(bytes)
    }

    /// Encode as hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 chars).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Decode from hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).context("invalid hex")?;
        if bytes.len() != ADDRESS_SIZE {
            anyhow::bail!("address must be {} bytes", ADDRESS_SIZE);
        }
        let mut arr = [0u8; ADDRESS_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Address(arr))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_hex())
    }
}

/// Complete node identity: secp256k1 keypair plus derived address.
#[derive(Clone)]
pub struct Identity {
    secret_key: SecretKey,
    public_key: PublicKey,
    address: Address,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        Self::from_secret_key(secret_key)
    }

    /// Derive identity from a 32-byte seed.
    ///
    /// Fails for the zero seed and for seeds at or above the curve order.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        let secret_key = SecretKey::from_slice(seed).context("seed is not a valid scalar")?;
        Ok(Self::from_secret_key(secret_key))
    }

    fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(SECP256K1, &secret_key);
        let address = Address::from_public_key(&public_key);
        Identity {
            secret_key,
            public_key,
            address,
        }
    }

    /// Get the secret key.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Get the public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Get the on-chain address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a 32-byte digest, producing a compact recoverable signature.
    pub fn sign_recoverable(&self, digest: [u8; 32]) -> (RecoveryId, [u8; 64]) {
        let message = Message::from_digest(digest);
        let signature = SECP256K1.sign_ecdsa_recoverable(&message, &self.secret_key);
        signature.serialize_compact()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Recover the signer of a 32-byte digest from a compact recoverable signature.
pub fn recover_signer(digest: [u8; 32], signature: &[u8; 64], recovery: u8) -> Result<PublicKey> {
    let recovery_id = RecoveryId::from_i32(recovery as i32).context("invalid recovery id")?;
    let signature = RecoverableSignature::from_compact(signature, recovery_id)
        .context("malformed signature")?;
    let message = Message::from_digest(digest);
    SECP256K1
        .recover_ecdsa(&message, &signature)
        .context("signature recovery failed")
}
