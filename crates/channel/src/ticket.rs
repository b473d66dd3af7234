//! Probabilistic payment tickets.
//!
//! Every accepted update registers a pending ticket. Only *winning* tickets
//! are redeemed on-chain, but the win probability scales the face value so
//! each ticket is worth `amount · win_prob` in expectation. A ticket wins iff
//! the leading 64 bits of `SHA256(pre_image)` fall below `win_prob`.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use sha2::{Digest, Sha256};

use crate::ChannelId;

/// Win probability encoded as a u64 fixed-point fraction of 2^64.
/// `u64::MAX` means every ticket wins.
pub const WIN_PROB_ALWAYS: u64 = u64::MAX;

/// A pending payment claim, persisted until its key halves are learned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub channel_id: ChannelId,
    /// Aggregated key-half point whose discrete log redeems the ticket.
    #[serde(with = "BigArray")]
    pub challenge: [u8; 33],
    /// Hash of the next hop's key-half point; indexes the pending ticket.
    pub hashed_key_half: [u8; 32],
    pub amount: u64,
    pub win_prob: u64,
    /// Commitment the redeemer opens on-chain.
    pub on_chain_secret: [u8; 32],
}

impl Ticket {
    /// Whether the ticket wins for the given pre-image.
    pub fn is_winning(&self, pre_image: &[u8; 32]) -> bool {
        is_winning(pre_image, self.win_prob)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialization should not fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Luck draw: the leading 64 bits of `SHA256(pre_image)` compared against
/// the probability threshold.
pub fn is_winning(pre_image: &[u8; 32], win_prob: u64) -> bool {
    if win_prob == WIN_PROB_ALWAYS {
        return true;
    }
    let digest = Sha256::digest(pre_image);
    let luck = u64::from_be_bytes(digest[..8].try_into().expect("fixed slice"));
    luck < win_prob
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(win_prob: u64) -> Ticket {
        Ticket {
            channel_id: ChannelId([1u8; 32]),
            challenge: [2u8; 33],
            hashed_key_half: [3u8; 32],
            amount: 10,
            win_prob,
            on_chain_secret: [4u8; 32],
        }
    }

    #[test]
    fn test_always_winning_probability() {
        let t = ticket(WIN_PROB_ALWAYS);
        assert!(t.is_winning(&[0u8; 32]));
        assert!(t.is_winning(&[0xff; 32]));
    }

    #[test]
    fn test_half_probability_splits_known_preimages() {
        // SHA256(0x00 * 32) starts with 0x66.., SHA256(0xff * 32) with
        // 0xaf..; at probability 1/2 exactly one of them wins.
        let t = ticket(1u64 << 63);
        assert!(t.is_winning(&[0u8; 32]));
        assert!(!t.is_winning(&[0xff; 32]));
    }

    #[test]
    fn test_zero_probability_never_wins() {
        let t = ticket(0);
        assert!(!t.is_winning(&[0u8; 32]));
        assert!(!t.is_winning(&[0xff; 32]));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let t = ticket(42);
        assert_eq!(Ticket::from_bytes(&t.to_bytes()).unwrap(), t);
    }
}
