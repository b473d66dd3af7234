//! Channel State Types
//!
//! A payment channel is a two-party agreement that allows off-chain balance
//! updates, each carried inside a relayed packet and signed by the paying
//! side.
//!
//! ## Roles
//!
//! The party with the lexicographically smaller on-chain address is *partyA*.
//! The channel tracks one number, the partyA balance; transfers from A
//! decrease it, transfers from B increase it, and the deposit bounds it from
//! above. This fixes the sign of every value update.
//!
//! ## Lifecycle
//!
//! ```text
//! create ──> Funding ──OpenedChannel──> Open ──initiateChannelClosure──>
//! PendingClosure ──closure time elapses──> Withdrawable
//! ──claimChannelClosure──> Closed
//! ```

use crypto::Address;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

pub use chain::ChannelStatus;

use crate::ChannelError;

/// Unique identifier for a payment channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    /// Derive the channel ID of two parties. Order-independent: the
    /// addresses are hashed in ascending order.
    pub fn derive(a: Address, b: Address) -> Self {
        ChannelId(chain::channel_id(a, b))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 chars).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_hex())
    }
}

/// In-memory view of one channel, assembled from the persisted keys.
#[derive(Clone, Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub counterparty: PublicKey,
    /// Whether this node is partyA of the channel.
    pub we_are_party_a: bool,
    /// Total on-chain deposit.
    pub balance: u64,
    /// Current off-chain partyA balance.
    pub current_value: u64,
    /// Index of the last accepted update.
    pub index: u64,
    pub status: ChannelStatus,
    /// Unix timestamp after which a pending closure is withdrawable.
    pub closure_time: u64,
}

impl Channel {
    /// This node's spendable share.
    pub fn our_balance(&self) -> u64 {
        if self.we_are_party_a {
            self.current_value
        } else {
            self.balance - self.current_value
        }
    }

    /// The counterparty's share.
    pub fn counterparty_balance(&self) -> u64 {
        self.balance - self.our_balance()
    }

    /// Whether the channel accepts further updates.
    pub fn accepts_updates(&self) -> bool {
        matches!(
            self.status,
            ChannelStatus::Open | ChannelStatus::PendingClosure
        )
    }

    /// PartyA balance after this node sends `amount`.
    pub fn value_after_sending(&self, amount: u64) -> Result<u64, ChannelError> {
        if self.our_balance() < amount {
            return Err(ChannelError::InsufficientBalance {
                have: self.our_balance(),
                need: amount,
            });
        }
        Ok(if self.we_are_party_a {
            self.current_value - amount
        } else {
            self.current_value + amount
        })
    }
}

/// Amount a received update moves toward this node.
///
/// `prev_is_party_a` states the payer's role; the payer's share must shrink,
/// so the partyA balance moves down when A pays and up when B pays. Any
/// movement in the wrong direction or beyond the deposit is rejected.
pub fn embedded_money(
    prev_is_party_a: bool,
    balance: u64,
    current_value: u64,
    new_value: u64,
) -> Result<u64, ChannelError> {
    if new_value > balance {
        return Err(ChannelError::ValueOutOfRange);
    }
    if prev_is_party_a {
        if new_value > current_value {
            return Err(ChannelError::ValueOutOfRange);
        }
        Ok(current_value - new_value)
    } else {
        if new_value < current_value {
            return Err(ChannelError::ValueOutOfRange);
        }
        Ok(new_value - current_value)
    }
}

/// Persisted channel summary, stored under the counterparty's public key for
/// higher layers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: [u8; 32],
    /// Compressed counterparty public key.
    #[serde(with = "BigArray")]
    pub counterparty: [u8; 33],
    pub balance: u64,
    pub closure_time: u64,
    /// `state_counter mod 10` digit at the time of the last sync.
    pub status_digit: u8,
}

impl ChannelRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialization should not fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_state_counter(self.status_digit as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::Identity;

    fn channel(we_are_party_a: bool) -> Channel {
        Channel {
            id: ChannelId([0u8; 32]),
            counterparty: *Identity::generate().public_key(),
            we_are_party_a,
            balance: 10,
            current_value: 7,
            index: 0,
            status: ChannelStatus::Open,
            closure_time: 0,
        }
    }

    #[test]
    fn test_channel_id_derivation() {
        let a = Address::from_bytes([1u8; 20]);
        let b = Address::from_bytes([2u8; 20]);

        // Same inputs give the same id, in either order.
        assert_eq!(ChannelId::derive(a, b), ChannelId::derive(b, a));

        let c = Address::from_bytes([3u8; 20]);
        assert_ne!(ChannelId::derive(a, b), ChannelId::derive(a, c));
    }

    #[test]
    fn test_balances_by_role() {
        let as_a = channel(true);
        assert_eq!(as_a.our_balance(), 7);
        assert_eq!(as_a.counterparty_balance(), 3);

        let as_b = channel(false);
        assert_eq!(as_b.our_balance(), 3);
        assert_eq!(as_b.counterparty_balance(), 7);
    }

    #[test]
    fn test_value_after_sending_moves_toward_payee() {
        let as_a = channel(true);
        assert_eq!(as_a.value_after_sending(2).unwrap(), 5);

        let as_b = channel(false);
        assert_eq!(as_b.value_after_sending(2).unwrap(), 9);
    }

    #[test]
    fn test_cannot_send_beyond_balance() {
        let as_b = channel(false);
        assert!(matches!(
            as_b.value_after_sending(4),
            Err(ChannelError::InsufficientBalance { have: 3, need: 4 })
        ));
    }

    #[test]
    fn test_zero_balance_accepts_no_transfer() {
        let mut empty = channel(true);
        empty.balance = 0;
        empty.current_value = 0;
        assert!(empty.value_after_sending(1).is_err());
    }

    #[test]
    fn test_embedded_money_direction() {
        // A pays: partyA balance 7 -> 5 moves 2 toward us.
        assert_eq!(embedded_money(true, 10, 7, 5).unwrap(), 2);
        // B pays: partyA balance 7 -> 9 moves 2 toward us.
        assert_eq!(embedded_money(false, 10, 7, 9).unwrap(), 2);

        // Wrong direction is rejected.
        assert!(embedded_money(true, 10, 7, 8).is_err());
        assert!(embedded_money(false, 10, 7, 6).is_err());
        // Beyond the deposit is rejected.
        assert!(embedded_money(false, 10, 7, 11).is_err());
    }

    #[test]
    fn test_record_roundtrip() {
        let record = ChannelRecord {
            channel_id: [5u8; 32],
            counterparty: [2u8; 33],
            balance: 42,
            closure_time: 0,
            status_digit: 2,
        };
        let decoded = ChannelRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(decoded.channel_id, record.channel_id);
        assert_eq!(decoded.status(), ChannelStatus::Open);
    }
}
