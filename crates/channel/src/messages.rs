//! Settlement wire messages.
//!
//! The `SETTLE_CHANNEL` stream protocol carries one length-prefixed channel
//! id from the node that wants to close toward the counterparty, which
//! answers with its most recent signed update (or nothing, if it holds
//! none). All other channel traffic rides inside packets.

use serde::{Deserialize, Serialize};

use crate::transaction::{UpdateTransaction, TRANSACTION_SIZE};
use crate::{ChannelError, ChannelId};

/// Protocol name of the settlement stream.
pub const SETTLE_CHANNEL_PROTOCOL: &str = "/hopr/settle-channel/0.1.0";

/// Request to cooperatively settle: a 32-byte channel id behind a u32
/// big-endian length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettleChannelRequest {
    pub channel_id: ChannelId,
}

impl SettleChannelRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + 32);
        bytes.extend_from_slice(&32u32.to_be_bytes());
        bytes.extend_from_slice(self.channel_id.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChannelError> {
        if bytes.len() != 36 {
            return Err(ChannelError::Malformed);
        }
        let len = u32::from_be_bytes(bytes[..4].try_into().expect("fixed slice"));
        if len != 32 {
            return Err(ChannelError::Malformed);
        }
        let mut channel_id = [0u8; 32];
        channel_id.copy_from_slice(&bytes[4..]);
        Ok(SettleChannelRequest {
            channel_id: ChannelId(channel_id),
        })
    }
}

/// Counterparty's answer: its latest signed update, if it holds one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettleChannelResponse {
    pub transaction: Option<Vec<u8>>,
}

impl SettleChannelResponse {
    pub fn with_transaction(tx: &UpdateTransaction) -> Self {
        SettleChannelResponse {
            transaction: Some(tx.to_bytes().to_vec()),
        }
    }

    pub fn empty() -> Self {
        SettleChannelResponse { transaction: None }
    }

    pub fn into_transaction(self) -> Result<Option<UpdateTransaction>, ChannelError> {
        match self.transaction {
            None => Ok(None),
            Some(bytes) if bytes.len() == TRANSACTION_SIZE => {
                Ok(Some(UpdateTransaction::from_bytes(&bytes)?))
            }
            Some(_) => Err(ChannelError::Malformed),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialization should not fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::{key_half_point, Identity};
    use secp256k1::SecretKey;

    #[test]
    fn test_request_roundtrip() {
        let request = SettleChannelRequest {
            channel_id: ChannelId([7u8; 32]),
        };
        let bytes = request.to_bytes();
        assert_eq!(bytes.len(), 36);
        assert_eq!(SettleChannelRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn test_request_rejects_bad_prefix() {
        let mut bytes = SettleChannelRequest {
            channel_id: ChannelId([7u8; 32]),
        }
        .to_bytes();
        bytes[3] = 31;
        assert!(SettleChannelRequest::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_response_roundtrip() {
        let signer = Identity::generate();
        let point = key_half_point(&SecretKey::new(&mut rand::thread_rng()));
        let tx = UpdateTransaction::create(&signer, ChannelId([1u8; 32]), 1, 5, point);

        let response = SettleChannelResponse::with_transaction(&tx);
        let decoded = SettleChannelResponse::from_bytes(&response.to_bytes()).unwrap();
        assert_eq!(decoded.into_transaction().unwrap().unwrap(), tx);

        let empty = SettleChannelResponse::empty();
        let decoded = SettleChannelResponse::from_bytes(&empty.to_bytes()).unwrap();
        assert!(decoded.into_transaction().unwrap().is_none());
    }
}
