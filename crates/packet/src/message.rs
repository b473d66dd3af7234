//! Onion-encrypted message body.
//!
//! Fixed 256 bytes on the wire: a big-endian u16 length, the plaintext, zero
//! padding. Each hop XORs one keystream layer away; intermediaries only ever
//! see ciphertext.

use crypto::{payload_stream, xor_inplace, SharedSecret};

use crate::PacketError;

/// Size of the message body on the wire.
pub const MESSAGE_SIZE: usize = 256;

/// Longest plaintext that fits behind the length prefix.
pub const MAX_PLAINTEXT_SIZE: usize = MESSAGE_SIZE - 2;

/// The message body of a packet.
#[derive(Clone)]
pub struct OnionMessage([u8; MESSAGE_SIZE]);

impl OnionMessage {
    /// Frame `plaintext` and wrap one layer per hop, destination innermost.
    pub fn wrap(plaintext: &[u8], secrets: &[SharedSecret]) -> Result<Self, PacketError> {
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(PacketError::MessageTooLong(plaintext.len()));
        }
        let mut body = [0u8; MESSAGE_SIZE];
        body[..2].copy_from_slice(&(plaintext.len() as u16).to_be_bytes());
        body[2..2 + plaintext.len()].copy_from_slice(plaintext);

        let mut message = OnionMessage(body);
        for secret in secrets.iter().rev() {
            message.peel_layer(secret);
        }
        Ok(message)
    }

    /// XOR one keystream layer (self-inverse: wrapping and peeling are the
    /// same operation).
    pub fn peel_layer(&mut self, secret: &SharedSecret) {
        xor_inplace(&mut self.0, &payload_stream(secret, MESSAGE_SIZE));
    }

    /// Extract the plaintext after the last layer was removed.
    pub fn unwrap_plaintext(&self) -> Result<Vec<u8>, PacketError> {
        let len = u16::from_be_bytes([self.0[0], self.0[1]]) as usize;
        if len > MAX_PLAINTEXT_SIZE {
            return Err(PacketError::Malformed);
        }
        Ok(self.0[2..2 + len].to_vec())
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() != MESSAGE_SIZE {
            return Err(PacketError::Malformed);
        }
        let mut body = [0u8; MESSAGE_SIZE];
        body.copy_from_slice(bytes);
        Ok(OnionMessage(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(n: usize) -> Vec<SharedSecret> {
        (0..n).map(|i| SharedSecret([i as u8 + 1; 32])).collect()
    }

    #[test]
    fn test_wrap_and_peel_all_layers() {
        let secrets = secrets(3);
        let mut message = OnionMessage::wrap(b"hello", &secrets).unwrap();

        // Before the last layer the framing is still hidden.
        message.peel_layer(&secrets[0]);
        message.peel_layer(&secrets[1]);
        message.peel_layer(&secrets[2]);

        assert_eq!(message.unwrap_plaintext().unwrap(), b"hello");
    }

    #[test]
    fn test_intermediate_layers_look_random() {
        let secrets = secrets(2);
        let mut message = OnionMessage::wrap(b"hello", &secrets).unwrap();
        message.peel_layer(&secrets[0]);

        // One layer remains; the length prefix must not parse as the
        // plaintext frame.
        assert_ne!(&message.as_bytes()[2..7], b"hello");
    }

    #[test]
    fn test_empty_plaintext() {
        let secrets = secrets(1);
        let mut message = OnionMessage::wrap(b"", &secrets).unwrap();
        message.peel_layer(&secrets[0]);
        assert_eq!(message.unwrap_plaintext().unwrap(), b"");
    }

    #[test]
    fn test_max_plaintext_fits_and_over_rejected() {
        let secrets = secrets(1);
        let payload = vec![7u8; MAX_PLAINTEXT_SIZE];
        let mut message = OnionMessage::wrap(&payload, &secrets).unwrap();
        message.peel_layer(&secrets[0]);
        assert_eq!(message.unwrap_plaintext().unwrap(), payload);

        assert!(matches!(
            OnionMessage::wrap(&vec![0u8; MAX_PLAINTEXT_SIZE + 1], &secrets),
            Err(PacketError::MessageTooLong(_))
        ));
    }

    #[test]
    fn test_constant_size() {
        let secrets = secrets(4);
        let message = OnionMessage::wrap(b"x", &secrets).unwrap();
        assert_eq!(message.as_bytes().len(), MESSAGE_SIZE);
    }
}
