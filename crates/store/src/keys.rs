//! Persisted key layout.
//!
//! All keys are byte strings. The prefixes below are part of the on-disk
//! format and must not change between releases.
//!
//! ```text
//! payments-key-               ‖ channelId(32)            counterparty pubkey
//! payments-tx-                ‖ channelId(32)            latest update
//! payments-restoreTx-         ‖ channelId(32)            funding-time update
//! payments-stashedRestoreTx-  ‖ channelId(32)            stashed fallback
//! payments-index-             ‖ channelId(32)            u64 BE
//! payments-currentValue-      ‖ channelId(32)            u64 BE
//! payments-onChainBalance-    ‖ channelId(32)            u64 BE
//! payments-initialBalance-    ‖ channelId(32)            u64 BE
//! payments-totalBalance-      ‖ channelId(32)            u64 BE
//! payments-nonce-             ‖ channelId(32) ‖ hash(32) ticket/update nonces
//! payments-challenge-         ‖ channelId(32) ‖ point(33) key-half points
//! payments-ticket-            ‖ hashedKeyHalf(32)        pending tickets
//! packet-tag-                 ‖ tag(16)                  replay guard
//! channel-                    ‖ pubkey(33)               channel record
//! ```

pub const PREFIX_KEY: &[u8] = b"payments-key-";
pub const PREFIX_TX: &[u8] = b"payments-tx-";
pub const PREFIX_RESTORE_TX: &[u8] = b"payments-restoreTx-";
pub const PREFIX_STASHED_RESTORE_TX: &[u8] = b"payments-stashedRestoreTx-";
pub const PREFIX_INDEX: &[u8] = b"payments-index-";
pub const PREFIX_CURRENT_VALUE: &[u8] = b"payments-currentValue-";
pub const PREFIX_ON_CHAIN_BALANCE: &[u8] = b"payments-onChainBalance-";
pub const PREFIX_INITIAL_BALANCE: &[u8] = b"payments-initialBalance-";
pub const PREFIX_TOTAL_BALANCE: &[u8] = b"payments-totalBalance-";
pub const PREFIX_NONCE: &[u8] = b"payments-nonce-";
pub const PREFIX_CHALLENGE: &[u8] = b"payments-challenge-";
pub const PREFIX_TICKET: &[u8] = b"payments-ticket-";
pub const PREFIX_PACKET_TAG: &[u8] = b"packet-tag-";
pub const PREFIX_CHANNEL_RECORD: &[u8] = b"channel-";

fn concat(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

pub fn counterparty_key(channel_id: &[u8; 32]) -> Vec<u8> {
    concat(PREFIX_KEY, channel_id)
}

pub fn latest_tx(channel_id: &[u8; 32]) -> Vec<u8> {
    concat(PREFIX_TX, channel_id)
}

pub fn restore_tx(channel_id: &[u8; 32]) -> Vec<u8> {
    concat(PREFIX_RESTORE_TX, channel_id)
}

pub fn stashed_restore_tx(channel_id: &[u8; 32]) -> Vec<u8> {
    concat(PREFIX_STASHED_RESTORE_TX, channel_id)
}

pub fn index(channel_id: &[u8; 32]) -> Vec<u8> {
    concat(PREFIX_INDEX, channel_id)
}

pub fn current_value(channel_id: &[u8; 32]) -> Vec<u8> {
    concat(PREFIX_CURRENT_VALUE, channel_id)
}

pub fn on_chain_balance(channel_id: &[u8; 32]) -> Vec<u8> {
    concat(PREFIX_ON_CHAIN_BALANCE, channel_id)
}

pub fn initial_balance(channel_id: &[u8; 32]) -> Vec<u8> {
    concat(PREFIX_INITIAL_BALANCE, channel_id)
}

pub fn total_balance(channel_id: &[u8; 32]) -> Vec<u8> {
    concat(PREFIX_TOTAL_BALANCE, channel_id)
}

pub fn nonce(channel_id: &[u8; 32], hash: &[u8; 32]) -> Vec<u8> {
    let mut key = concat(PREFIX_NONCE, channel_id);
    key.extend_from_slice(hash);
    key
}

pub fn challenge(channel_id: &[u8; 32], point: &[u8; 33]) -> Vec<u8> {
    let mut key = concat(PREFIX_CHALLENGE, channel_id);
    key.extend_from_slice(point);
    key
}

/// Inclusive scan bounds covering every challenge of one channel.
pub fn challenge_range(channel_id: &[u8; 32]) -> (Vec<u8>, Vec<u8>) {
    let mut gte = concat(PREFIX_CHALLENGE, channel_id);
    let mut lte = gte.clone();
    gte.extend_from_slice(&[0x00; 33]);
    lte.extend_from_slice(&[0xff; 33]);
    (gte, lte)
}

pub fn ticket(hashed_key_half: &[u8; 32]) -> Vec<u8> {
    concat(PREFIX_TICKET, hashed_key_half)
}

pub fn packet_tag(tag: &[u8; 16]) -> Vec<u8> {
    concat(PREFIX_PACKET_TAG, tag)
}

pub fn channel_record(public_key: &[u8; 33]) -> Vec<u8> {
    concat(PREFIX_CHANNEL_RECORD, public_key)
}

/// Every per-channel key that `withdraw` prunes after closure.
pub fn all_channel_keys(channel_id: &[u8; 32]) -> Vec<Vec<u8>> {
    vec![
        counterparty_key(channel_id),
        latest_tx(channel_id),
        restore_tx(channel_id),
        stashed_restore_tx(channel_id),
        index(channel_id),
        current_value(channel_id),
        on_chain_balance(channel_id),
        initial_balance(channel_id),
        total_balance(channel_id),
    ]
}
