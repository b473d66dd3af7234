//! Replay guard over the packet-tag store.
//!
//! A 16-byte tag derived from the hop's shared secret is inserted exactly
//! once per packet. The check-and-insert is serialized behind one mutex so
//! two concurrent transforms of the same packet can never both pass; the tag
//! stays inserted even when a later pipeline step fails, so retrying cannot
//! recover the payment.

use crypto::PACKET_TAG_SIZE;
use store::{keys, KvStore, StoreError};
use tokio::sync::Mutex;

/// Persistent set of seen packet tags.
pub struct ReplayGuard<S> {
    store: S,
    lock: Mutex<()>,
}

impl<S: KvStore> ReplayGuard<S> {
    pub fn new(store: S) -> Self {
        ReplayGuard {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Returns `true` if the tag was already present; inserts it otherwise.
    pub async fn seen_or_insert(&self, tag: &[u8; PACKET_TAG_SIZE]) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let key = keys::packet_tag(tag);
        match self.store.get(&key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound) => {
                self.store.put(&key, &[1u8]).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
