use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutex over fingerprints. Two tasks processing identical
/// content serialize here so only one of them can ever decide "not stored
/// yet" and upload; tasks on distinct fingerprints never contend.
#[derive(Default)]
pub struct FingerprintLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FingerprintLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            // Entries nobody holds any more are dead weight; sweep them
            // while the map is locked anyway.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    async fn entry_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}
