//! Shared fakes for the in-crate tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use docferry_cache::{DedupCache, Fingerprint};
use docferry_remote::{DocumentMetadata, DocumentStore, RemoteError};

use crate::item::{InboundItem, Origin};

/// In-memory document store. Counts calls, can be pre-seeded with remote
/// content and primed with failures that are consumed in order.
#[derive(Default)]
pub struct FakeStore {
    remote: Mutex<HashMap<String, String>>,
    fail_find: Mutex<VecDeque<RemoteError>>,
    fail_create: Mutex<VecDeque<RemoteError>>,
    next_id: AtomicUsize,
    current: AtomicUsize,
    pub find_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub peak_concurrency: AtomicUsize,
    pub create_delay: Option<Duration>,
}

impl FakeStore {
    pub fn seed_remote(&self, fp: &Fingerprint, id: &str) {
        self.remote
            .lock()
            .unwrap()
            .insert(fp.as_str().to_string(), id.to_string());
    }

    pub fn fail_find_with(&self, err: RemoteError) {
        self.fail_find.lock().unwrap().push_back(err);
    }

    pub fn fail_create_with(&self, err: RemoteError) {
        self.fail_create.lock().unwrap().push_back(err);
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn find_count(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DocumentStore for FakeStore {
    async fn find_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<String>, RemoteError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_find.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.remote.lock().unwrap().get(fp.as_str()).cloned())
    }

    async fn create(&self, _bytes: &[u8], meta: &DocumentMetadata) -> Result<String, RemoteError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrency.fetch_max(running, Ordering::SeqCst);
        let result = async {
            if let Some(err) = self.fail_create.lock().unwrap().pop_front() {
                return Err(err);
            }
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            let id = format!("doc-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            self.remote
                .lock()
                .unwrap()
                .insert(meta.fingerprint.clone(), id.clone());
            Ok(id)
        }
        .await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn fs_item(bytes: &[u8], name: &str) -> InboundItem {
    let mut origin_detail = BTreeMap::new();
    origin_detail.insert("path".to_string(), format!("/inbox/{name}"));
    InboundItem {
        bytes: bytes.to_vec(),
        declared_name: name.to_string(),
        declared_mime: None,
        origin: Origin::Filesystem,
        origin_detail,
    }
}

pub async fn temp_cache(dir: &tempfile::TempDir) -> DedupCache {
    DedupCache::open(&dir.path().join("dedup.db")).await.unwrap()
}
