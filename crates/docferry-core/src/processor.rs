use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use docferry_cache::{DedupCache, Fingerprint};
use docferry_remote::{DocumentMetadata, DocumentStore, RemoteError};

use crate::item::InboundItem;
use crate::locks::FingerprintLocks;
use crate::outcome::Outcome;
use crate::policy::ValidationPolicy;

/// Decides for one inbound item whether its content needs uploading, and
/// uploads it when it does. All dedup decisions live here; sources stay
/// oblivious to both the cache and the store.
///
/// `process` returns `Err` only for cache trouble, which the caller must
/// treat as fatal to the run. Remote trouble is an `Outcome::Failed`.
pub struct IngestionProcessor {
    cache: DedupCache,
    store: Arc<dyn DocumentStore>,
    policy: ValidationPolicy,
    locks: FingerprintLocks,
}

impl IngestionProcessor {
    pub fn new(cache: DedupCache, store: Arc<dyn DocumentStore>, policy: ValidationPolicy) -> Self {
        Self {
            cache,
            store,
            policy,
            locks: FingerprintLocks::new(),
        }
    }

    #[instrument(skip_all, fields(name = %item.declared_name, origin = item.origin.as_str()))]
    pub async fn process(&self, item: InboundItem) -> Result<Outcome> {
        if let Some(reason) = self.policy.check(&item) {
            info!(%reason, "rejected");
            return Ok(Outcome::Rejected(reason));
        }

        let fp = Fingerprint::of(&item.bytes);

        // Identical content arriving concurrently serializes here, so only
        // one task can reach the upload below with a "nowhere stored yet"
        // verdict. Tasks on other fingerprints pass freely.
        let _guard = self.locks.acquire(fp.as_str()).await;

        let provenance = item.provenance();
        let size = item.bytes.len() as i64;

        if let Some(record) = self.cache.lookup(&fp).await? {
            if record.is_uploaded() {
                self.cache.record_seen(&fp, &provenance, size).await?;
                debug!(fingerprint = fp.as_str(), "duplicate, confirmed locally");
                return Ok(Outcome::Duplicate);
            }
        }

        // Not confirmed locally. The store is the authority; a cache that
        // lagged it (lost file, crash before the id landed) heals here.
        match self
            .with_auth_retry(|| self.store.find_by_fingerprint(&fp))
            .await
        {
            Ok(Some(remote_id)) => {
                self.cache.record_seen(&fp, &provenance, size).await?;
                self.cache.record_uploaded(&fp, &remote_id).await?;
                info!(
                    fingerprint = fp.as_str(),
                    remote_id, "already in the store, cache backfilled"
                );
                return Ok(Outcome::Duplicate);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(fingerprint = fp.as_str(), %err, "remote duplicate check failed");
                return Ok(Outcome::Failed(err));
            }
        }

        // Record before uploading: a crash mid-upload then leaves a record
        // without a remote id, which the authority check above reconciles
        // the next time this content shows up.
        self.cache.record_seen(&fp, &provenance, size).await?;

        let meta = self.metadata(&item, &fp);
        match self
            .with_auth_retry(|| self.store.create(&item.bytes, &meta))
            .await
        {
            Ok(remote_id) => {
                self.cache.record_uploaded(&fp, &remote_id).await?;
                info!(fingerprint = fp.as_str(), remote_id, "uploaded");
                Ok(Outcome::Uploaded { remote_id })
            }
            Err(err) => {
                warn!(fingerprint = fp.as_str(), %err, "upload failed");
                Ok(Outcome::Failed(err))
            }
        }
    }

    /// One transparent retry on an expired credential. The client already
    /// invalidated its lease, so the second attempt runs on a fresh one; a
    /// second expiry means refreshing does not converge and the caller
    /// should treat the store as unavailable rather than loop.
    async fn with_auth_retry<T, F, Fut>(&self, call: F) -> Result<T, RemoteError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        match call().await {
            Err(RemoteError::AuthExpired) => {
                debug!("credential lease expired, retrying once");
                match call().await {
                    Err(RemoteError::AuthExpired) => Err(RemoteError::Transient(
                        "authentication could not be refreshed".to_string(),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    fn metadata(&self, item: &InboundItem, fp: &Fingerprint) -> DocumentMetadata {
        DocumentMetadata {
            label: item.declared_name.clone(),
            mime_type: item.declared_mime.clone(),
            source: item.origin.as_str().to_string(),
            fingerprint: fp.as_str().to_string(),
            size_bytes: item.size_bytes(),
            processed_at: Utc::now(),
            extra: item.origin_detail.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::testutil::{fs_item, temp_cache, FakeStore};

    async fn harness(dir: &TempDir, store: Arc<FakeStore>) -> (IngestionProcessor, DedupCache) {
        let cache = temp_cache(dir).await;
        let processor =
            IngestionProcessor::new(cache.clone(), store, ValidationPolicy::default());
        (processor, cache)
    }

    #[tokio::test]
    async fn reprocessing_identical_content_uploads_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (processor, _cache) = harness(&dir, store.clone()).await;

        let first = processor.process(fs_item(b"report body", "a.pdf")).await.unwrap();
        assert!(matches!(first, Outcome::Uploaded { .. }));

        // Same bytes under another name: confirmed locally, no remote traffic.
        let second = processor.process(fs_item(b"report body", "copy.pdf")).await.unwrap();
        assert!(matches!(second, Outcome::Duplicate));

        assert_eq!(store.create_count(), 1);
        assert_eq!(store.find_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_items_create_exactly_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (processor, _cache) = harness(&dir, store.clone()).await;
        let processor = Arc::new(processor);

        let mut handles = Vec::new();
        for i in 0..8 {
            let processor = processor.clone();
            handles.push(tokio::spawn(async move {
                processor
                    .process(fs_item(b"same bytes", &format!("f{i}.pdf")))
                    .await
                    .unwrap()
            }));
        }

        let mut uploaded = 0;
        let mut duplicate = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Outcome::Uploaded { .. } => uploaded += 1,
                Outcome::Duplicate => duplicate += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(uploaded, 1);
        assert_eq!(duplicate, 7);
        assert_eq!(store.create_count(), 1);
    }

    #[tokio::test]
    async fn remote_hit_backfills_cache_without_uploading() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (processor, cache) = harness(&dir, store.clone()).await;

        let fp = Fingerprint::of(b"already there");
        store.seed_remote(&fp, "doc-42");

        let outcome = processor.process(fs_item(b"already there", "x.pdf")).await.unwrap();
        assert!(matches!(outcome, Outcome::Duplicate));
        assert_eq!(store.create_count(), 0);

        let record = cache.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(record.remote_document_id.as_deref(), Some("doc-42"));
    }

    #[tokio::test]
    async fn interrupted_upload_reconciles_on_the_next_offer() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (processor, cache) = harness(&dir, store.clone()).await;

        // Crash after the remote create: record without an id, store has it.
        let fp = Fingerprint::of(b"made it remotely");
        cache.record_seen(&fp, "crashed-run", 16).await.unwrap();
        store.seed_remote(&fp, "doc-7");
        let outcome = processor
            .process(fs_item(b"made it remotely", "a.pdf"))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Duplicate));
        assert_eq!(store.create_count(), 0);
        let record = cache.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(record.remote_document_id.as_deref(), Some("doc-7"));

        // Crash before the remote create: record without an id, store empty.
        let fp = Fingerprint::of(b"never made it");
        cache.record_seen(&fp, "crashed-run", 13).await.unwrap();
        let outcome = processor.process(fs_item(b"never made it", "b.pdf")).await.unwrap();
        assert!(matches!(outcome, Outcome::Uploaded { .. }));
        assert_eq!(store.create_count(), 1);
    }

    #[tokio::test]
    async fn rejection_touches_neither_cache_nor_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let cache = temp_cache(&dir).await;
        let policy = ValidationPolicy {
            max_size_bytes: 4,
            ..ValidationPolicy::default()
        };
        let processor = IngestionProcessor::new(cache.clone(), store.clone(), policy);

        let outcome = processor.process(fs_item(b"", "empty.pdf")).await.unwrap();
        assert!(matches!(outcome, Outcome::Rejected(crate::RejectReason::Empty)));
        let outcome = processor.process(fs_item(b"too big!", "big.pdf")).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected(crate::RejectReason::TooLarge { .. })
        ));

        assert_eq!(cache.count().await.unwrap(), 0);
        assert_eq!(store.find_count(), 0);
        assert_eq!(store.create_count(), 0);
    }

    #[tokio::test]
    async fn expired_credentials_retry_once_then_succeed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (processor, _cache) = harness(&dir, store.clone()).await;

        store.fail_create_with(RemoteError::AuthExpired);
        let outcome = processor.process(fs_item(b"fresh", "a.pdf")).await.unwrap();
        assert!(matches!(outcome, Outcome::Uploaded { .. }));
        assert_eq!(store.create_count(), 2);
    }

    #[tokio::test]
    async fn repeated_credential_expiry_surfaces_as_transient() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (processor, cache) = harness(&dir, store.clone()).await;

        store.fail_create_with(RemoteError::AuthExpired);
        store.fail_create_with(RemoteError::AuthExpired);
        let outcome = processor.process(fs_item(b"fresh", "a.pdf")).await.unwrap();
        match outcome {
            Outcome::Failed(RemoteError::Transient(_)) => {}
            other => panic!("expected transient failure, got {other:?}"),
        }
        assert_eq!(store.create_count(), 2);

        // The record exists but claims nothing about the upload.
        let fp = Fingerprint::of(b"fresh");
        let record = cache.lookup(&fp).await.unwrap().unwrap();
        assert!(!record.is_uploaded());
    }

    #[tokio::test]
    async fn transient_create_failure_is_retriable_on_the_next_offer() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (processor, _cache) = harness(&dir, store.clone()).await;

        store.fail_create_with(RemoteError::Transient("socket timeout".to_string()));
        let outcome = processor.process(fs_item(b"flaky", "a.pdf")).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(RemoteError::Transient(_))));

        let outcome = processor.process(fs_item(b"flaky", "a.pdf")).await.unwrap();
        assert!(matches!(outcome, Outcome::Uploaded { .. }));
        assert_eq!(store.create_count(), 2);
    }

    #[tokio::test]
    async fn failed_duplicate_check_leaves_no_record_behind() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (processor, cache) = harness(&dir, store.clone()).await;

        store.fail_find_with(RemoteError::Transient("down".to_string()));
        let outcome = processor.process(fs_item(b"unlucky", "a.pdf")).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(cache.count().await.unwrap(), 0);
        assert_eq!(store.create_count(), 0);
    }
}
