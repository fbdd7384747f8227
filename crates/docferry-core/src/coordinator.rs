use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::item::InboundItem;
use crate::outcome::{Outcome, RunSummary};
use crate::processor::IngestionProcessor;

/// Pulls items off the source channel and runs them through the processor
/// with bounded parallelism. The bound overlaps remote-call latency; it is
/// not a CPU knob.
pub struct IngestionCoordinator {
    processor: Arc<IngestionProcessor>,
    max_in_flight: usize,
}

impl IngestionCoordinator {
    pub fn new(processor: Arc<IngestionProcessor>, max_in_flight: usize) -> Self {
        Self {
            processor,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// The channel sources feed. Bounded so a burst of files cannot balloon
    /// memory; senders just wait.
    pub fn channel() -> (mpsc::Sender<InboundItem>, mpsc::Receiver<InboundItem>) {
        mpsc::channel(64)
    }

    /// Run until the channel drains (every sender dropped) or `shutdown`
    /// flips. Shutdown is cooperative: no new items are pulled, in-flight
    /// uploads finish, then the summary is returned. A processor `Err`
    /// (cache trouble) aborts the run the same way.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<InboundItem>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks: JoinSet<Result<Outcome>> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut fatal: Option<anyhow::Error> = None;

        loop {
            // Biased so a pending shutdown always wins over a ready item;
            // nothing new may be pulled once the flag flips.
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested, draining in-flight work");
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match flatten(joined) {
                        Ok(outcome) => summary.record(&outcome),
                        Err(err) => {
                            fatal = Some(err);
                            break;
                        }
                    }
                }
                item = rx.recv() => {
                    let Some(item) = item else { break };
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let processor = self.processor.clone();
                    tasks.spawn(async move {
                        let outcome = processor.process(item).await;
                        drop(permit);
                        outcome
                    });
                }
            }
        }

        // Whatever was already spawned runs to completion; a create that is
        // under way must not be abandoned in a maybe-uploaded state.
        while let Some(joined) = tasks.join_next().await {
            match flatten(joined) {
                Ok(outcome) => summary.record(&outcome),
                Err(err) => {
                    if fatal.is_none() {
                        fatal = Some(err);
                    }
                }
            }
        }

        if let Some(err) = fatal {
            debug!(processed = summary.processed, "run aborted");
            return Err(err);
        }
        info!(
            processed = summary.processed,
            uploaded = summary.uploaded,
            duplicate = summary.duplicate,
            rejected = summary.rejected,
            failed = summary.failed,
            "run finished"
        );
        Ok(summary)
    }
}

fn flatten(joined: Result<Result<Outcome>, tokio::task::JoinError>) -> Result<Outcome> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(anyhow!("processing task panicked: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::policy::ValidationPolicy;
    use crate::testutil::{fs_item, temp_cache, FakeStore};

    async fn coordinator_with(
        dir: &TempDir,
        store: Arc<FakeStore>,
        max_in_flight: usize,
    ) -> IngestionCoordinator {
        let cache = temp_cache(dir).await;
        let processor = Arc::new(IngestionProcessor::new(
            cache,
            store,
            ValidationPolicy::default(),
        ));
        IngestionCoordinator::new(processor, max_in_flight)
    }

    #[tokio::test]
    async fn drains_the_channel_and_tallies_outcomes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let coordinator = coordinator_with(&dir, store.clone(), 4).await;

        let (tx, rx) = IngestionCoordinator::channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(fs_item(b"first", "a.pdf")).await.unwrap();
        tx.send(fs_item(b"first", "a-copy.pdf")).await.unwrap();
        tx.send(fs_item(b"second", "b.pdf")).await.unwrap();
        tx.send(fs_item(b"", "empty.pdf")).await.unwrap();
        drop(tx);

        let summary = coordinator.run(rx, shutdown_rx).await.unwrap();
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.uploaded, 2);
        assert_eq!(summary.duplicate, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.new_remote_ids.len(), 2);
        assert_eq!(store.create_count(), 2);
    }

    #[tokio::test]
    async fn concurrency_stays_within_the_bound() {
        let dir = TempDir::new().unwrap();
        let mut store = FakeStore::default();
        store.create_delay = Some(Duration::from_millis(20));
        let store = Arc::new(store);
        let coordinator = coordinator_with(&dir, store.clone(), 2).await;

        let (tx, rx) = IngestionCoordinator::channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        for i in 0..6 {
            tx.send(fs_item(format!("content {i}").as_bytes(), &format!("f{i}.pdf")))
                .await
                .unwrap();
        }
        drop(tx);

        let summary = coordinator.run(rx, shutdown_rx).await.unwrap();
        assert_eq!(summary.uploaded, 6);
        assert_eq!(store.create_count(), 6);
        assert!(store.peak_concurrency.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn shutdown_finishes_in_flight_items_and_pulls_no_more() {
        let dir = TempDir::new().unwrap();
        let mut store = FakeStore::default();
        store.create_delay = Some(Duration::from_millis(100));
        let store = Arc::new(store);
        let coordinator = Arc::new(coordinator_with(&dir, store.clone(), 4).await);

        let (tx, rx) = IngestionCoordinator::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(fs_item(b"one", "a.pdf")).await.unwrap();
        tx.send(fs_item(b"two", "b.pdf")).await.unwrap();

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run(rx, shutdown_rx).await })
        };

        // Let both items enter processing, then ask for shutdown.
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        // Anything sent after the flip is never pulled.
        let _ = tx.send(fs_item(b"three", "c.pdf")).await;
        drop(tx);

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.uploaded, 2);
        assert_eq!(store.create_count(), 2);
    }
}
