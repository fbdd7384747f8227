use std::fmt;

use serde::Serialize;

use docferry_remote::RemoteError;

use crate::policy::RejectReason;

/// Terminal result of processing one item.
#[derive(Debug)]
pub enum Outcome {
    /// New content, durably created in the document store.
    Uploaded { remote_id: String },
    /// Content already present, confirmed locally or discovered remotely.
    Duplicate,
    /// Failed validation; neither the cache nor the store was touched.
    Rejected(RejectReason),
    /// Remote trouble. The content stays eligible for reconciliation the
    /// next time a source offers it.
    Failed(RemoteError),
}

/// Counters for one run, printable and serializable for the CLI.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub processed: u64,
    pub uploaded: u64,
    pub duplicate: u64,
    pub rejected: u64,
    pub failed: u64,
    pub new_remote_ids: Vec<String>,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Uploaded { remote_id } => {
                self.uploaded += 1;
                self.new_remote_ids.push(remote_id.clone());
            }
            Outcome::Duplicate => self.duplicate += 1,
            Outcome::Rejected(_) => self.rejected += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.processed += other.processed;
        self.uploaded += other.uploaded;
        self.duplicate += other.duplicate;
        self.rejected += other.rejected;
        self.failed += other.failed;
        self.new_remote_ids.extend(other.new_remote_ids);
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {}: {} uploaded, {} duplicate, {} rejected, {} failed",
            self.processed, self.uploaded, self.duplicate, self.rejected, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_every_outcome_kind() {
        let mut summary = RunSummary::default();
        summary.record(&Outcome::Uploaded {
            remote_id: "9".to_string(),
        });
        summary.record(&Outcome::Duplicate);
        summary.record(&Outcome::Rejected(RejectReason::Empty));
        summary.record(&Outcome::Failed(RemoteError::Transient("x".to_string())));

        assert_eq!(summary.processed, 4);
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.duplicate, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.new_remote_ids, vec!["9".to_string()]);

        let mut total = RunSummary::default();
        total.merge(summary);
        assert_eq!(total.processed, 4);
        assert_eq!(total.to_string(), "processed 4: 1 uploaded, 1 duplicate, 1 rejected, 1 failed");
    }
}
