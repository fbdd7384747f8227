//! Pipeline orchestration: the validation policy, the ingestion processor
//! with its per-fingerprint serialization, the directory and mail sources,
//! and the coordinator that ties them to a bounded worker pool.

pub mod config;
pub mod coordinator;
mod item;
mod locks;
mod outcome;
mod policy;
pub mod processor;
pub mod sources;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::DocferryConfig;
pub use coordinator::IngestionCoordinator;
pub use item::{InboundItem, Origin};
pub use locks::FingerprintLocks;
pub use outcome::{Outcome, RunSummary};
pub use policy::{RejectReason, ValidationPolicy};
pub use processor::IngestionProcessor;
