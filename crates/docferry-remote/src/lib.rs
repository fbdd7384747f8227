//! Client side of the external document-management store.
//!
//! The store is the remote authority on "does this content already exist":
//! the pipeline's local cache short-circuits confirmed duplicates, everything
//! else is settled here. The crate exposes the [`DocumentStore`] trait so the
//! processor and its tests can swap the HTTP client for an in-memory fake,
//! plus the HTTP implementation ([`StoreClient`]) with its cached credential
//! lease and single-flight refresh.

mod client;
mod metadata;

pub use client::{CredentialLease, StoreAuth, StoreClient, StoreConfig};
pub use metadata::DocumentMetadata;

use async_trait::async_trait;
use thiserror::Error;

use docferry_cache::Fingerprint;

/// Failure classes a remote call can surface. The distinction drives the
/// retry policy: `AuthExpired` earns exactly one transparent retry with a
/// fresh lease, everything else fails the item and leaves reconciliation to
/// the next observation of the same content.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The store rejected the credentials. The client has already marked its
    /// lease invalid by the time this surfaces.
    #[error("document store credentials expired or rejected")]
    AuthExpired,
    /// The store explicitly refused the request; retrying the same payload
    /// will not help.
    #[error("document store rejected the request ({status}): {detail}")]
    Permanent { status: u16, detail: String },
    /// Network trouble, timeout or a server-side error worth seeing again.
    #[error("document store unreachable: {0}")]
    Transient(String),
}

impl RemoteError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, RemoteError::AuthExpired)
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, detail: String) -> Self {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            RemoteError::AuthExpired
        } else if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            RemoteError::Transient(format!("{status}: {detail}"))
        } else {
            RemoteError::Permanent {
                status: status.as_u16(),
                detail,
            }
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::Transient(err.to_string())
    }
}

/// Operations the ingestion pipeline needs from the document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Authoritative existence check. Returns the remote document id when the
    /// store already holds content with this fingerprint.
    async fn find_by_fingerprint(&self, fp: &Fingerprint)
        -> Result<Option<String>, RemoteError>;

    /// Create a document from raw bytes plus upload metadata, returning the
    /// id the store assigned.
    async fn create(&self, bytes: &[u8], meta: &DocumentMetadata)
        -> Result<String, RemoteError>;
}
