use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::multipart;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use docferry_cache::Fingerprint;

use crate::{DocumentMetadata, DocumentStore, RemoteError};

/// How the client authenticates against the store.
#[derive(Debug, Clone)]
pub enum StoreAuth {
    /// Username/password: tokens are minted through the store's token
    /// endpoint and re-minted when one gets rejected.
    UserPassword { username: String, password: String },
    /// Fixed API token from configuration. Cannot be re-minted; once the
    /// store rejects it, authentication errors become terminal.
    StaticToken(String),
}

/// The cached session token. At most one exists per client; refresh is
/// single-flight (see `lease_token`). Never handed out to sources or the
/// coordinator.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    pub token_value: String,
    pub acquired_at: DateTime<Utc>,
    pub valid: bool,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub auth: StoreAuth,
    /// Document-type label, resolved to an id once at startup.
    pub document_type: Option<String>,
    /// Cabinet label, resolved to an id once at startup.
    pub cabinet: Option<String>,
    pub timeout: Duration,
}

pub struct StoreClient {
    http: reqwest::Client,
    api_url: Url,
    auth: StoreAuth,
    lease: Mutex<Option<CredentialLease>>,
    document_type: Option<String>,
    cabinet: Option<String>,
    document_type_id: Option<i64>,
    cabinet_id: Option<i64>,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default)]
    next: Option<String>,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Deserialize)]
struct Labeled {
    id: i64,
    label: String,
}

#[derive(Deserialize)]
struct SearchHit {
    id: i64,
    #[serde(default)]
    description: Option<String>,
}

impl StoreClient {
    pub fn new(config: StoreConfig) -> Result<Self> {
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let api_url = Url::parse(&base)?.join("api/v4/")?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(Policy::limited(5))
            .build()?;
        Ok(Self {
            http,
            api_url,
            auth: config.auth,
            lease: Mutex::new(None),
            document_type: config.document_type.filter(|s| !s.is_empty()),
            cabinet: config.cabinet.filter(|s| !s.is_empty()),
            document_type_id: None,
            cabinet_id: None,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.api_url
            .join(path)
            .map_err(|err| RemoteError::Transient(format!("bad endpoint {path}: {err}")))
    }

    /// Token usable for the next request. Single-flight: the slot lock is
    /// held across the refresh HTTP call, so callers arriving during a
    /// refresh wait for it and then read the lease that refresh produced
    /// instead of starting their own.
    async fn lease_token(&self) -> Result<String, RemoteError> {
        let mut slot = self.lease.lock().await;
        if let Some(lease) = slot.as_ref() {
            if lease.valid {
                return Ok(lease.token_value.clone());
            }
            if matches!(self.auth, StoreAuth::StaticToken(_)) {
                // A rejected static token stays rejected.
                return Err(RemoteError::AuthExpired);
            }
        }
        let token = match &self.auth {
            StoreAuth::StaticToken(token) => token.clone(),
            StoreAuth::UserPassword { username, password } => {
                self.obtain_token(username, password).await?
            }
        };
        info!("acquired document store credential lease");
        *slot = Some(CredentialLease {
            token_value: token.clone(),
            acquired_at: Utc::now(),
            valid: true,
        });
        Ok(token)
    }

    async fn obtain_token(&self, username: &str, password: &str) -> Result<String, RemoteError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }
        let url = self.endpoint("auth/token/obtain/")?;
        let response = self
            .http
            .post(url)
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            warn!(%status, "token endpoint rejected the configured credentials");
            return Err(RemoteError::AuthExpired);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, detail));
        }
        let body: TokenResponse = response.json().await?;
        Ok(body.token)
    }

    /// Mark the current lease invalid so the next caller forces a refresh.
    /// Runs before any `AuthExpired` error surfaces.
    async fn invalidate_lease(&self) {
        if let Some(lease) = self.lease.lock().await.as_mut() {
            lease.valid = false;
        }
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_lease().await;
            return Err(RemoteError::AuthExpired);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, detail));
        }
        Ok(response)
    }

    /// Resolve configured document-type and cabinet labels to ids. Runs once
    /// at startup, before the client is shared; the ids stay opaque to the
    /// rest of the pipeline.
    pub async fn resolve_labels(&mut self) -> Result<(), RemoteError> {
        if let Some(label) = self.document_type.clone() {
            let id = self.find_label_id("document_types/", &label).await?;
            let id = id.ok_or_else(|| RemoteError::Permanent {
                status: 404,
                detail: format!("document type {label:?} not found in the store"),
            })?;
            info!(%label, id, "resolved document type");
            self.document_type_id = Some(id);
        }
        if let Some(label) = self.cabinet.clone() {
            let id = self.find_label_id("cabinets/", &label).await?;
            let id = id.ok_or_else(|| RemoteError::Permanent {
                status: 404,
                detail: format!("cabinet {label:?} not found in the store"),
            })?;
            info!(%label, id, "resolved cabinet");
            self.cabinet_id = Some(id);
        }
        Ok(())
    }

    async fn find_label_id(&self, path: &str, label: &str) -> Result<Option<i64>, RemoteError> {
        let token = self.lease_token().await?;
        for page in 1..=50 {
            let url = self.endpoint(path)?;
            let response = self
                .http
                .get(url)
                .header(AUTHORIZATION, auth_header(&token))
                .query(&[("page", page.to_string()), ("page_size", "100".to_string())])
                .send()
                .await?;
            let response = self.check_status(response).await?;
            let body: Page<Labeled> = response.json().await?;
            if let Some(hit) = body.results.iter().find(|entry| entry.label == label) {
                return Ok(Some(hit.id));
            }
            if body.next.is_none() {
                break;
            }
        }
        Ok(None)
    }

    /// Cheap connectivity and credentials probe.
    pub async fn check(&self) -> Result<(), RemoteError> {
        let token = self.lease_token().await?;
        let url = self.endpoint("documents/")?;
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, auth_header(&token))
            .query(&[("page_size", "1")])
            .send()
            .await?;
        self.check_status(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_fingerprint_impl(
        &self,
        fp: &Fingerprint,
    ) -> Result<Option<String>, RemoteError> {
        let token = self.lease_token().await?;
        let url = self.endpoint("search/documents.documentsearchresult/")?;
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, auth_header(&token))
            .query(&[("q", fp.as_str()), ("page_size", "10")])
            .send()
            .await?;
        let response = self.check_status(response).await?;
        let body: Page<SearchHit> = response.json().await?;
        // Full-text search can return near-misses; only a description that
        // actually carries this fingerprint counts.
        for hit in body.results {
            let matches = hit
                .description
                .as_deref()
                .map_or(false, |d| d.contains(fp.as_str()));
            if matches {
                debug!(document_id = hit.id, "fingerprint already present remotely");
                return Ok(Some(hit.id.to_string()));
            }
        }
        Ok(None)
    }

    #[instrument(skip(self, bytes, meta), fields(label = %meta.label, size = bytes.len()))]
    async fn create_impl(
        &self,
        bytes: &[u8],
        meta: &DocumentMetadata,
    ) -> Result<String, RemoteError> {
        let token = self.lease_token().await?;

        // Step one: the document shell with its description.
        let mut payload = serde_json::Map::new();
        payload.insert("label".into(), json!(meta.label));
        payload.insert("description".into(), json!(meta.description_json()));
        if let Some(type_id) = self.document_type_id {
            payload.insert("document_type_id".into(), json!(type_id));
        }
        let url = self.endpoint("documents/")?;
        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, auth_header(&token))
            .json(&payload)
            .send()
            .await?;
        let response = self.check_status(response).await?;
        #[derive(Deserialize)]
        struct Created {
            id: i64,
        }
        let created: Created = response.json().await?;

        // Step two: attach the content.
        let mut part = multipart::Part::bytes(bytes.to_vec()).file_name(meta.label.clone());
        if let Some(mime) = meta.mime_type.as_deref() {
            part = match part.mime_str(mime) {
                Ok(with_mime) => with_mime,
                Err(_) => {
                    warn!(mime, "ignoring unparseable mime type");
                    multipart::Part::bytes(bytes.to_vec()).file_name(meta.label.clone())
                }
            };
        }
        let form = multipart::Form::new()
            .text("action_name", "upload")
            .part("file_new", part);
        let url = self.endpoint(&format!("documents/{}/files/", created.id))?;
        let attach = match self
            .http
            .post(url)
            .header(AUTHORIZATION, auth_header(&token))
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => self.check_status(response).await.map(|_| ()),
            Err(err) => Err(RemoteError::from(err)),
        };
        if let Err(err) = attach {
            // A shell without content would satisfy future fingerprint
            // searches and permanently mask the retry. Remove it.
            warn!(document_id = created.id, %err, "attaching content failed, removing the empty document");
            self.try_delete_document(created.id, &token).await;
            return Err(err);
        }

        // Optional filing. Content is durably stored at this point; filing
        // trouble must not fail the upload.
        if let Some(cabinet_id) = self.cabinet_id {
            let url = self.endpoint(&format!("cabinets/{cabinet_id}/documents/add/"))?;
            let filed = match self
                .http
                .post(url)
                .header(AUTHORIZATION, auth_header(&token))
                .json(&json!({ "document": created.id }))
                .send()
                .await
            {
                Ok(response) => self.check_status(response).await.map(|_| ()),
                Err(err) => Err(RemoteError::from(err)),
            };
            if let Err(err) = filed {
                warn!(document_id = created.id, cabinet_id, %err, "cabinet filing failed");
            }
        }

        info!(document_id = created.id, "created remote document");
        Ok(created.id.to_string())
    }

    async fn try_delete_document(&self, id: i64, token: &str) {
        let url = match self.endpoint(&format!("documents/{id}/")) {
            Ok(url) => url,
            Err(_) => return,
        };
        match self
            .http
            .delete(url)
            .header(AUTHORIZATION, auth_header(token))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(document_id = id, "removed empty document shell");
            }
            Ok(response) => {
                warn!(document_id = id, status = %response.status(), "could not remove empty document shell");
            }
            Err(err) => {
                warn!(document_id = id, %err, "could not remove empty document shell");
            }
        }
    }
}

fn auth_header(token: &str) -> String {
    format!("Token {token}")
}

#[async_trait::async_trait]
impl DocumentStore for StoreClient {
    async fn find_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<String>, RemoteError> {
        self.find_by_fingerprint_impl(fp).await
    }

    async fn create(&self, bytes: &[u8], meta: &DocumentMetadata) -> Result<String, RemoteError> {
        self.create_impl(bytes, meta).await
    }
}
