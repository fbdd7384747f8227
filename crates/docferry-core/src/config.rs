//! Configuration schema and loading.
//!
//! Settings live in a TOML file (`docferry.toml` by default). Every field
//! has a default so a partial file is valid; secrets and locations can also
//! come from `DOCFERRY_*` environment variables, which win over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;

use docferry_remote::{StoreAuth, StoreConfig};

use crate::policy::ValidationPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DocferryConfig {
    pub store: StoreSection,
    pub cache: CacheSection,
    pub ingest: IngestSection,
    pub directory: DirectorySection,
    pub mail: MailSection,
}

/// Document store connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub base_url: String,
    /// With `password`, enables the token-obtain refresh flow.
    pub username: String,
    pub password: String,
    /// Static API token; takes precedence over username/password.
    pub api_token: String,
    /// Document type label, resolved to an id at startup. Empty = store default.
    pub document_type: String,
    /// Cabinet label to file uploads into. Empty = no filing.
    pub cabinet: String,
    pub timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            username: String::new(),
            password: String::new(),
            api_token: String::new(),
            document_type: String::new(),
            cabinet: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Dedup cache location.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// SQLite file path. Empty = `<data dir>/docferry/dedup.db`.
    pub db_path: PathBuf,
}

/// Pipeline-wide processing knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    /// Items processed in parallel; overlaps remote latency, not CPU.
    pub max_in_flight: usize,
    pub max_size_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub allowed_mime_types: Vec<String>,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            // 50 MiB
            max_size_bytes: 50 * 1024 * 1024,
            allowed_extensions: Vec::new(),
            allowed_mime_types: Vec::new(),
        }
    }
}

/// Watched-directory source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectorySection {
    /// Root to ingest from. Empty = directory source disabled.
    pub root: PathBuf,
    pub recursive: bool,
    /// Source-level filename filter, e.g. `[".pdf"]`. Empty = every file.
    pub extensions: Vec<String>,
    /// Enumerate files already present when the service starts.
    pub scan_existing: bool,
    /// Keep watching for new files after the initial enumeration.
    pub watch: bool,
}

impl Default for DirectorySection {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            recursive: false,
            extensions: Vec::new(),
            scan_existing: true,
            watch: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailProtocol {
    #[default]
    Imap,
    Pop3,
}

/// Polled-mailbox source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailSection {
    /// Mail server host. Empty = mail source disabled.
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub protocol: MailProtocol,
    /// Exact addresses or `@domain` suffixes, matched case-insensitively.
    /// Empty = accept mail from anyone.
    pub allowed_senders: Vec<String>,
    /// Also fetch messages already marked read (IMAP only).
    pub include_read: bool,
    /// Per-cycle message cap; 0 = unlimited.
    pub max_messages: usize,
    pub poll_interval_secs: u64,
}

impl Default for MailSection {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 993,
            username: String::new(),
            password: String::new(),
            tls: true,
            protocol: MailProtocol::Imap,
            allowed_senders: Vec::new(),
            include_read: false,
            max_messages: 0,
            poll_interval_secs: 300,
        }
    }
}

impl DocferryConfig {
    /// Load configuration: explicit path, else `DOCFERRY_CONFIG`, else
    /// `docferry.toml` in the working directory, else pure defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("DOCFERRY_CONFIG").map(PathBuf::from))
            .or_else(|| {
                let fallback = PathBuf::from("docferry.toml");
                fallback.exists().then_some(fallback)
            });

        let mut config: Self = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("DOCFERRY_DB") {
            self.cache.db_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("DOCFERRY_STORE_URL") {
            self.store.base_url = value;
        }
        if let Ok(value) = std::env::var("DOCFERRY_STORE_USERNAME") {
            self.store.username = value;
        }
        if let Ok(value) = std::env::var("DOCFERRY_STORE_PASSWORD") {
            self.store.password = value;
        }
        if let Ok(value) = std::env::var("DOCFERRY_STORE_TOKEN") {
            self.store.api_token = value;
        }
        if let Ok(value) = std::env::var("DOCFERRY_MAIL_PASSWORD") {
            self.mail.password = value;
        }
    }

    /// Resolved cache database path.
    pub fn db_path(&self) -> Result<PathBuf> {
        if !self.cache.db_path.as_os_str().is_empty() {
            return Ok(self.cache.db_path.clone());
        }
        let dirs = ProjectDirs::from("", "", "docferry")
            .context("no home directory available for the default cache location")?;
        Ok(dirs.data_dir().join("dedup.db"))
    }

    /// Store client configuration, picking the credential mode.
    pub fn store_config(&self) -> Result<StoreConfig> {
        let auth = if !self.store.api_token.is_empty() {
            StoreAuth::StaticToken(self.store.api_token.clone())
        } else if !self.store.username.is_empty() {
            StoreAuth::UserPassword {
                username: self.store.username.clone(),
                password: self.store.password.clone(),
            }
        } else {
            bail!("no store credentials configured: set [store] api_token or username/password");
        };
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Ok(StoreConfig {
            base_url: self.store.base_url.clone(),
            auth,
            document_type: non_empty(&self.store.document_type),
            cabinet: non_empty(&self.store.cabinet),
            timeout: Duration::from_secs(self.store.timeout_secs.max(1)),
        })
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            max_size_bytes: self.ingest.max_size_bytes,
            allowed_extensions: self.ingest.allowed_extensions.clone(),
            allowed_mime_types: self.ingest.allowed_mime_types.clone(),
        }
    }

    pub fn directory_configured(&self) -> bool {
        !self.directory.root.as_os_str().is_empty()
    }

    pub fn mail_configured(&self) -> bool {
        !self.mail.server.is_empty()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.mail.poll_interval_secs.max(1))
    }

    pub fn max_messages(&self) -> Option<usize> {
        (self.mail.max_messages > 0).then_some(self.mail.max_messages)
    }
}
