use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::item::{InboundItem, Origin};

/// Feeds files from a directory into the pipeline, either by one-shot
/// enumeration, by watching for arrivals, or both.
pub struct DirectorySource {
    root: PathBuf,
    recursive: bool,
    extensions: Vec<String>,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, recursive: bool, extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            recursive,
            extensions: normalize_extensions(extensions),
        }
    }

    /// Enumerate matching files once and hand each to the pipeline. Returns
    /// how many items were enqueued. Files that vanish or cannot be read
    /// between detection and read are skipped with a warning.
    pub async fn scan(&self, tx: &mpsc::Sender<InboundItem>) -> Result<usize> {
        ensure!(
            self.root.is_dir(),
            "{} is not a directory",
            self.root.display()
        );
        let mut enqueued = 0;
        for entry in self.walker() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%err, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if !self.matches_extension(&path) {
                continue;
            }
            if let Some(item) = read_item(&path).await {
                if tx.send(item).await.is_err() {
                    break;
                }
                enqueued += 1;
            }
        }
        info!(root = %self.root.display(), enqueued, "directory scan finished");
        Ok(enqueued)
    }

    /// List the files a scan would pick up, without reading them.
    pub fn preview(&self) -> Result<Vec<PathBuf>> {
        ensure!(
            self.root.is_dir(),
            "{} is not a directory",
            self.root.display()
        );
        let mut paths = Vec::new();
        for entry in self.walker() {
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_file() && self.matches_extension(entry.path()) {
                paths.push(entry.into_path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Watch for new files until `shutdown` flips. Only arrivals (creates
    /// and renames into the tree) produce items; modifications and removals
    /// are noise here.
    pub async fn watch(
        &self,
        tx: mpsc::Sender<InboundItem>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(err) => warn!(%err, "filesystem watch error"),
            },
            NotifyConfig::default(),
        )?;
        let mode = if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&self.root, mode)
            .with_context(|| format!("failed to watch {}", self.root.display()))?;
        info!(root = %self.root.display(), "watching for new files");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    if !is_arrival(&event.kind) {
                        continue;
                    }
                    for path in event.paths {
                        if !path.is_file() || !self.matches_extension(&path) {
                            continue;
                        }
                        debug!(path = %path.display(), "new file detected");
                        if let Some(item) = read_item(&path).await {
                            if tx.send(item).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn walker(&self) -> walkdir::IntoIter {
        let mut walker = WalkDir::new(&self.root);
        if !self.recursive {
            walker = walker.max_depth(1);
        }
        walker.into_iter()
    }

    fn matches_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let name = name.to_ascii_lowercase();
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }
}

fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any
            ))
    )
}

fn normalize_extensions(list: Vec<String>) -> Vec<String> {
    list.into_iter()
        .filter_map(|ext| {
            let ext = ext.trim().to_ascii_lowercase();
            if ext.is_empty() {
                return None;
            }
            Some(if ext.starts_with('.') { ext } else { format!(".{ext}") })
        })
        .collect()
}

async fn read_item(path: &Path) -> Option<InboundItem> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = %path.display(), %err, "skipping unreadable file");
            return None;
        }
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let declared_mime = guess_mime(&name).map(str::to_string);
    let mut origin_detail = BTreeMap::new();
    origin_detail.insert("path".to_string(), path.display().to_string());
    Some(InboundItem {
        bytes,
        declared_name: name,
        declared_mime,
        origin: Origin::Filesystem,
        origin_detail,
    })
}

fn guess_mime(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    Some(match ext.to_ascii_lowercase().as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        "txt" => "text/plain",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "odt" => "application/vnd.oasis.opendocument.text",
        _ => return None,
    })
}
