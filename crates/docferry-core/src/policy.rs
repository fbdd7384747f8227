use thiserror::Error;

use crate::item::InboundItem;

/// Why an item was turned away before any hashing or remote traffic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("empty content")]
    Empty,
    #[error("{size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("extension of {name:?} is not allowed")]
    ExtensionNotAllowed { name: String },
    #[error("mime type {mime:?} is not allowed")]
    MimeNotAllowed { mime: String },
}

/// Pipeline-level acceptance rules. Empty lists allow everything; the size
/// limit of zero means unlimited.
#[derive(Debug, Clone, Default)]
pub struct ValidationPolicy {
    pub max_size_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub allowed_mime_types: Vec<String>,
}

impl ValidationPolicy {
    pub fn check(&self, item: &InboundItem) -> Option<RejectReason> {
        if item.bytes.is_empty() {
            return Some(RejectReason::Empty);
        }
        let size = item.size_bytes();
        if self.max_size_bytes > 0 && size > self.max_size_bytes {
            return Some(RejectReason::TooLarge {
                size,
                limit: self.max_size_bytes,
            });
        }
        if !self.allowed_extensions.is_empty()
            && !matches_extension(&item.declared_name, &self.allowed_extensions)
        {
            return Some(RejectReason::ExtensionNotAllowed {
                name: item.declared_name.clone(),
            });
        }
        if !self.allowed_mime_types.is_empty() {
            // The filter binds declared types only; an item without one passes.
            if let Some(mime) = item.declared_mime.as_deref() {
                let known = self
                    .allowed_mime_types
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(mime));
                if !known {
                    return Some(RejectReason::MimeNotAllowed {
                        mime: mime.to_string(),
                    });
                }
            }
        }
        None
    }
}

fn matches_extension(name: &str, allowed: &[String]) -> bool {
    let name = name.to_ascii_lowercase();
    allowed.iter().any(|ext| {
        let ext = ext.trim().to_ascii_lowercase();
        if ext.is_empty() {
            return false;
        }
        if let Some(bare) = ext.strip_prefix('.') {
            name.ends_with(&format!(".{bare}"))
        } else {
            name.ends_with(&format!(".{ext}"))
        }
    })
}
