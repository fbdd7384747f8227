use std::collections::BTreeMap;

/// Which kind of source produced an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Filesystem,
    Mailbox,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Filesystem => "directory",
            Origin::Mailbox => "mailbox",
        }
    }
}

/// One unit of work pulled from a source. Ephemeral: handed to the processor
/// exactly once and never retried by the source itself. A later scan or poll
/// may offer the same content again; dedup absorbs that.
#[derive(Debug, Clone)]
pub struct InboundItem {
    pub bytes: Vec<u8>,
    pub declared_name: String,
    pub declared_mime: Option<String>,
    pub origin: Origin,
    /// Free-form context from the source: `path` for files; `message_id`,
    /// `sender`, `subject`, `received_at`, `attachment_index`,
    /// `attachment_count` for mail.
    pub origin_detail: BTreeMap<String, String>,
}

impl InboundItem {
    /// Informational provenance string stored alongside the cache record.
    pub fn provenance(&self) -> String {
        match self.origin {
            Origin::Filesystem => self
                .origin_detail
                .get("path")
                .cloned()
                .unwrap_or_else(|| self.declared_name.clone()),
            Origin::Mailbox => {
                let message = self
                    .origin_detail
                    .get("message_id")
                    .map(String::as_str)
                    .unwrap_or("<unknown>");
                match self.origin_detail.get("attachment_index") {
                    Some(index) => format!("{message}#{index}"),
                    None => message.to_string(),
                }
            }
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}
