use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// Metadata attached to an upload: a fixed set of typed fields plus one
/// free-form provenance map. The map rides along verbatim; the typed fields
/// win when a key collides.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentMetadata {
    /// Document label, normally the declared file name.
    pub label: String,
    pub mime_type: Option<String>,
    /// Which pipeline produced the item ("directory" or "mailbox").
    pub source: String,
    pub fingerprint: String,
    pub size_bytes: u64,
    pub processed_at: DateTime<Utc>,
    pub extra: BTreeMap<String, String>,
}

impl DocumentMetadata {
    /// Description payload stored on the remote document. Always carries the
    /// fingerprint; the remote fingerprint search keys on it.
    pub fn description_json(&self) -> String {
        let mut fields = serde_json::Map::new();
        fields.insert("file_name".into(), json!(self.label));
        if let Some(mime) = &self.mime_type {
            fields.insert("mime_type".into(), json!(mime));
        }
        fields.insert("source".into(), json!(self.source));
        fields.insert("file_hash".into(), json!(self.fingerprint));
        fields.insert("file_size".into(), json!(self.size_bytes));
        fields.insert("processed_date".into(), json!(self.processed_at.to_rfc3339()));
        for (key, value) in &self.extra {
            fields.entry(key.clone()).or_insert_with(|| json!(value));
        }
        serde_json::to_string_pretty(&Value::Object(fields)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DocumentMetadata {
        DocumentMetadata {
            label: "report.pdf".into(),
            mime_type: Some("application/pdf".into()),
            source: "mailbox".into(),
            fingerprint: "ab".repeat(32),
            size_bytes: 1234,
            processed_at: Utc::now(),
            extra: BTreeMap::from([
                ("email_subject".to_string(), "Q3 report".to_string()),
                ("file_hash".to_string(), "spoofed".to_string()),
            ]),
        }
    }

    #[test]
    fn description_carries_fingerprint_and_extras() {
        let meta = sample();
        let description = meta.description_json();
        let parsed: Value = serde_json::from_str(&description).unwrap();
        assert_eq!(parsed["file_hash"], json!("ab".repeat(32)));
        assert_eq!(parsed["email_subject"], json!("Q3 report"));
        assert_eq!(parsed["source"], json!("mailbox"));
        assert_eq!(parsed["file_size"], json!(1234));
    }

    #[test]
    fn typed_fields_win_over_extra_collisions() {
        let meta = sample();
        let parsed: Value = serde_json::from_str(&meta.description_json()).unwrap();
        // "file_hash" in extra must not displace the real fingerprint.
        assert_ne!(parsed["file_hash"], json!("spoofed"));
    }
}
