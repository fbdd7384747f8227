//! Item producers. Each source feeds `InboundItem`s into the coordinator
//! channel and knows nothing about dedup or the document store.

pub mod directory;
pub mod mail;

pub use directory::DirectorySource;
pub use mail::{open_mailbox, MailSource, Mailbox, RawMessage};
