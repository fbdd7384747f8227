//! Mailbox polling: fetch messages, split attachments into items, flag the
//! message once everything was handed over. The `Mailbox` trait hides the
//! transport so IMAP, POP3 and test fakes are interchangeable.

mod imap;
mod pop3;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use mail_parser::{Message, MessageParser, MimeHeaders};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

pub use imap::ImapMailbox;
pub use pop3::Pop3Mailbox;

use crate::config::{MailProtocol, MailSection};
use crate::item::{InboundItem, Origin};

/// A whole message as fetched from the transport.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Transport-level handle, fed back into `mark_read`.
    pub id: String,
    pub raw: Vec<u8>,
}

#[async_trait::async_trait]
pub trait Mailbox: Send {
    async fn fetch_messages(
        &mut self,
        unread_only: bool,
        max: Option<usize>,
    ) -> Result<Vec<RawMessage>>;

    async fn mark_read(&mut self, id: &str) -> Result<()>;
}

#[async_trait::async_trait]
impl Mailbox for Box<dyn Mailbox> {
    async fn fetch_messages(
        &mut self,
        unread_only: bool,
        max: Option<usize>,
    ) -> Result<Vec<RawMessage>> {
        (**self).fetch_messages(unread_only, max).await
    }

    async fn mark_read(&mut self, id: &str) -> Result<()> {
        (**self).mark_read(id).await
    }
}

/// Connect the transport named by the configuration.
pub async fn open_mailbox(section: &MailSection) -> Result<Box<dyn Mailbox>> {
    ensure!(!section.server.is_empty(), "no mail server configured");
    let host = section.server.as_str();
    let mailbox: Box<dyn Mailbox> = match (section.protocol, section.tls) {
        (MailProtocol::Imap, true) => Box::new(
            ImapMailbox::connect_tls(host, section.port, &section.username, &section.password)
                .await?,
        ),
        (MailProtocol::Imap, false) => Box::new(
            ImapMailbox::connect_plain(host, section.port, &section.username, &section.password)
                .await?,
        ),
        (MailProtocol::Pop3, true) => Box::new(
            Pop3Mailbox::connect_tls(host, section.port, &section.username, &section.password)
                .await?,
        ),
        (MailProtocol::Pop3, false) => Box::new(
            Pop3Mailbox::connect_plain(host, section.port, &section.username, &section.password)
                .await?,
        ),
    };
    Ok(mailbox)
}

pub(crate) async fn tls_connect(host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| anyhow!("invalid mail server name {host:?}"))?;
    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("tls handshake with {host} failed"))?;
    Ok(stream)
}

/// Polls one mailbox and turns attachments into pipeline items.
pub struct MailSource<M: Mailbox> {
    mailbox: M,
    /// Lowercased; exact addresses or `@domain` suffixes. Empty accepts all.
    allowed_senders: Vec<String>,
    include_read: bool,
    max_messages: Option<usize>,
}

impl<M: Mailbox> MailSource<M> {
    pub fn new(
        mailbox: M,
        allowed_senders: Vec<String>,
        include_read: bool,
        max_messages: Option<usize>,
    ) -> Self {
        Self {
            mailbox,
            allowed_senders: allowed_senders
                .into_iter()
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            include_read,
            max_messages,
        }
    }

    /// One poll cycle: fetch, expand, hand over, flag. Returns how many
    /// items were enqueued.
    ///
    /// A message is marked read only after every one of its attachments has
    /// been handed to the pipeline; outcomes are not awaited, so a later
    /// upload failure does not resurface the message by itself.
    pub async fn poll_once(&mut self, tx: &mpsc::Sender<InboundItem>) -> Result<usize> {
        let unread_only = !self.include_read;
        let messages = self
            .mailbox
            .fetch_messages(unread_only, self.max_messages)
            .await?;
        debug!(count = messages.len(), "mailbox returned messages");

        let mut enqueued = 0;
        for message in messages {
            match self.expand(&message) {
                None => self.flag_read(&message.id).await,
                Some(items) => {
                    let count = items.len();
                    let mut handed_over = true;
                    for item in items {
                        if tx.send(item).await.is_err() {
                            handed_over = false;
                            break;
                        }
                    }
                    if !handed_over {
                        debug!("pipeline closed, leaving the message unread");
                        return Ok(enqueued);
                    }
                    enqueued += count;
                    self.flag_read(&message.id).await;
                }
            }
        }
        Ok(enqueued)
    }

    /// Poll on an interval until `shutdown` flips. A failing cycle is logged
    /// and the next one retried; only the caller's shutdown ends the loop.
    pub async fn poll_loop(
        &mut self,
        tx: mpsc::Sender<InboundItem>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            match self.poll_once(&tx).await {
                Ok(enqueued) => info!(enqueued, "mail poll cycle finished"),
                Err(err) => warn!(%err, "mail poll cycle failed"),
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Ok(())
    }

    /// Describe what a poll would ingest, without flagging or enqueuing.
    pub async fn preview(&mut self) -> Result<Vec<String>> {
        let unread_only = !self.include_read;
        let messages = self
            .mailbox
            .fetch_messages(unread_only, self.max_messages)
            .await?;
        let mut lines = Vec::new();
        for message in messages {
            let Some(mail) = MessageParser::default().parse(&message.raw) else {
                lines.push(format!("{}: unparseable", message.id));
                continue;
            };
            let sender = sender_of(&mail);
            let subject = mail.subject().unwrap_or("(no subject)");
            if !self.sender_allowed(&sender) {
                lines.push(format!("{sender} {subject:?}: blocked by allow-list"));
                continue;
            }
            let names: Vec<&str> = mail
                .attachments()
                .map(|part| part.attachment_name().unwrap_or("unnamed"))
                .collect();
            lines.push(format!(
                "{sender} {subject:?}: {} attachment(s) [{}]",
                names.len(),
                names.join(", ")
            ));
        }
        Ok(lines)
    }

    /// Items for one message, or `None` when there is nothing to hand over
    /// (blocked sender, unparseable, no attachments). `None` still flags the
    /// message read so the next poll does not reconsider it.
    fn expand(&self, message: &RawMessage) -> Option<Vec<InboundItem>> {
        let Some(mail) = MessageParser::default().parse(&message.raw) else {
            warn!(id = %message.id, "unparseable message, skipping");
            return None;
        };
        let sender = sender_of(&mail);
        if !self.sender_allowed(&sender) {
            debug!(id = %message.id, %sender, "sender not allowed, ignoring message");
            return None;
        }
        let items = items_from(&mail, &sender);
        if items.is_empty() {
            debug!(id = %message.id, "no attachments");
            return None;
        }
        Some(items)
    }

    fn sender_allowed(&self, sender: &str) -> bool {
        if self.allowed_senders.is_empty() {
            return true;
        }
        let sender = sender.to_ascii_lowercase();
        self.allowed_senders.iter().any(|entry| {
            if let Some(domain) = entry.strip_prefix('@') {
                sender.ends_with(&format!("@{domain}"))
            } else {
                sender == *entry
            }
        })
    }

    async fn flag_read(&mut self, id: &str) {
        if let Err(err) = self.mailbox.mark_read(id).await {
            warn!(id = %id, %err, "could not mark message read");
        }
    }
}

fn sender_of(mail: &Message<'_>) -> String {
    mail.from()
        .and_then(|address| address.first())
        .and_then(|addr| addr.address())
        .unwrap_or("")
        .to_string()
}

fn items_from(mail: &Message<'_>, sender: &str) -> Vec<InboundItem> {
    let subject = mail.subject().unwrap_or("").to_string();
    let message_id = mail.message_id().unwrap_or("").to_string();
    let received_at = mail.date().map(|d| d.to_rfc3339()).unwrap_or_default();

    let parts: Vec<_> = mail.attachments().collect();
    let total = parts.len();
    parts
        .into_iter()
        .enumerate()
        .map(|(index, part)| {
            let declared_name = part
                .attachment_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("attachment-{}", index + 1));
            let declared_mime = part.content_type().map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{subtype}", ct.ctype()),
                None => ct.ctype().to_string(),
            });

            let mut origin_detail = BTreeMap::new();
            origin_detail.insert("message_id".to_string(), message_id.clone());
            origin_detail.insert("sender".to_string(), sender.to_string());
            origin_detail.insert("subject".to_string(), subject.clone());
            origin_detail.insert("received_at".to_string(), received_at.clone());
            origin_detail.insert("attachment_index".to_string(), (index + 1).to_string());
            origin_detail.insert("attachment_count".to_string(), total.to_string());

            InboundItem {
                bytes: part.contents().to_vec(),
                declared_name,
                declared_mime,
                origin: Origin::Mailbox,
                origin_detail,
            }
        })
        .collect()
}
