use std::fmt;

use anyhow::{anyhow, Context, Result};
use async_imap::Session;
use futures_util::TryStreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::{tls_connect, Mailbox, RawMessage};

/// IMAP transport. Fetches whole messages by UID; `mark_read` sets `\Seen`.
pub struct ImapMailbox<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug,
{
    session: Session<S>,
}

impl ImapMailbox<TlsStream<TcpStream>> {
    pub async fn connect_tls(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let stream = tls_connect(host, port).await?;
        Self::login(stream, username, password).await
    }
}

impl ImapMailbox<TcpStream> {
    pub async fn connect_plain(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        Self::login(stream, username, password).await
    }
}

impl<S> ImapMailbox<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug,
{
    async fn login(stream: S, username: &str, password: &str) -> Result<Self> {
        let client = async_imap::Client::new(stream);
        let session = client
            .login(username, password)
            .await
            .map_err(|(err, _)| anyhow!("imap login failed: {err}"))?;
        Ok(Self { session })
    }

    pub async fn close(mut self) -> Result<()> {
        self.session.logout().await.context("imap logout failed")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S> Mailbox for ImapMailbox<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug,
{
    async fn fetch_messages(
        &mut self,
        unread_only: bool,
        max: Option<usize>,
    ) -> Result<Vec<RawMessage>> {
        self.session
            .select("INBOX")
            .await
            .context("selecting INBOX failed")?;
        let query = if unread_only { "UNSEEN" } else { "ALL" };
        let mut uids: Vec<u32> = self
            .session
            .uid_search(query)
            .await
            .context("uid search failed")?
            .into_iter()
            .collect();
        uids.sort_unstable();
        if let Some(max) = max {
            uids.truncate(max);
        }
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let uid_set = uids
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let fetches: Vec<_> = self
            .session
            .uid_fetch(&uid_set, "RFC822")
            .await
            .context("uid fetch failed")?
            .try_collect()
            .await?;

        let mut messages = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            let (Some(uid), Some(body)) = (fetch.uid, fetch.body()) else {
                continue;
            };
            messages.push(RawMessage {
                id: uid.to_string(),
                raw: body.to_vec(),
            });
        }
        debug!(count = messages.len(), "imap fetch finished");
        Ok(messages)
    }

    async fn mark_read(&mut self, id: &str) -> Result<()> {
        // The store response stream must be drained for the command to run.
        let _updates: Vec<_> = self
            .session
            .uid_store(id, "+FLAGS (\\Seen)")
            .await
            .context("uid store failed")?
            .try_collect()
            .await?;
        Ok(())
    }
}
