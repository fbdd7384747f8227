use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use super::{tls_connect, Mailbox, RawMessage};

/// POP3 transport, a small hand-written line protocol client. The protocol
/// has no read flags, so every poll returns everything; downstream dedup
/// absorbs the re-offers.
#[derive(Debug)]
pub struct Pop3Mailbox<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream: BufStream<S>,
}

impl Pop3Mailbox<TlsStream<TcpStream>> {
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

impl Pop3Mailbox<TcpStream> {
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

impl<S> Pop3Mailbox<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Authenticate over an established stream.
    pub async fn login(stream: S, username: &str, password: &str) -> Result<Self> {
        let mut mailbox = Self {
            stream: BufStream::new(stream),
        };
        mailbox.read_status().await.context("pop3 greeting")?;
        mailbox.command(&format!("USER {username}")).await?;
        mailbox.command(&format!("PASS {password}")).await?;
        Ok(mailbox)
    }

    pub async fn quit(mut self) -> Result<()> {
        self.command("QUIT").await?;
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<String> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_status().await
    }

    /// Read one `+OK`/`-ERR` line; returns the text after the status word.
    async fn read_status(&mut self) -> Result<String> {
        let line = self.read_line().await?;
        let text = String::from_utf8_lossy(&line);
        match text.strip_prefix("+OK") {
            Some(rest) => Ok(rest.trim().to_string()),
            None => bail!("pop3 server refused: {}", text.trim()),
        }
    }

    /// One raw line without its terminator. Byte-level, since message bodies
    /// need not be valid UTF-8.
    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            bail!("pop3 connection closed unexpectedly");
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(buf)
    }

    /// Read a multi-line response body: terminated by a lone `.`, with the
    /// leading dot of `..`-stuffed lines stripped.
    async fn read_multiline(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == b"." {
                break;
            }
            if line.first() == Some(&b'.') {
                body.extend_from_slice(&line[1..]);
            } else {
                body.extend_from_slice(&line);
            }
            body.extend_from_slice(b"\r\n");
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl<S> Mailbox for Pop3Mailbox<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn fetch_messages(
        &mut self,
        unread_only: bool,
        max: Option<usize>,
    ) -> Result<Vec<RawMessage>> {
        if unread_only {
            debug!("pop3 has no read state, fetching everything");
        }
        let stat = self.command("STAT").await?;
        let count: usize = stat
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let take = max.map_or(count, |m| count.min(m));

        let mut messages = Vec::with_capacity(take);
        for index in 1..=take {
            self.command(&format!("RETR {index}")).await?;
            let raw = self.read_multiline().await?;
            messages.push(RawMessage {
                id: index.to_string(),
                raw,
            });
        }
        debug!(count = messages.len(), "pop3 fetch finished");
        Ok(messages)
    }

    async fn mark_read(&mut self, id: &str) -> Result<()> {
        warn!(id = %id, "pop3 cannot mark messages read, it will be offered again");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;

    async fn scripted_server(io: DuplexStream, script: Vec<(&'static str, &'static str)>) {
        let (read_half, mut write_half) = tokio::io::split(io);
        let mut reader = BufReader::new(read_half);
        write_half.write_all(b"+OK pop ready\r\n").await.unwrap();
        for (expect, reply) in script {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(
                line.starts_with(expect),
                "client sent {line:?}, expected {expect:?}"
            );
            write_half.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn fetch_unstuffs_dots_and_splits_messages() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = tokio::spawn(scripted_server(
            server_io,
            vec![
                ("USER u", "+OK\r\n"),
                ("PASS p", "+OK logged in\r\n"),
                ("STAT", "+OK 2 440\r\n"),
                (
                    "RETR 1",
                    "+OK\r\nSubject: one\r\n\r\n..starts with a dot\r\nplain\r\n.\r\n",
                ),
                ("RETR 2", "+OK\r\nSubject: two\r\n\r\nhello\r\n.\r\n"),
            ],
        ));

        let mut mailbox = Pop3Mailbox::login(client_io, "u", "p").await.unwrap();
        let messages = mailbox.fetch_messages(true, None).await.unwrap();
        server.await.unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "1");
        assert_eq!(
            messages[0].raw,
            b"Subject: one\r\n\r\n.starts with a dot\r\nplain\r\n"
        );
        assert_eq!(messages[1].raw, b"Subject: two\r\n\r\nhello\r\n");
    }

    #[tokio::test]
    async fn max_caps_how_many_messages_are_retrieved() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = tokio::spawn(scripted_server(
            server_io,
            vec![
                ("USER u", "+OK\r\n"),
                ("PASS p", "+OK\r\n"),
                ("STAT", "+OK 5 9999\r\n"),
                ("RETR 1", "+OK\r\nonly this one\r\n.\r\n"),
            ],
        ));

        let mut mailbox = Pop3Mailbox::login(client_io, "u", "p").await.unwrap();
        let messages = mailbox.fetch_messages(false, Some(1)).await.unwrap();
        server.await.unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].raw, b"only this one\r\n");
    }

    #[tokio::test]
    async fn rejected_credentials_fail_the_login() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = tokio::spawn(scripted_server(
            server_io,
            vec![("USER u", "+OK\r\n"), ("PASS bad", "-ERR denied\r\n")],
        ));

        let err = Pop3Mailbox::login(client_io, "u", "bad").await.unwrap_err();
        server.await.unwrap();
        assert!(err.to_string().contains("denied"));
    }
}
