//! Forwards requests to the upstream LDAP server.
//!
//! Each session owns at most one [Upstream](Upstream). The TCP connection is only established
//! once the first request actually has to be forwarded, therefore sessions which are completely
//! served from the cache never touch the upstream server at all. Once established, the same
//! connection is used for all further requests of the session.
//!
//! A single request may be answered by several messages: a search yields one message per
//! entry or reference and is completed by its SearchResultDone. [forward](Upstream::forward)
//! therefore keeps reading until a message arrives which isn't
//! [continued](crate::message::Message::is_continued).
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::fmt::format_duration;
use crate::message::Message;
use crate::reader::FrameReader;

/// Represents the (lazily connected) link to the upstream server.
pub struct Upstream {
    address: String,
    timeout: Option<Duration>,
    connection: Option<UpstreamConnection>,
    finished: bool,
}

struct UpstreamConnection {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Upstream {
    /// Creates a new upstream for the given address.
    ///
    /// No connection is made until [forward](Upstream::forward) is invoked. If a **timeout**
    /// is given, connecting and waiting for each reply message must not take longer than this.
    pub fn new(address: &str, timeout: Option<Duration>) -> Self {
        Upstream {
            address: address.to_owned(),
            timeout,
            connection: None,
            finished: false,
        }
    }

    /// Returns the address of the upstream server.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Determines if a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Determines if the upstream server has closed the connection.
    ///
    /// Once finished, the upstream cannot be used anymore and the session has to end.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sends the given raw request and reads the complete reply.
    ///
    /// Returns an empty list if the upstream server closed the connection without replying
    /// (which is the case for an UnbindRequest). The upstream is [finished](Upstream::is_finished)
    /// afterwards and every further call fails. If the server closes the connection in the
    /// middle of a multi-message reply, an error is returned, as a partial result must never be
    /// delivered or cached.
    pub async fn forward(&mut self, request: &[u8]) -> anyhow::Result<Vec<Message>> {
        if self.finished {
            return Err(anyhow!(
                "The upstream server {} has already closed the connection.",
                &self.address
            ));
        }

        if self.connection.is_none() {
            self.connect().await?;
        }

        let timeout = self.timeout;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("No connection to the upstream server is available."))?;

        connection
            .writer
            .write_all(request)
            .await
            .context("Failed to send a request to the upstream server")?;
        connection.writer.flush().await?;

        let mut replies = Vec::new();
        loop {
            let reply = within(
                timeout,
                "waiting for the upstream server to reply",
                connection.reader.read_frame(),
            )
            .await
            .context("Failed to read a reply from the upstream server")?;

            match reply {
                Some(reply) => {
                    let continued = reply.is_continued();
                    replies.push(reply);
                    if !continued {
                        return Ok(replies);
                    }
                }
                None if replies.is_empty() => {
                    log::debug!("Upstream server {} closed the connection.", &self.address);
                    self.finished = true;
                    self.connection = None;
                    return Ok(replies);
                }
                None => {
                    return Err(anyhow!(
                        "The upstream server closed the connection after {} of a multi-part reply.",
                        replies.len()
                    ))
                }
            }
        }
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        let stream = within(
            self.timeout,
            "connecting to the upstream server",
            TcpStream::connect(&self.address),
        )
        .await
        .with_context(|| format!("Cannot connect to the upstream server {}", &self.address))?;

        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        self.connection = Some(UpstreamConnection {
            reader: FrameReader::new(reader),
            writer,
        });

        log::debug!("Connected to upstream server {}.", &self.address);
        Ok(())
    }

    /// Closes the connection to the upstream server (if one was established).
    ///
    /// Calling this more than once has no effect.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.writer.shutdown().await;
            log::debug!("Closed connection to upstream server {}.", &self.address);
        }
    }
}

/// Awaits the given future, giving up after **timeout** if one is present.
async fn within<F, T, E>(timeout: Option<Duration>, action: &str, future: F) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, future).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(anyhow!(
                "Timeout ({}) while {}.",
                format_duration(timeout),
                action
            )),
        },
        None => future.await.map_err(Into::into),
    }
}
