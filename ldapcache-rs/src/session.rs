//! Contains the per-connection proxy logic.
//!
//! Each client connection is handled by its own [Session](Session). As long as all requests of
//! a connection can be answered from the [ReplyCache](crate::lru::cache::ReplyCache), no upstream
//! connection is made at all. Once the first request misses the cache, the upstream server has
//! never seen any of the previous requests of this connection (most notably the bind which
//! authenticated the client). Therefore, the whole history is replayed first (discarding the
//! replies) before the missed request is forwarded. From then on, caching is disabled for the
//! remainder of the connection and every request is forwarded. Replies received from upstream are
//! still stored in the cache, so that other connections benefit from them.
//!
//! Replies are always written in the order in which the requests were received.
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::fingerprint::Fingerprint;
use crate::lru::cache::{CacheEntry, ReplyCache};
use crate::message::Message;
use crate::platform::Platform;
use crate::reader::FrameReader;
use crate::upstream::Upstream;

/// Specifies the timeout when waiting for the next request of a client.
///
/// When waiting for incoming data we need to interrupt this every once in a while to check
/// if the platform is being shut down.
const READ_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Counts what happened within a session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStats {
    /// The number of requests received from the client.
    pub requests: usize,
    /// The number of requests which were answered from the cache.
    pub hits: usize,
    /// The number of requests which were forwarded to the upstream server.
    pub misses: usize,
    /// The number of earlier requests which were replayed to resync the upstream server.
    pub replayed: usize,
}

impl Display for SessionStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} requests, {} hits, {} misses, {} replayed",
            self.requests, self.hits, self.misses, self.replayed
        )
    }
}

/// Represents the state of a single client connection.
pub struct Session {
    cache: Arc<ReplyCache>,
    upstream: Upstream,
    history: Vec<Message>,
    caching_enabled: bool,
    stats: SessionStats,
}

impl Session {
    /// Creates a new session which uses the given cache and (not yet connected) upstream.
    pub fn new(cache: Arc<ReplyCache>, upstream: Upstream) -> Self {
        Session {
            cache,
            upstream,
            history: Vec::new(),
            caching_enabled: true,
            stats: SessionStats::default(),
        }
    }

    /// Determines if requests may still be answered from the cache.
    ///
    /// This is **true** until the first cache miss and never becomes **true** again.
    pub fn is_caching(&self) -> bool {
        self.caching_enabled
    }

    /// Returns the counters of this session.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Determines if an upstream connection has been established.
    pub fn is_connected(&self) -> bool {
        self.upstream.is_connected()
    }

    /// Determines if the upstream server has closed the connection.
    ///
    /// The reply to the request which caused this has still to be delivered, but no further
    /// request can be handled.
    pub fn is_finished(&self) -> bool {
        self.upstream.is_finished()
    }

    /// Determines the reply for the given request.
    ///
    /// While caching is enabled, a live cache entry is returned as is. Otherwise the request is
    /// forwarded to the upstream server (after replaying the history on the first miss) and
    /// its reply is stored in the cache.
    ///
    /// Any upstream error is returned and should end the session, as the upstream connection
    /// is in an unknown state afterwards.
    pub async fn handle(&mut self, request: &Message) -> anyhow::Result<CacheEntry> {
        self.stats.requests += 1;
        let fingerprint = Fingerprint::of(request.raw());

        if self.caching_enabled {
            self.history.push(request.clone());

            if let Some(entry) = self.cache.lookup(&fingerprint) {
                log::debug!("CACHE HIT {}", fingerprint);
                self.stats.hits += 1;
                return Ok(entry);
            }

            self.caching_enabled = false;
            self.resync().await?;
        }

        log::debug!("CACHE MISS {}", fingerprint);
        self.stats.misses += 1;

        let replies = self.upstream.forward(request.raw()).await?;
        let entry = CacheEntry::from_replies(&replies);
        self.cache.store(fingerprint, entry.clone());

        Ok(entry)
    }

    /// Replays all requests which were answered from the cache so far.
    ///
    /// The last entry of the history is the request which missed the cache and is therefore
    /// skipped here. The history isn't needed anymore afterwards.
    async fn resync(&mut self) -> anyhow::Result<()> {
        let mut history = std::mem::take(&mut self.history);
        let _ = history.pop();

        if history.is_empty() {
            return Ok(());
        }

        log::debug!(
            "Replaying {} requests to resync the upstream server {}...",
            history.len(),
            self.upstream.address()
        );

        for request in &history {
            let _ = self.upstream.forward(request.raw()).await?;
            self.stats.replayed += 1;
        }

        Ok(())
    }

    /// Closes the upstream connection (if any).
    pub async fn close(&mut self) {
        self.upstream.close().await;
    }
}

/// Processes all requests of the given client until it hangs up.
///
/// The loop also ends on a malformed request, an I/O error (on either side), once the upstream
/// server closed the connection or once the platform is terminated. In any case, the upstream connection is closed before returning.
pub async fn proxy_loop<S>(
    platform: Arc<Platform>,
    session: &mut Session,
    client: S,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(client);
    let mut reader = FrameReader::new(reader);

    let result = process_requests(&platform, session, &mut reader, &mut writer).await;

    session.close().await;
    let _ = writer.shutdown().await;

    result
}

async fn process_requests<R, W>(
    platform: &Platform,
    session: &mut Session,
    reader: &mut FrameReader<R>,
    writer: &mut W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while platform.is_running() {
        // We apply a timeout here, so that the condition of the while loop is checked every
        // once in a while...
        let request = match tokio::time::timeout(READ_WAIT_TIMEOUT, reader.read_frame()).await {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(error)) => return Err(error.into()),
            Err(_) => continue,
        };

        let entry = session.handle(&request).await?;
        for reply in entry.replies() {
            writer.write_all(reply).await?;
        }
        writer.flush().await?;

        if session.is_finished() {
            return Ok(());
        }
    }

    Ok(())
}
