//! Reads framed messages from a byte stream.
//!
//! A [FrameReader](FrameReader) wraps one side of a connection (either the client or the
//! upstream server) and keeps a single receive buffer around. Bytes are read into this buffer
//! until [Message::parse](crate::message::Message::parse) reports a complete frame, which is
//! then removed from the buffer. Any trailing bytes stay buffered for the next call, as clients
//! are free to pipeline requests.
//!
//! Note that [read_frame](FrameReader::read_frame) is cancel safe: if the returned future is
//! dropped (e.g. because a timeout elapsed), all bytes read so far remain in the buffer.
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::message::{FrameError, Message};

/// Determines the pre-allocated receive buffer size. Most LDAP messages fit into this buffer so
/// that no additional allocations are required when reading a frame.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Reads one complete message at a time from the given stream.
pub struct FrameReader<R> {
    stream: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Creates a new reader for the given stream.
    pub fn new(stream: R) -> Self {
        FrameReader {
            stream,
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }

    /// Reads the next complete message.
    ///
    /// Returns `Ok(None)` if the peer closed the stream cleanly between two frames. If the
    /// stream ends in the middle of a frame, [FrameError::Truncated](FrameError::Truncated) is
    /// reported.
    pub async fn read_frame(&mut self) -> Result<Option<Message>, FrameError> {
        loop {
            if let Some(message) = Message::parse(&self.buffer)? {
                self.consume(message.len());
                return Ok(Some(message));
            }

            if self.buffer.capacity() - self.buffer.len() < DEFAULT_BUFFER_SIZE / 2 {
                self.buffer.reserve(DEFAULT_BUFFER_SIZE);
            }

            match self.stream.read_buf(&mut self.buffer).await? {
                0 if self.buffer.is_empty() => return Ok(None),
                0 => return Err(FrameError::Truncated),
                _ => (),
            }
        }
    }

    /// Returns the number of bytes which have been read but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn consume(&mut self, len: usize) {
        // If the buffer has grown in order to accommodate a large frame, we shrink it here again
        // and only transfer the trailing data...
        if self.buffer.capacity() > DEFAULT_BUFFER_SIZE {
            let mut buffer =
                BytesMut::with_capacity(DEFAULT_BUFFER_SIZE.max(self.buffer.len() - len));
            buffer.put_slice(&self.buffer[len..]);
            self.buffer = buffer;
        } else {
            self.buffer.advance(len);
        }
    }
}
