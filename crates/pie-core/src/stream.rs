//! Length-prefixed framing over an ordered byte stream.
//!
//! Every frame on the wire is `varint(len) || payload[len]`, with the whole
//! framed length bounded by [`MAX_MESSAGE_LEN`]. Receiving keeps a single
//! reusable buffer with two cursors:
//!
//! ```text
//!  0            parse_offset          read_offset             capacity
//!  ├──────────────────┼────────────────────┼──────────────────────┤
//!  │  returned frames │  buffered, unparsed │        free          │
//!  └──────────────────┴────────────────────┴──────────────────────┘
//! ```
//!
//! Parsing only consumes complete frames. When the buffered bytes do not
//! hold a complete frame the stream performs exactly one read and parses
//! again. A full buffer holding an incomplete frame has its unparsed tail
//! moved to the front before the next read.

use crate::error::{Error, Result};
use crate::message::NetMessage;
use crate::varint::{self, VarintError};
use crate::MAX_MESSAGE_LEN;
use std::future::Future;
use std::ops::Range;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Receive half of a transport stream
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Send half of a transport stream
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Longest message rendering written to debug logs
const LOG_PREVIEW_CHARS: usize = 500;

/// Outcome of parsing the buffered bytes
#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseState {
    /// Length prefix or payload incomplete
    NeedMoreData,
    /// Malformed length prefix
    InvalidLength,
    /// Declared payload length above the limit
    TooLong(u64),
    /// Declared frame does not fit in the receive buffer
    ExceedsBuffer(usize),
    /// Zero-length frame consumed
    EmptyFrame,
    /// Complete frame at this buffer range
    Ready(Range<usize>),
}

/// A framed, bidirectional stream
pub struct Stream {
    id: u64,
    reader: ByteReader,
    writer: ByteWriter,
    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    parse_offset: usize,
    read_offset: usize,
    poisoned: bool,
}

impl Stream {
    /// Wrap a transport stream with a receive buffer of [`MAX_MESSAGE_LEN`]
    #[must_use]
    pub fn new(id: u64, reader: ByteReader, writer: ByteWriter) -> Self {
        Self::with_buffer(id, reader, writer, Vec::new())
    }

    /// Wrap a transport stream reusing a caller-supplied receive buffer
    ///
    /// The buffer's length is the receive capacity. An empty buffer is
    /// replaced by one of [`MAX_MESSAGE_LEN`] bytes. Reclaim it with
    /// [`Stream::into_buffer`].
    #[must_use]
    pub fn with_buffer(id: u64, reader: ByteReader, writer: ByteWriter, buf: Vec<u8>) -> Self {
        let recv_buf = if buf.is_empty() {
            vec![0u8; MAX_MESSAGE_LEN]
        } else {
            buf
        };
        Self {
            id,
            reader,
            writer,
            send_buf: Vec::new(),
            recv_buf,
            parse_offset: 0,
            read_offset: 0,
            poisoned: false,
        }
    }

    /// Transport-assigned stream id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive buffer capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.recv_buf.len()
    }

    /// Current `(parse_offset, read_offset)` cursors
    #[must_use]
    pub fn offsets(&self) -> (usize, usize) {
        (self.parse_offset, self.read_offset)
    }

    /// Release the receive buffer for reuse by another stream
    #[must_use]
    pub fn into_buffer(self) -> Vec<u8> {
        self.recv_buf
    }

    /// Send one frame carrying `payload`
    ///
    /// Nothing is written when the framed length exceeds
    /// [`MAX_MESSAGE_LEN`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLong`] for oversized payloads,
    /// [`Error::TimedOut`] if `deadline` passes before the frame is fully
    /// written, or the transport's write error.
    pub async fn send_frame(&mut self, payload: &[u8], deadline: Option<Instant>) -> Result<()> {
        let framed_len = varint::encoded_len(payload.len() as u64) + payload.len();
        if framed_len > MAX_MESSAGE_LEN {
            return Err(Error::MessageTooLong {
                len: framed_len,
                max: MAX_MESSAGE_LEN,
            });
        }

        let Self {
            writer, send_buf, ..
        } = self;
        send_buf.clear();
        varint::encode_into(send_buf, payload.len() as u64);
        send_buf.extend_from_slice(payload);

        let write = async {
            writer.write_all(send_buf).await?;
            writer.flush().await
        };
        match with_deadline(deadline, write).await? {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = Error::from_io(e);
                if !err.is_expected() {
                    tracing::warn!("Failed to write to stream {}: {}", self.id, err);
                }
                Err(err)
            }
        }
    }

    /// Receive the next non-empty frame
    ///
    /// The returned slice borrows the stream's receive buffer and stays
    /// valid until the next receive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] when `deadline` passes,
    /// [`Error::Closed`] when the peer finished the stream,
    /// [`Error::InvalidMessage`] for a malformed length prefix and
    /// [`Error::MessageTooLong`] for frames above the limit or larger than
    /// the receive buffer. The last two leave the stream unusable.
    pub async fn recv_frame(&mut self, deadline: Option<Instant>) -> Result<&[u8]> {
        let range = self.recv_frame_range(deadline).await?;
        Ok(&self.recv_buf[range])
    }

    /// Receive the next non-empty frame, returning its buffer range
    ///
    /// # Errors
    ///
    /// See [`Stream::recv_frame`].
    pub async fn recv_frame_range(&mut self, deadline: Option<Instant>) -> Result<Range<usize>> {
        if self.poisoned {
            return Err(Error::InvalidMessage(
                "stream poisoned by an earlier framing error".to_string(),
            ));
        }
        loop {
            match self.parse() {
                ParseState::Ready(range) => return Ok(range),
                ParseState::EmptyFrame => {
                    tracing::debug!("Skipping empty frame on stream {}", self.id);
                }
                ParseState::NeedMoreData => self.fill(deadline).await?,
                ParseState::InvalidLength => {
                    self.poisoned = true;
                    tracing::warn!("Invalid frame length prefix on stream {}", self.id);
                    return Err(Error::InvalidMessage("invalid frame length".to_string()));
                }
                ParseState::TooLong(len) => {
                    self.poisoned = true;
                    tracing::warn!("Frame too long on stream {}: {} bytes", self.id, len);
                    return Err(Error::MessageTooLong {
                        len: usize::try_from(len).unwrap_or(usize::MAX),
                        max: MAX_MESSAGE_LEN,
                    });
                }
                ParseState::ExceedsBuffer(len) => {
                    self.poisoned = true;
                    tracing::warn!(
                        "Frame of {} bytes exceeds receive buffer of stream {}",
                        len,
                        self.id
                    );
                    return Err(Error::MessageTooLong {
                        len,
                        max: self.capacity(),
                    });
                }
            }
        }
    }

    /// Encode and send a wire message
    ///
    /// # Errors
    ///
    /// See [`Stream::send_frame`].
    pub async fn send_message(&mut self, message: &NetMessage, deadline: Option<Instant>) -> Result<()> {
        let data = message.to_bytes()?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Sending message on stream {}: {}", self.id, preview(message));
        }
        self.send_frame(&data, deadline).await
    }

    /// Receive and decode a wire message
    ///
    /// # Errors
    ///
    /// See [`Stream::recv_frame`]; a payload that fails to decode yields
    /// [`Error::InvalidMessage`].
    pub async fn recv_message(&mut self, deadline: Option<Instant>) -> Result<NetMessage> {
        let id = self.id;
        let frame = self.recv_frame(deadline).await?;
        let message = NetMessage::from_bytes(frame).inspect_err(|e| {
            tracing::warn!("Failed to decode message on stream {}: {}", id, e);
        })?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Received message on stream {}: {}", id, preview(&message));
        }
        Ok(message)
    }

    /// Finish the send side of the stream
    ///
    /// # Errors
    ///
    /// Returns the transport's shutdown error.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.map_err(|e| {
            tracing::debug!("Failed to close stream {}: {}", self.id, e);
            Error::from_io(e)
        })
    }

    fn parse(&mut self) -> ParseState {
        let buffered = &self.recv_buf[self.parse_offset..self.read_offset];
        let (len, prefix) = match varint::decode(buffered) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return ParseState::NeedMoreData,
            Err(VarintError::Overflow) => return ParseState::InvalidLength,
        };
        if len > MAX_MESSAGE_LEN as u64 {
            return ParseState::TooLong(len);
        }
        // Bounded by MAX_MESSAGE_LEN above
        let len = len as usize;
        if prefix + len > self.capacity() {
            return ParseState::ExceedsBuffer(prefix + len);
        }
        if len > buffered.len() - prefix {
            return ParseState::NeedMoreData;
        }

        let start = self.parse_offset + prefix;
        self.parse_offset = start + len;
        if len == 0 {
            ParseState::EmptyFrame
        } else {
            ParseState::Ready(start..start + len)
        }
    }

    async fn fill(&mut self, deadline: Option<Instant>) -> Result<()> {
        if self.read_offset == self.capacity() {
            self.compact();
        }

        let Self {
            reader,
            recv_buf,
            read_offset,
            ..
        } = self;
        let read = reader.read(&mut recv_buf[*read_offset..]);
        let n = match with_deadline(deadline, read).await? {
            Ok(n) => n,
            Err(e) => {
                let err = Error::from_io(e);
                if !err.is_expected() {
                    tracing::warn!("Failed to read from stream {}: {}", self.id, err);
                }
                return Err(err);
            }
        };
        if n == 0 {
            return Err(Error::Closed(format!("stream {} finished by peer", self.id)));
        }
        self.read_offset += n;
        Ok(())
    }

    fn compact(&mut self) {
        self.recv_buf
            .copy_within(self.parse_offset..self.read_offset, 0);
        self.read_offset -= self.parse_offset;
        self.parse_offset = 0;
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("parse_offset", &self.parse_offset)
            .field("read_offset", &self.read_offset)
            .finish_non_exhaustive()
    }
}

async fn with_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Result<F::Output> {
    match deadline {
        Some(deadline) => Ok(tokio::time::timeout_at(deadline, fut).await?),
        None => Ok(fut.await),
    }
}

fn preview(message: &NetMessage) -> String {
    format!("{message:?}").chars().take(LOG_PREVIEW_CHARS).collect()
}
