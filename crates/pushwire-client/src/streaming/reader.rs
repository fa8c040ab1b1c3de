//! Line reader
//!
//! Reassembles the transport's byte chunks into lines.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, trace};

use crate::transport::{ByteStream, TransportError};

/// Longest line accepted unless configured otherwise (1 MiB)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Why no line could be read
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The server closed the connection in an orderly way
    #[error("End of stream")]
    EndOfStream,

    /// The transport failed (reset, TLS failure, timeout)
    #[error("Stream fault: {0}")]
    Fault(TransportError),

    /// A complete line arrived but is not UTF-8; the reader can continue
    #[error("Invalid UTF-8 in line ({len} bytes)")]
    InvalidUtf8 { len: usize },

    /// More than `limit` bytes arrived without a line terminator
    #[error("Line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

impl StreamError {
    /// Whether more lines can follow this error
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InvalidUtf8 { .. })
    }
}

/// Pull-based line reader over one transport connection
///
/// Lines are yielded in arrival order with the `\n` (and an optional `\r`)
/// stripped. A trailing partial line is kept until its terminator arrives;
/// if the connection ends first, it is discarded. A partial line longer
/// than the maximum line length ends the connection with
/// [`StreamError::LineTooLong`]. Once the connection has ended the reader
/// only returns [`StreamError::EndOfStream`].
pub struct LineReader {
    stream: ByteStream,
    /// Buffer for the incomplete line
    buffer: Vec<u8>,
    max_line_length: usize,
    ended: bool,
    bytes_read: u64,
}

impl LineReader {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            ended: false,
            bytes_read: 0,
        }
    }

    /// Bound the bytes held for one unterminated line
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    /// Wait for the next complete line.
    ///
    /// Cancel-safe: if the future is dropped before completing, no data is
    /// lost and the next call picks up where this one stopped.
    pub async fn next_line(&mut self) -> Result<String, StreamError> {
        loop {
            if let Some(line) = self.take_line() {
                return line;
            }
            if self.ended {
                return Err(StreamError::EndOfStream);
            }
            if self.buffer.len() > self.max_line_length {
                self.finish();
                return Err(StreamError::LineTooLong {
                    limit: self.max_line_length,
                });
            }

            match self.stream.next().await {
                Some(Ok(bytes)) => self.append(bytes),
                Some(Err(e)) => {
                    self.finish();
                    return Err(StreamError::Fault(e));
                }
                None => {
                    self.finish();
                    return Err(StreamError::EndOfStream);
                }
            }
        }
    }

    /// Total bytes received on this connection
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Bytes of the incomplete line currently held
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Release the connection
    pub fn close(self) {
        debug!(bytes_read = self.bytes_read, "Closing stream connection");
    }

    /// Turn the reader into a lazy stream of lines.
    ///
    /// The stream ends after yielding the first terminal error.
    pub fn into_lines(mut self) -> impl Stream<Item = Result<String, StreamError>> + Send {
        async_stream::stream! {
            loop {
                match self.next_line().await {
                    Ok(line) => yield Ok(line),
                    Err(e) => {
                        let terminal = e.is_terminal();
                        yield Err(e);
                        if terminal {
                            break;
                        }
                    }
                }
            }
        }
    }

    fn append(&mut self, bytes: Bytes) {
        self.bytes_read += bytes.len() as u64;
        self.buffer.extend_from_slice(&bytes);
    }

    fn take_line(&mut self) -> Option<Result<String, StreamError>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        match String::from_utf8(line) {
            Ok(line) => {
                trace!("Line: {}", line);
                Some(Ok(line))
            }
            Err(e) => Some(Err(StreamError::InvalidUtf8 {
                len: e.as_bytes().len(),
            })),
        }
    }

    fn finish(&mut self) {
        self.ended = true;
        if !self.buffer.is_empty() {
            debug!(
                bytes = self.buffer.len(),
                "Discarding unterminated line at end of stream"
            );
            self.buffer.clear();
        }
    }
}

impl std::fmt::Debug for LineReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineReader")
            .field("buffered", &self.buffer.len())
            .field("ended", &self.ended)
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}
