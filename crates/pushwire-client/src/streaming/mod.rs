//! Stream reading
//!
//! [`LineReader`] turns the byte stream of one transport connection into
//! lines for the decoder.
//!
//! # Example
//!
//! ```ignore
//! let stream = transport.open(&endpoint, &request).await?;
//! let mut reader = LineReader::new(stream);
//!
//! loop {
//!     match reader.next_line().await {
//!         Ok(line) => println!("{}", line),
//!         Err(e) if e.is_terminal() => break,
//!         Err(_) => continue,
//!     }
//! }
//! ```

mod reader;

pub use reader::{LineReader, StreamError, DEFAULT_MAX_LINE_LENGTH};
