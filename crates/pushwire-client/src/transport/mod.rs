//! Transport layer
//!
//! The engine talks to the server through the [`Transport`] trait:
//! - [`HttpTransport`] sends requests with `reqwest` (TLS and sockets included)
//! - [`mock::MockTransport`] replays scripted connections for testing
//!
//! # Example
//!
//! ```ignore
//! use pushwire_client::transport::{HttpTransport, Transport};
//!
//! let transport = HttpTransport::new(Duration::from_secs(10))?;
//! let body = transport.exchange(&endpoint, &request).await?;
//! ```

mod adapter;
pub mod error;
mod http;
pub mod mock;

pub use adapter::{ByteStream, Transport};
pub use error::TransportError;
pub use http::HttpTransport;
