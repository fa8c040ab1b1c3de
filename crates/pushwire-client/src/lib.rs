//! Pushwire Client Library
//!
//! Client engine for line-oriented push streaming sessions: a session is
//! created over HTTP, then the server keeps the response open and pushes
//! one update per line. Lost connections are re-bound to the same session,
//! and subscriptions are managed over a separate control channel.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pushwire_client::{
//!     ClientConfig, Credentials, Endpoint, FieldValue, HttpTransport, SessionListener,
//!     SessionManager, Subscription,
//! };
//!
//! struct Printer;
//!
//! impl SessionListener for Printer {
//!     fn on_row_update(&self, item: &str, fields: &[FieldValue]) {
//!         println!("{}: {:?}", item, fields);
//!     }
//!     fn on_session_error(&self, code: i32, message: &str) {
//!         eprintln!("error {}: {}", code, message);
//!     }
//!     fn on_stream_closed(&self) {}
//!     fn on_rebind_succeeded(&self) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::new(Endpoint::new("push.example.com", 8080, false), "QUOTES");
//!     let manager = SessionManager::new(config, Arc::new(HttpTransport::default()));
//!
//!     manager.create(Credentials::anonymous(), Arc::new(Printer)).await?;
//!     manager
//!         .subscribe(Subscription::merge(["item1", "item2"], ["last", "time"]))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Testing
//!
//! The `testing` module provides a local HTTP server, a recording listener
//! and a polling helper; [`transport::mock::MockTransport`] scripts stream
//! connections without any network:
//!
//! ```rust,ignore
//! use pushwire_client::testing::{RecordingListener, wait_for};
//! use pushwire_client::transport::mock::MockTransport;
//!
//! let transport = Arc::new(MockTransport::new());
//! let conn = transport.expect_connection();
//! conn.accept_session("S1");
//! conn.send_line("1,100.5|#=");
//! ```

pub mod config;
mod control;
mod error;
pub mod protocol;
mod session;
pub mod streaming;
mod subscription;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError, Credentials, Endpoint, RebindPolicy, SessionOptions};
pub use control::{ControlChannel, ControlOp, ControlRequest};
pub use error::{ControlError, Result, SessionError, StreamFault};
pub use protocol::{FieldValue, MalformedLine, RowUpdate, ServerError, UpdateEvent};
pub use session::{Phase, SessionInfo, SessionListener, SessionManager};
pub use streaming::{LineReader, StreamError};
pub use subscription::{MaxFrequency, Snapshot, Subscription, SubscriptionMode, TableId};
pub use transport::{HttpTransport, Transport, TransportError};
