//! Transport trait and types

use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};

use super::TransportError;
use crate::config::Endpoint;
use crate::protocol::Request;

/// Response body of a streaming request, delivered as it arrives
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Transport-agnostic interface to the streaming server
///
/// The engine never touches sockets or TLS itself; it sends requests and
/// reads response bytes through this trait. Dropping a [`ByteStream`] must
/// release the underlying connection and unblock any pending read.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return its response body as a byte stream
    ///
    /// Used for create and bind requests, whose response stays open and
    /// carries the update stream.
    async fn open(&self, endpoint: &Endpoint, request: &Request)
        -> Result<ByteStream, TransportError>;

    /// Send a short-lived request and return its complete response body
    ///
    /// Used for control requests. Independent of any open stream.
    async fn exchange(&self, endpoint: &Endpoint, request: &Request) -> Result<Bytes, TransportError> {
        let mut stream = self.open(endpoint, request).await?;
        let mut body = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body.freeze())
    }
}
