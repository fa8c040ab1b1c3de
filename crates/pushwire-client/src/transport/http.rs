//! HTTP transport backed by reqwest

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;
use url::Url;

use super::{ByteStream, Transport, TransportError};
use crate::config::Endpoint;
use crate::protocol::Request;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends requests as form `POST`s over HTTP or HTTPS
///
/// No overall request timeout is set on the client: stream responses stay
/// open for as long as the server keeps them. Liveness and control timeouts
/// are enforced by the session engine.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (proxy, custom root certificates, ...)
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn url(endpoint: &Endpoint, request: &Request) -> Result<Url, TransportError> {
        Ok(Url::parse(&endpoint.base_url())?.join(&request.path)?)
    }

    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Result<reqwest::Response, TransportError> {
        let url = Self::url(endpoint, request)?;
        debug!("POST {}", url);

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(request.body())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, message });
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(
        &self,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Result<ByteStream, TransportError> {
        let response = self.send(endpoint, request).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from));
        Ok(Box::pin(stream))
    }

    async fn exchange(&self, endpoint: &Endpoint, request: &Request) -> Result<Bytes, TransportError> {
        let response = self.send(endpoint, request).await?;
        Ok(response.bytes().await?)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::with_client(
            Client::builder()
                .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
        )
    }
}
