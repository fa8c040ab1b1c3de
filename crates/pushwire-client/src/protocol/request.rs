//! Request building
//!
//! Every request is an HTTP `POST` of a form body made of `LS_*` parameters.

use super::escape::encode_query_value;
use crate::config::{Credentials, SessionOptions};

/// Opens a new session and its first stream connection
pub const CREATE_SESSION_PATH: &str = "/lightstreamer/create_session.txt";
/// Opens a new stream connection for an existing session
pub const BIND_SESSION_PATH: &str = "/lightstreamer/bind_session.txt";
/// Short-lived control requests
pub const CONTROL_PATH: &str = "/lightstreamer/control.txt";

/// Ordered request parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.push((key.into(), value.into()));
        self
    }

    /// Push the parameter only when a value is set
    pub fn push_opt<V: ToString>(&mut self, key: impl Into<String>, value: Option<V>) -> &mut Self {
        if let Some(value) = value {
            self.0.push((key.into(), value.to_string()));
        }
        self
    }

    /// First value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `key=value&...` with values percent-encoded
    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, encode_query_value(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// A request to the streaming server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: String,
    pub params: Params,
}

impl Request {
    pub fn new(path: impl Into<String>, params: Params) -> Self {
        Self {
            path: path.into(),
            params,
        }
    }

    /// Create request: adapter set, credentials and requested options
    pub fn create_session(
        adapter_set: &str,
        credentials: &Credentials,
        options: &SessionOptions,
    ) -> Self {
        let mut params = Params::new();
        params
            .push("LS_adapter_set", adapter_set)
            .push_opt("LS_user", credentials.user.as_deref())
            .push_opt("LS_password", credentials.password.as_deref());
        push_options(&mut params, options);
        Self::new(CREATE_SESSION_PATH, params)
    }

    /// Bind request: reuses the session identifier
    pub fn bind_session(session_id: &str, options: &SessionOptions) -> Self {
        let mut params = Params::new();
        params.push("LS_session", session_id);
        push_options(&mut params, options);
        Self::new(BIND_SESSION_PATH, params)
    }

    /// Form-encoded request body
    pub fn body(&self) -> String {
        self.params.encode()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }
}

fn push_options(params: &mut Params, options: &SessionOptions) {
    params
        .push_opt("LS_keepalive_millis", options.keepalive_ms)
        .push_opt("LS_content_length", options.content_length)
        .push_opt("LS_polling_millis", options.polling_ms)
        .push_opt("LS_idle_millis", options.idle_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_body() {
        let options = SessionOptions {
            keepalive_ms: Some(5000),
            content_length: Some(100_000),
            ..Default::default()
        };
        let request = Request::create_session(
            "QUOTES",
            &Credentials::new("trader 1", "p&ss"),
            &options,
        );

        assert_eq!(request.path, CREATE_SESSION_PATH);
        assert_eq!(
            request.body(),
            "LS_adapter_set=QUOTES&LS_user=trader%201&LS_password=p%26ss\
             &LS_keepalive_millis=5000&LS_content_length=100000"
        );
    }

    #[test]
    fn test_create_request_without_credentials() {
        let request = Request::create_session(
            "DEFAULT",
            &Credentials::anonymous(),
            &SessionOptions::default(),
        );
        assert_eq!(request.body(), "LS_adapter_set=DEFAULT");
        assert_eq!(request.param("LS_user"), None);
    }

    #[test]
    fn test_bind_request_carries_session_id() {
        let request = Request::bind_session("S8f2a", &SessionOptions::default());
        assert_eq!(request.path, BIND_SESSION_PATH);
        assert_eq!(request.param("LS_session"), Some("S8f2a"));
        assert_eq!(request.body(), "LS_session=S8f2a");
    }
}
