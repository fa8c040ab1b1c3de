//! Client configuration
//!
//! Configuration types for the session engine: where to connect, which
//! adapter set to ask for, the options requested from the server, and the
//! local rebind/liveness policy.
//!
//! Every type deserializes from TOML with sensible defaults, so a minimal
//! configuration only names the host:
//!
//! ```toml
//! adapter_set = "QUOTES"
//!
//! [endpoint]
//! host = "push.example.com"
//! port = 443
//! secure = true
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::streaming::DEFAULT_MAX_LINE_LENGTH;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Endpoint
// =============================================================================

/// Server address of the streaming service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use TLS
    #[serde(default)]
    pub secure: bool,
}

fn default_port() -> u16 {
    8080
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    /// Base URL of the endpoint (e.g. `https://push.example.com:443`)
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Same port and scheme, different host.
    ///
    /// Used when the server redirects control requests to a dedicated
    /// control address.
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: self.port,
            secure: self.secure,
        }
    }
}

impl std::str::FromStr for Endpoint {
    type Err = ConfigError;

    /// Parse `http://host[:port]` or `https://host[:port]`; the port defaults
    /// to the scheme's well-known port
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = url::Url::parse(s)
            .map_err(|e| ConfigError::Invalid(format!("invalid server URL '{}': {}", s, e)))?;
        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported scheme '{}' (expected http or https)",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::Invalid(format!("server URL '{}' has no host", s)))?;
        let port = url.port_or_known_default().unwrap_or_else(default_port);
        Ok(Self::new(host, port, secure))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// User credentials sent with the create request
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    /// No credentials (anonymous session)
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            password: Some(password.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// Session Options
// =============================================================================

/// Options requested from the server on create and bind
///
/// Unset options are left out of the request and the server applies its own
/// defaults. The values the server actually grants come back in the session
/// header (see [`crate::SessionInfo`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Keep-alive interval requested from the server (milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_ms: Option<u64>,
    /// Bytes the server may send on one connection before asking for a rebind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    /// Lower polling bound (milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_ms: Option<u64>,
    /// Upper polling bound: how long the server may hold an idle poll (milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_ms: Option<u64>,
}

// =============================================================================
// Rebind Policy
// =============================================================================

/// Bounds on consecutive rebind attempts
///
/// The attempt counter resets every time a bind succeeds, so the bound only
/// limits back-to-back failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebindPolicy {
    /// Maximum consecutive rebind attempts (0 disables rebinding)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt (milliseconds)
    #[serde(default)]
    pub initial_backoff_ms: u64,
    /// Upper bound for the exponential backoff (milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for RebindPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: 0,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RebindPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Computes the delay to apply before the given attempt.
    ///
    /// `attempt` is 1-based. The first attempt waits `initial_backoff_ms`,
    /// each following one doubles it up to `max_backoff_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max = Duration::from_millis(self.max_backoff_ms);
        let mut delay = Duration::from_millis(self.initial_backoff_ms).min(max);
        for _ in 1..attempt {
            delay = delay.saturating_mul(2).min(max);
        }
        delay
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration of a [`crate::SessionManager`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Streaming server
    pub endpoint: Endpoint,
    /// Adapter set the session is created against
    #[serde(default = "default_adapter_set")]
    pub adapter_set: String,
    /// Options requested on create and bind
    #[serde(default)]
    pub options: SessionOptions,
    /// Rebind automatically when the stream ends without an explicit close
    #[serde(default = "default_autorebind")]
    pub autorebind: bool,
    /// Rebind attempt bound and backoff
    #[serde(default)]
    pub rebind: RebindPolicy,
    /// How long to wait for any line (heartbeats included) before treating
    /// the connection as stalled (milliseconds)
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    /// Bound on the create/bind handshake (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on a control request exchange (milliseconds)
    #[serde(default = "default_control_timeout_ms")]
    pub control_timeout_ms: u64,
    /// Longest line accepted on the stream (bytes)
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

fn default_adapter_set() -> String {
    "DEFAULT".to_string()
}

fn default_autorebind() -> bool {
    true
}

fn default_liveness_timeout_ms() -> u64 {
    15_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_control_timeout_ms() -> u64 {
    5_000
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint, adapter_set: impl Into<String>) -> Self {
        Self {
            endpoint,
            adapter_set: adapter_set.into(),
            options: SessionOptions::default(),
            autorebind: default_autorebind(),
            rebind: RebindPolicy::default(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            control_timeout_ms: default_control_timeout_ms(),
            max_line_length: default_max_line_length(),
        }
    }

    /// Parse and validate a TOML configuration document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint host is empty".to_string()));
        }
        if self.adapter_set.is_empty() {
            return Err(ConfigError::Invalid("adapter set is empty".to_string()));
        }
        if self.liveness_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "liveness timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid(
                "max line length must be greater than zero".to_string(),
            ));
        }
        if self.rebind.initial_backoff_ms > self.rebind.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "initial rebind backoff ({}ms) exceeds maximum ({}ms)",
                self.rebind.initial_backoff_ms, self.rebind.max_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_autorebind(mut self, autorebind: bool) -> Self {
        self.autorebind = autorebind;
        self
    }

    pub fn with_rebind_policy(mut self, policy: RebindPolicy) -> Self {
        self.rebind = policy;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    /// How long a stream may stay silent before it counts as stalled.
    ///
    /// At least the liveness timeout, and at least one and a half keep-alive
    /// intervals. The interval granted by the server wins over the requested
    /// one.
    pub fn stall_timeout(&self, granted_keepalive: Option<Duration>) -> Duration {
        let keepalive = granted_keepalive
            .or_else(|| self.options.keepalive_ms.map(Duration::from_millis))
            .unwrap_or_default();
        self.liveness_timeout().max(keepalive + keepalive / 2)
    }
}
