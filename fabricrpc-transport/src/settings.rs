//! Transport settings and endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Tunables shared by transport clients and listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Keep-alive interval in seconds. Clients ping twice per interval and
    /// server connections idle for two intervals are dropped.
    pub keep_alive_timeout_secs: u64,
    /// Maximum in-flight calls per client.
    pub max_concurrent_calls: u32,
    /// Maximum message size (header + body) in KiB.
    pub max_message_size_kb: u32,
    /// Maximum requests queued per server connection before reads stall.
    pub max_queue_size: u32,
    /// Timeout applied when a caller passes a zero timeout, in seconds.
    pub operation_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            keep_alive_timeout_secs: 10,
            max_concurrent_calls: 10,
            max_message_size_kb: 100,
            max_queue_size: 100,
            operation_timeout_secs: 30,
        }
    }
}

impl TransportSettings {
    pub fn with_keep_alive(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_max_concurrent_calls(mut self, max: u32) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    pub fn with_max_message_size_kb(mut self, kb: u32) -> Self {
        self.max_message_size_kb = kb;
        self
    }

    pub fn with_max_queue_size(mut self, max: u32) -> Self {
        self.max_queue_size = max;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size_kb as usize * 1024
    }

    /// Substitutes the configured operation timeout for a zero timeout.
    pub fn effective_timeout(&self, timeout: Duration) -> Duration {
        if timeout.is_zero() {
            self.operation_timeout()
        } else {
            timeout
        }
    }
}

/// A listening address plus the settings to serve it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    settings: TransportSettings,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            settings: TransportSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// `host:port`, suitable for socket APIs.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Listener url in `host:port+/` form.
    pub fn url(&self) -> String {
        format!("{}:{}+/", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}
