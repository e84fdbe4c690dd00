// Application configuration
//
// Bind parameters plus a free-form value map handed to modules and plugins
// through their registration contexts.

use crate::tls::TlsConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone)]
pub struct AppConfig {
    /// Bind address.
    pub host: String,
    /// TCP port; 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Allow port sharing across acceptors (SO_REUSEPORT).
    pub shared: bool,
    /// Negotiate gzip on buffered response bodies.
    pub enable_compression: bool,
    /// Connection idle duration; never preempts an active request.
    pub idle_timeout: Option<Duration>,
    /// Cap on buffered request body bytes.
    pub max_request_body_bytes: Option<usize>,
    /// Pre-built TLS material; opaque to the runtime.
    pub security: Option<TlsConfig>,
    values: HashMap<String, Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            shared: false,
            enable_compression: false,
            idle_timeout: None,
            max_request_body_bytes: None,
            security: None,
            values: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn enable_compression(mut self, enable: bool) -> Self {
        self.enable_compression = enable;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn max_request_body_bytes(mut self, cap: usize) -> Self {
        self.max_request_body_bytes = Some(cap);
        self
    }

    pub fn security(mut self, tls: TlsConfig) -> Self {
        self.security = Some(tls);
        self
    }

    /// Set a free-form config value visible to modules and plugins.
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Look up a free-form config value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = AppConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8080);
        assert!(!config.shared);
        assert!(!config.enable_compression);
        assert!(config.idle_timeout.is_none());
        assert!(config.max_request_body_bytes.is_none());
    }

    #[test]
    fn free_form_values_round_trip() {
        let config = AppConfig::new().set("feature.flag", true).set("db.pool", 8);
        assert_eq!(config.get("feature.flag"), Some(&Value::Bool(true)));
        assert_eq!(config.get("db.pool"), Some(&Value::from(8)));
        assert!(config.get("missing").is_none());
    }
}
