//! Server configuration.

use std::collections::HashSet;
use std::time::Duration;
use weft_protocol::PROTOCOL_VERSION;

/// Configuration for the reference service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Protocol version accepted at handshake.
    pub protocol_version: u16,
    /// Upper bound applied to every query page.
    pub max_page_size: u32,
    /// Maximum messages per stream per second, if limited.
    pub publish_rate_limit: Option<u32>,
    /// Whether to require signed tokens.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// How long before token expiry sessions are warned.
    pub token_warning: Duration,
    /// Identities that may read but not write.
    pub read_only_identities: HashSet<String>,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            max_page_size: 100,
            publish_rate_limit: None,
            require_auth: false,
            auth_secret: None,
            token_warning: Duration::from_secs(180),
            read_only_identities: HashSet::new(),
        }
    }

    /// Sets the maximum page size.
    pub fn with_max_page_size(mut self, size: u32) -> Self {
        self.max_page_size = size;
        self
    }

    /// Limits publishes per stream per second.
    pub fn with_publish_rate_limit(mut self, per_second: u32) -> Self {
        self.publish_rate_limit = Some(per_second);
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the accepted protocol version.
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }

    /// Marks an identity as read-only.
    pub fn with_read_only(mut self, identity: impl Into<String>) -> Self {
        self.read_only_identities.insert(identity.into());
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_page_size, 100);
        assert!(!config.require_auth);
        assert!(config.publish_rate_limit.is_none());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_page_size(50)
            .with_publish_rate_limit(10)
            .with_read_only("viewer")
            .with_auth(vec![1, 2, 3, 4]);

        assert_eq!(config.max_page_size, 50);
        assert_eq!(config.publish_rate_limit, Some(10));
        assert!(config.read_only_identities.contains("viewer"));
        assert!(config.require_auth);
        assert_eq!(config.auth_secret, Some(vec![1, 2, 3, 4]));
    }
}
