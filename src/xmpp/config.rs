//! Client configuration.

use std::time::Duration;

use super::error::{Error, Result};
use super::jid::Jid;
use super::stream_management::ResumptionToken;

/// TCP connect timeout for each candidate endpoint.
///
/// Without it the OS default applies, which on some platforms is 30-120
/// seconds for unreachable hosts.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for each negotiation round-trip (features, STARTTLS, SASL, bind...).
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for application-level queries (roster, disco, ping).
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_SM_WINDOW: u32 = 5;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bare account JID.
    pub jid: Jid,
    pub password: String,
    /// Requested resource; the server may assign a different one.
    pub resource: String,
    /// Explicit endpoint (`tls://host:port`, `tcp://host`, `host:port` or a
    /// domain). SRV resolution of the account domain when unset.
    pub server: Option<String>,
    /// Refuse to authenticate over a stream that was never encrypted.
    pub require_tls: bool,
    pub dangerous_insecure_tls: bool,
    pub connect_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub query_timeout: Duration,
    pub stream_management: bool,
    /// Send `<r/>` after every `sm_window` outbound stanzas.
    pub sm_window: u32,
    pub sm_resume: bool,
    pub resume_from: Option<ResumptionToken>,
}

impl ClientConfig {
    pub fn new(jid: Jid, password: impl Into<String>) -> Self {
        Self {
            jid: jid.to_bare(),
            password: password.into(),
            resource: jid.resource().unwrap_or_default().to_string(),
            server: None,
            require_tls: true,
            dangerous_insecure_tls: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            stream_management: true,
            sm_window: DEFAULT_SM_WINDOW,
            sm_resume: false,
            resume_from: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_require_tls(mut self, require: bool) -> Self {
        self.require_tls = require;
        self
    }

    pub fn with_dangerous_insecure_tls(mut self, insecure: bool) -> Self {
        self.dangerous_insecure_tls = insecure;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_stream_management(mut self, enabled: bool, window: u32, resume: bool) -> Self {
        self.stream_management = enabled;
        self.sm_window = window;
        self.sm_resume = resume;
        self
    }

    pub fn with_resumption(mut self, token: ResumptionToken) -> Self {
        self.resume_from = Some(token);
        self
    }

    /// Reject combinations that can never produce a working session.
    pub fn validate(&self) -> Result<()> {
        if self.jid.node().is_none() {
            return Err(Error::Config(format!(
                "account JID {} has no localpart",
                self.jid
            )));
        }
        if self.password.is_empty() {
            return Err(Error::Config("password is empty".into()));
        }
        if self.stream_management && self.sm_window == 0 {
            return Err(Error::Config("stream management window must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("user@example.com/mobile".parse().unwrap(), "secret");
        assert_eq!(config.jid.to_string(), "user@example.com");
        assert_eq!(config.resource, "mobile");
        assert!(config.require_tls);
        assert!(!config.dangerous_insecure_tls);
        assert_eq!(config.sm_window, 5);
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let no_node = ClientConfig::new("example.com".parse().unwrap(), "secret");
        assert!(matches!(no_node.validate(), Err(Error::Config(_))));

        let no_password = ClientConfig::new("user@example.com".parse().unwrap(), "");
        assert!(no_password.validate().is_err());

        let zero_window = ClientConfig::new("user@example.com".parse().unwrap(), "secret")
            .with_stream_management(true, 0, false);
        assert!(zero_window.validate().is_err());
    }
}
