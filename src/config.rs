//! Connection configuration.
//!
//! Everything optional has a default, so a JSON file only needs `jid` and
//! `password`. Durations are written as (fractional) seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::jid::Jid;
use crate::sasl::{Credentials, MechanismSelector, DEFAULT_MECHANISMS};

/// How long one negotiation step may wait for the server's reply.
pub const NEGOTIATION_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a clean disconnect waits for the server's `</stream:stream>`.
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Base delay of the exponential backoff between resumption attempts.
pub const RESUMPTION_BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Refuse to authenticate over an unencrypted stream.
    #[default]
    Required,
    /// Use STARTTLS when offered.
    IfPossible,
    /// Never negotiate TLS (direct TLS endpoints are still encrypted).
    Disabled,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bare JID of the account.
    pub jid: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub resource: Option<String>,
    /// Server override (`tls://host:port`, `tcp://…`, `wss://…`, `host:port`).
    pub server: Option<String>,
    pub security: SecurityMode,
    pub mechanisms: Vec<String>,
    pub blacklisted_mechanisms: Vec<String>,
    pub stream_management: bool,
    pub resumption: bool,
    pub preferred_resumption_secs: Option<u32>,
    #[serde(with = "secs")]
    pub reply_timeout: Duration,
    pub ack_request_threshold: usize,
    #[serde(with = "secs")]
    pub ack_request_interval: Duration,
    #[serde(with = "secs")]
    pub ack_timeout: Duration,
    pub resumption_attempts: u32,
    /// Skip certificate verification. Development servers only.
    pub insecure_tls: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            jid: String::new(),
            password: String::new(),
            resource: None,
            server: None,
            security: SecurityMode::Required,
            mechanisms: DEFAULT_MECHANISMS.iter().map(|m| m.to_string()).collect(),
            blacklisted_mechanisms: Vec::new(),
            stream_management: true,
            resumption: true,
            preferred_resumption_secs: None,
            reply_timeout: Duration::from_secs(5),
            ack_request_threshold: 5,
            ack_request_interval: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(30),
            resumption_attempts: 3,
            insecure_tls: false,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("jid", &self.jid)
            .field("resource", &self.resource)
            .field("server", &self.server)
            .field("security", &self.security)
            .field("mechanisms", &self.mechanisms)
            .field("stream_management", &self.stream_management)
            .field("resumption", &self.resumption)
            .field("insecure_tls", &self.insecure_tls)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    pub fn with_mechanisms<S: Into<String>>(mut self, mechanisms: impl IntoIterator<Item = S>) -> Self {
        self.mechanisms = mechanisms.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blacklisted_mechanisms<S: Into<String>>(
        mut self,
        mechanisms: impl IntoIterator<Item = S>,
    ) -> Self {
        self.blacklisted_mechanisms = mechanisms.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stream_management(mut self, enabled: bool) -> Self {
        self.stream_management = enabled;
        self
    }

    pub fn with_resumption(mut self, enabled: bool, preferred_secs: Option<u32>) -> Self {
        self.resumption = enabled;
        self.preferred_resumption_secs = preferred_secs;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_ack_policy(mut self, threshold: usize, interval: Duration, timeout: Duration) -> Self {
        self.ack_request_threshold = threshold;
        self.ack_request_interval = interval;
        self.ack_timeout = timeout;
        self
    }

    pub fn with_resumption_attempts(mut self, attempts: u32) -> Self {
        self.resumption_attempts = attempts;
        self
    }

    pub fn with_insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }

    /// Parse and check the account JID.
    pub fn account(&self) -> Result<Jid, Error> {
        let jid: Jid = self.jid.parse()?;
        if jid.local().is_none() && !self.mechanisms.iter().any(|m| m == "ANONYMOUS") {
            return Err(Error::Config(format!(
                "'{}' has no local part; only ANONYMOUS can authenticate without one",
                self.jid
            )));
        }
        Ok(jid.to_bare())
    }

    pub fn credentials(&self, account: &Jid) -> Credentials {
        Credentials {
            username: account.local().unwrap_or_default().to_string(),
            password: self.password.clone(),
            authzid: None,
            domain: account.domain().to_string(),
        }
    }

    pub fn mechanism_selector(&self) -> MechanismSelector {
        MechanismSelector::new(self.mechanisms.clone(), self.blacklisted_mechanisms.clone())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
