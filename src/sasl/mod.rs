//! SASL authentication (RFC 6120 §6).
//!
//! A [`Mechanism`] knows how to produce the client side of one challenge /
//! response exchange. An [`AuthExchange`] wraps one attempt with one mechanism:
//! it owns the transcript, counts steps and records the outcome, and is never
//! reused. [`MechanismSelector`] applies the local priority list and operator
//! blacklist to what the server offers.

mod digest_md5;
mod plain;
mod scram;

use std::fmt;

use tracing::{debug, info, warn};

pub use digest_md5::DigestMd5;
pub use plain::{Anonymous, Plain};
pub use scram::{Scram, ScramSha1, ScramSha256, ScramSha512};

use crate::error::SaslError;

/// Mechanisms enabled when the configuration does not say otherwise, strongest first.
pub const DEFAULT_MECHANISMS: &[&str] = &[
    "SCRAM-SHA-512",
    "SCRAM-SHA-256",
    "SCRAM-SHA-1",
    "DIGEST-MD5",
    "PLAIN",
];

/// Every mechanism this crate implements.
pub const SUPPORTED_MECHANISMS: &[&str] = &[
    "SCRAM-SHA-512",
    "SCRAM-SHA-256",
    "SCRAM-SHA-1",
    "DIGEST-MD5",
    "PLAIN",
    "ANONYMOUS",
];

#[derive(Clone)]
pub struct Credentials {
    /// Local part of the account JID.
    pub username: String,
    pub password: String,
    /// Identity to act as, when different from the authenticated one.
    pub authzid: Option<String>,
    /// Server domain (DIGEST-MD5 `digest-uri`).
    pub domain: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("authzid", &self.authzid)
            .field("domain", &self.domain)
            .finish()
    }
}

/// Client side of one SASL mechanism.
pub trait Mechanism: Send + Sync {
    fn name(&self) -> &'static str;

    /// Data sent along with `<auth/>`; `None` when the mechanism waits for a
    /// server challenge first.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError>;

    /// Answer one server challenge.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError>;

    /// Check the additional data carried by `<success/>`. A mechanism that
    /// authenticates the server must fail here unless the server proved itself.
    fn finish(&mut self, additional: &[u8]) -> Result<(), SaslError>;
}

/// Build a mechanism by its IANA name.
pub fn create_mechanism(name: &str, credentials: &Credentials) -> Option<Box<dyn Mechanism>> {
    let mechanism: Box<dyn Mechanism> = match name {
        "SCRAM-SHA-512" => Box::new(Scram::<ScramSha512>::new(credentials)),
        "SCRAM-SHA-256" => Box::new(Scram::<ScramSha256>::new(credentials)),
        "SCRAM-SHA-1" => Box::new(Scram::<ScramSha1>::new(credentials)),
        "DIGEST-MD5" => Box::new(DigestMd5::new(credentials)),
        "PLAIN" => Box::new(Plain::new(credentials)),
        "ANONYMOUS" => Box::new(Anonymous),
        _ => return None,
    };
    Some(mechanism)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    Client(Vec<u8>),
    Server(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Pending,
    Succeeded,
    Failed(SaslError),
    Aborted,
}

/// One authentication attempt.
pub struct AuthExchange {
    mechanism: Box<dyn Mechanism>,
    step: u32,
    transcript: Vec<TranscriptEntry>,
    outcome: ExchangeOutcome,
}

impl fmt::Debug for AuthExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthExchange")
            .field("mechanism", &self.mechanism.name())
            .field("step", &self.step)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl AuthExchange {
    pub fn new(mechanism: Box<dyn Mechanism>) -> Self {
        Self {
            mechanism,
            step: 0,
            transcript: Vec::new(),
            outcome: ExchangeOutcome::Pending,
        }
    }

    pub fn mechanism_name(&self) -> &'static str {
        self.mechanism.name()
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn outcome(&self) -> &ExchangeOutcome {
        &self.outcome
    }

    fn ensure_pending(&self, what: &'static str) -> Result<(), SaslError> {
        match self.outcome {
            ExchangeOutcome::Pending => Ok(()),
            _ => Err(SaslError::UnexpectedStep(what)),
        }
    }

    fn record<T>(&mut self, result: Result<T, SaslError>) -> Result<T, SaslError> {
        if let Err(e) = &result {
            self.outcome = ExchangeOutcome::Failed(e.clone());
        }
        result
    }

    /// Produce the initial response for `<auth/>`.
    pub fn start(&mut self) -> Result<Option<Vec<u8>>, SaslError> {
        self.ensure_pending("auth")?;
        if self.step != 0 {
            return Err(SaslError::UnexpectedStep("auth"));
        }
        let result = self.mechanism.initial_response();
        let initial = self.record(result)?;
        if let Some(data) = &initial {
            self.transcript.push(TranscriptEntry::Client(data.clone()));
        }
        self.step = 1;
        debug!(mechanism = self.mechanism_name(), "SASL exchange started");
        Ok(initial)
    }

    /// Answer a `<challenge/>`.
    pub fn challenge(&mut self, data: &[u8]) -> Result<Vec<u8>, SaslError> {
        self.ensure_pending("challenge")?;
        self.transcript.push(TranscriptEntry::Server(data.to_vec()));
        let result = self.mechanism.respond(data);
        let response = self.record(result)?;
        self.transcript.push(TranscriptEntry::Client(response.clone()));
        self.step += 1;
        Ok(response)
    }

    /// Handle `<success/>`; fails if the mechanism cannot verify the server.
    pub fn success(&mut self, additional: &[u8]) -> Result<(), SaslError> {
        self.ensure_pending("success")?;
        if !additional.is_empty() {
            self.transcript.push(TranscriptEntry::Server(additional.to_vec()));
        }
        let result = self.mechanism.finish(additional);
        self.record(result)?;
        self.outcome = ExchangeOutcome::Succeeded;
        info!(mechanism = self.mechanism_name(), steps = self.step, "SASL authentication succeeded");
        Ok(())
    }

    /// Handle `<failure/>`.
    pub fn failure(&mut self, condition: &str, text: Option<&str>) -> SaslError {
        let error = SaslError::Failure {
            condition: condition.to_string(),
            text: text.map(str::to_string),
        };
        warn!(mechanism = self.mechanism_name(), condition, "SASL authentication failed");
        self.outcome = ExchangeOutcome::Failed(error.clone());
        error
    }

    pub fn abort(&mut self) {
        if self.outcome == ExchangeOutcome::Pending {
            self.outcome = ExchangeOutcome::Aborted;
        }
    }
}

/// Local mechanism policy: priority order plus operator blacklist.
#[derive(Debug, Clone)]
pub struct MechanismSelector {
    priority: Vec<String>,
    blacklist: Vec<String>,
}

impl Default for MechanismSelector {
    fn default() -> Self {
        Self::new(DEFAULT_MECHANISMS.iter().map(|m| m.to_string()).collect(), Vec::new())
    }
}

impl MechanismSelector {
    pub fn new(priority: Vec<String>, blacklist: Vec<String>) -> Self {
        Self { priority, blacklist }
    }

    fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklist.iter().any(|b| b.eq_ignore_ascii_case(name))
    }

    /// Enabled mechanisms in priority order.
    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.priority
            .iter()
            .map(String::as_str)
            .filter(|m| SUPPORTED_MECHANISMS.contains(m))
            .filter(|m| !self.is_blacklisted(m))
    }

    /// Highest-priority enabled mechanism the server also offers.
    pub fn select(&self, offered: &[String]) -> Result<&str, SaslError> {
        self.enabled()
            .find(|m| offered.iter().any(|o| o.eq_ignore_ascii_case(m)))
            .ok_or_else(|| SaslError::NoCommonMechanism {
                offered: offered.to_vec(),
            })
    }

    /// Select a mechanism and open a fresh exchange with it.
    pub fn start(&self, offered: &[String], credentials: &Credentials) -> Result<AuthExchange, SaslError> {
        let name = self.select(offered)?;
        let mechanism = create_mechanism(name, credentials).ok_or_else(|| SaslError::NoCommonMechanism {
            offered: offered.to_vec(),
        })?;
        info!(mechanism = name, "Selected SASL mechanism");
        Ok(AuthExchange::new(mechanism))
    }
}

/// Comparison whose running time does not depend on where the inputs differ.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            username: "juliet".to_string(),
            password: "r0m30myr0m30".to_string(),
            authzid: None,
            domain: "capulet.lit".to_string(),
        }
    }

    fn offered(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_select_prefers_local_priority() {
        let selector = MechanismSelector::default();
        assert_eq!(
            selector.select(&offered(&["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"])).unwrap(),
            "SCRAM-SHA-256"
        );
        assert_eq!(selector.select(&offered(&["PLAIN"])).unwrap(), "PLAIN");
    }

    #[test]
    fn test_select_no_common_mechanism() {
        let selector = MechanismSelector::default();
        let err = selector.select(&offered(&["X-OAUTH2", "EXTERNAL"])).unwrap_err();
        assert_eq!(
            err,
            SaslError::NoCommonMechanism {
                offered: offered(&["X-OAUTH2", "EXTERNAL"])
            }
        );
    }

    #[test]
    fn test_blacklist_excludes_mechanism() {
        let selector = MechanismSelector::new(
            DEFAULT_MECHANISMS.iter().map(|m| m.to_string()).collect(),
            vec!["scram-sha-1".to_string()],
        );
        assert_eq!(
            selector.select(&offered(&["SCRAM-SHA-1", "PLAIN"])).unwrap(),
            "PLAIN"
        );
        assert!(selector.select(&offered(&["SCRAM-SHA-1"])).is_err());
    }

    #[test]
    fn test_unknown_names_in_priority_are_ignored() {
        let selector = MechanismSelector::new(vec!["GSSAPI".to_string(), "PLAIN".to_string()], Vec::new());
        assert_eq!(selector.enabled().collect::<Vec<_>>(), vec!["PLAIN"]);
    }

    #[test]
    fn test_plain_exchange_lifecycle() {
        let selector = MechanismSelector::default();
        let mut exchange = selector.start(&offered(&["PLAIN"]), &credentials()).unwrap();
        let initial = exchange.start().unwrap().unwrap();
        assert_eq!(initial, b"\0juliet\0r0m30myr0m30");
        exchange.success(b"").unwrap();
        assert_eq!(exchange.outcome(), &ExchangeOutcome::Succeeded);
        assert_eq!(exchange.transcript().len(), 1);

        // A finished exchange cannot be driven further.
        assert_eq!(exchange.challenge(b"x"), Err(SaslError::UnexpectedStep("challenge")));
    }

    #[test]
    fn test_failure_is_recorded() {
        let mut exchange = MechanismSelector::default()
            .start(&offered(&["SCRAM-SHA-1"]), &credentials())
            .unwrap();
        exchange.start().unwrap();
        let err = exchange.failure("not-authorized", Some("bad password"));
        assert!(matches!(err, SaslError::Failure { ref condition, .. } if condition == "not-authorized"));
        assert_eq!(exchange.outcome(), &ExchangeOutcome::Failed(err));
    }

    #[test]
    fn test_each_attempt_gets_a_fresh_transcript() {
        let selector = MechanismSelector::default();
        let mut first = selector.start(&offered(&["SCRAM-SHA-1"]), &credentials()).unwrap();
        let a = first.start().unwrap().unwrap();
        let mut second = selector.start(&offered(&["SCRAM-SHA-1"]), &credentials()).unwrap();
        assert!(second.transcript().is_empty());
        let b = second.start().unwrap().unwrap();
        // Fresh client nonce per exchange.
        assert_ne!(a, b);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let rendered = format!("{:?}", credentials());
        assert!(!rendered.contains("r0m30myr0m30"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
