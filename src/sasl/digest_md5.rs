//! DIGEST-MD5 (RFC 2831), `qop=auth` only.
//!
//! Historic, but still the strongest mechanism some deployments offer. The
//! server proves knowledge of the password with `rspauth`, which is checked
//! before success is accepted.

use md5::{Digest, Md5};
use rand::RngCore;
use tracing::debug;

use super::{constant_time_eq, Credentials, Mechanism};
use crate::error::SaslError;

const SERVICE: &str = "xmpp";
const NONCE_COUNT: &str = "00000001";

enum State {
    Initial,
    AwaitingRspauth { expected: String },
    Verified,
}

pub struct DigestMd5 {
    username: String,
    password: String,
    authzid: Option<String>,
    host: String,
    service: &'static str,
    cnonce: String,
    state: State,
}

impl DigestMd5 {
    pub fn new(credentials: &Credentials) -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::with_cnonce(credentials, SERVICE, &to_hex(&bytes))
    }

    pub(crate) fn with_cnonce(credentials: &Credentials, service: &'static str, cnonce: &str) -> Self {
        Self {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            authzid: credentials.authzid.clone(),
            host: credentials.domain.clone(),
            service,
            cnonce: cnonce.to_string(),
            state: State::Initial,
        }
    }

    fn digest_uri(&self) -> String {
        format!("{}/{}", self.service, self.host)
    }

    /// `HEX(KD(HEX(H(A1)), nonce:nc:cnonce:qop:HEX(H(A2))))` with the given A2 prefix.
    fn compute(&self, realm: &str, nonce: &str, a2_prefix: &str) -> String {
        let secret = Md5::digest(format!("{}:{}:{}", self.username, realm, self.password).as_bytes());
        let mut a1 = secret.to_vec();
        a1.extend_from_slice(format!(":{}:{}", nonce, self.cnonce).as_bytes());
        if let Some(authzid) = &self.authzid {
            a1.extend_from_slice(format!(":{}", authzid).as_bytes());
        }
        let a2 = format!("{}:{}", a2_prefix, self.digest_uri());
        let kd = format!(
            "{}:{}:{}:{}:auth:{}",
            to_hex(&Md5::digest(&a1)),
            nonce,
            NONCE_COUNT,
            self.cnonce,
            to_hex(&Md5::digest(a2.as_bytes()))
        );
        to_hex(&Md5::digest(kd.as_bytes()))
    }

    fn verify_rspauth(&mut self, message: &[u8]) -> Result<(), SaslError> {
        let State::AwaitingRspauth { expected } = &self.state else {
            return Err(SaslError::UnexpectedStep("rspauth"));
        };
        let directives = parse_directives(message)?;
        let rspauth = directive(&directives, "rspauth").ok_or(SaslError::ServerVerificationFailed)?;
        if !constant_time_eq(rspauth.as_bytes(), expected.as_bytes()) {
            return Err(SaslError::ServerVerificationFailed);
        }
        self.state = State::Verified;
        Ok(())
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError> {
        Ok(None)
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        match self.state {
            State::Initial => {}
            // Second challenge carries rspauth; the reply to it is empty.
            State::AwaitingRspauth { .. } => {
                self.verify_rspauth(challenge)?;
                return Ok(Vec::new());
            }
            State::Verified => return Err(SaslError::UnexpectedStep("challenge")),
        }

        let directives = parse_directives(challenge)?;
        let nonce = directive(&directives, "nonce")
            .ok_or_else(|| SaslError::MalformedChallenge("missing nonce".to_string()))?
            .to_string();
        if let Some(qop) = directive(&directives, "qop") {
            if !qop.split(',').any(|q| q.trim() == "auth") {
                return Err(SaslError::MalformedChallenge(format!("unsupported qop: {}", qop)));
            }
        }
        let realm = directive(&directives, "realm").unwrap_or(&self.host).to_string();
        let utf8 = directive(&directives, "charset") == Some("utf-8");

        let response = self.compute(&realm, &nonce, "AUTHENTICATE");
        let expected = self.compute(&realm, &nonce, "");

        let mut out = String::new();
        if utf8 {
            out.push_str("charset=utf-8,");
        }
        out.push_str(&format!(
            "username={},realm={},nonce={},nc={},cnonce={},digest-uri={},response={},qop=auth",
            quote(&self.username),
            quote(&realm),
            quote(&nonce),
            NONCE_COUNT,
            quote(&self.cnonce),
            quote(&self.digest_uri()),
            response
        ));
        if let Some(authzid) = &self.authzid {
            out.push_str(&format!(",authzid={}", quote(authzid)));
        }
        debug!(realm = %realm, "DIGEST-MD5 response computed");
        self.state = State::AwaitingRspauth { expected };
        Ok(out.into_bytes())
    }

    fn finish(&mut self, additional: &[u8]) -> Result<(), SaslError> {
        match self.state {
            State::Verified => Ok(()),
            State::AwaitingRspauth { .. } if !additional.is_empty() => self.verify_rspauth(additional),
            State::AwaitingRspauth { .. } => Err(SaslError::ServerVerificationFailed),
            State::Initial => Err(SaslError::UnexpectedStep("success")),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn directive<'a>(directives: &'a [(String, String)], key: &str) -> Option<&'a str> {
    directives
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Parse `key=value, key="quoted, value"` pairs.
fn parse_directives(message: &[u8]) -> Result<Vec<(String, String)>, SaslError> {
    let text = std::str::from_utf8(message)
        .map_err(|_| SaslError::MalformedChallenge("challenge is not UTF-8".to_string()))?;
    let mut directives = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(SaslError::MalformedChallenge(format!("directive without value: {}", key.trim())));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(SaslError::MalformedChallenge("unterminated quoted string".to_string()));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        directives.push((key.trim().to_string(), value));
    }
    Ok(directives)
}
