//! PLAIN (RFC 4616) and ANONYMOUS (RFC 4505).

use super::{Credentials, Mechanism};
use crate::error::SaslError;

pub struct Plain {
    authzid: Option<String>,
    username: String,
    password: String,
}

impl Plain {
    pub fn new(credentials: &Credentials) -> Self {
        Self {
            authzid: credentials.authzid.clone(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError> {
        let mut message = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        if let Some(authzid) = &self.authzid {
            message.extend_from_slice(authzid.as_bytes());
        }
        message.push(0);
        message.extend_from_slice(self.username.as_bytes());
        message.push(0);
        message.extend_from_slice(self.password.as_bytes());
        Ok(Some(message))
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        Err(SaslError::UnexpectedStep("challenge"))
    }

    fn finish(&mut self, _additional: &[u8]) -> Result<(), SaslError> {
        Ok(())
    }
}

pub struct Anonymous;

impl Mechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError> {
        Ok(Some(Vec::new()))
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        Err(SaslError::UnexpectedStep("challenge"))
    }

    fn finish(&mut self, _additional: &[u8]) -> Result<(), SaslError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_with_authzid() {
        let mut plain = Plain::new(&Credentials {
            username: "admin".to_string(),
            password: "secret".to_string(),
            authzid: Some("juliet@capulet.lit".to_string()),
            domain: "capulet.lit".to_string(),
        });
        assert_eq!(
            plain.initial_response().unwrap().unwrap(),
            b"juliet@capulet.lit\0admin\0secret"
        );
    }

    #[test]
    fn test_plain_rejects_challenge() {
        let mut plain = Plain::new(&Credentials {
            username: "u".to_string(),
            password: "p".to_string(),
            authzid: None,
            domain: "d".to_string(),
        });
        assert!(plain.respond(b"anything").is_err());
    }

    #[test]
    fn test_anonymous_sends_empty_response() {
        assert_eq!(Anonymous.initial_response().unwrap(), Some(Vec::new()));
    }
}
