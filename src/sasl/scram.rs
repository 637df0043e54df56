//! SCRAM (RFC 5802, RFC 7677) without channel binding.

use std::marker::PhantomData;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tracing::debug;

use super::{Credentials, Mechanism};
use crate::error::SaslError;

/// Hash family a SCRAM variant is built on.
pub trait ScramHash: Send + Sync + 'static {
    const MECHANISM: &'static str;

    fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SaslError>;

    /// Constant-time check of `HMAC(key, data) == expected`.
    fn verify_hmac(key: &[u8], data: &[u8], expected: &[u8]) -> Result<bool, SaslError>;

    fn hash(data: &[u8]) -> Vec<u8>;

    /// `Hi()`, i.e. PBKDF2 with this hash.
    fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>;
}

macro_rules! scram_hash {
    ($name:ident, $digest:ty, $mechanism:literal) => {
        pub struct $name;

        impl ScramHash for $name {
            const MECHANISM: &'static str = $mechanism;

            fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SaslError> {
                let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                    .map_err(|e| SaslError::MalformedChallenge(e.to_string()))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }

            fn verify_hmac(key: &[u8], data: &[u8], expected: &[u8]) -> Result<bool, SaslError> {
                let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                    .map_err(|e| SaslError::MalformedChallenge(e.to_string()))?;
                mac.update(data);
                Ok(mac.verify_slice(expected).is_ok())
            }

            fn hash(data: &[u8]) -> Vec<u8> {
                <$digest as Digest>::digest(data).to_vec()
            }

            fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
                let mut out = vec![0u8; <$digest as Digest>::output_size()];
                pbkdf2_hmac::<$digest>(password, salt, iterations, &mut out);
                out
            }
        }
    };
}

scram_hash!(ScramSha1, Sha1, "SCRAM-SHA-1");
scram_hash!(ScramSha256, Sha256, "SCRAM-SHA-256");
scram_hash!(ScramSha512, Sha512, "SCRAM-SHA-512");

/// Upper bound on the server-chosen `i=`. Key derivation runs on the
/// connection task, so an unbounded count would stall it.
pub const MAX_ITERATIONS: u32 = 1_000_000;

enum State {
    Initial,
    ClientFirstSent {
        gs2_header: String,
        client_first_bare: String,
    },
    ClientFinalSent {
        server_key: Vec<u8>,
        auth_message: String,
    },
    Verified,
    Failed,
}

pub struct Scram<H: ScramHash> {
    username: String,
    password: String,
    authzid: Option<String>,
    client_nonce: String,
    state: State,
    _hash: PhantomData<H>,
}

impl<H: ScramHash> Scram<H> {
    pub fn new(credentials: &Credentials) -> Self {
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::with_nonce(credentials, &BASE64.encode(bytes))
    }

    pub(crate) fn with_nonce(credentials: &Credentials, client_nonce: &str) -> Self {
        Self {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            authzid: credentials.authzid.clone(),
            client_nonce: client_nonce.to_string(),
            state: State::Initial,
            _hash: PhantomData,
        }
    }

    fn client_final(
        &self,
        server_first: &str,
        gs2_header: &str,
        client_first_bare: &str,
    ) -> Result<(String, Vec<u8>, String), SaslError> {
        let attrs = parse_attributes(server_first)?;
        if let Some(error) = attr(&attrs, 'e') {
            return Err(SaslError::ServerError(error.to_string()));
        }
        if attr(&attrs, 'm').is_some() {
            return Err(SaslError::MalformedChallenge("unsupported mandatory extension".to_string()));
        }
        let nonce = attr(&attrs, 'r').ok_or_else(|| missing("r"))?;
        let salt = attr(&attrs, 's').ok_or_else(|| missing("s"))?;
        let iterations = attr(&attrs, 'i').ok_or_else(|| missing("i"))?;

        if nonce.len() <= self.client_nonce.len() || !nonce.starts_with(&self.client_nonce) {
            return Err(SaslError::NonceMismatch);
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|e| SaslError::MalformedChallenge(format!("salt: {}", e)))?;
        let iterations: u32 = iterations
            .parse()
            .ok()
            .filter(|&i| i > 0 && i <= MAX_ITERATIONS)
            .ok_or_else(|| SaslError::MalformedChallenge(format!("iteration count: {}", iterations)))?;

        let salted_password = H::hi(self.password.as_bytes(), &salt, iterations);
        let client_key = H::hmac(&salted_password, b"Client Key")?;
        let stored_key = H::hash(&client_key);
        let server_key = H::hmac(&salted_password, b"Server Key")?;

        let without_proof = format!("c={},r={}", BASE64.encode(gs2_header), nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let client_signature = H::hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(&client_signature)
            .map(|(k, s)| k ^ s)
            .collect();

        debug!(mechanism = H::MECHANISM, iterations, "SCRAM client proof computed");
        Ok((
            format!("{},p={}", without_proof, BASE64.encode(proof)),
            server_key,
            auth_message,
        ))
    }

    fn verify_server_final(&mut self, message: &[u8]) -> Result<(), SaslError> {
        let State::ClientFinalSent {
            server_key,
            auth_message,
        } = std::mem::replace(&mut self.state, State::Failed)
        else {
            return Err(SaslError::UnexpectedStep("server-final-message"));
        };
        let message = std::str::from_utf8(message)
            .map_err(|_| SaslError::MalformedChallenge("server-final-message is not UTF-8".to_string()))?;
        let attrs = parse_attributes(message)?;
        if let Some(error) = attr(&attrs, 'e') {
            return Err(SaslError::ServerError(error.to_string()));
        }
        let signature = attr(&attrs, 'v').ok_or(SaslError::ServerVerificationFailed)?;
        let signature = BASE64
            .decode(signature)
            .map_err(|_| SaslError::ServerVerificationFailed)?;
        if !H::verify_hmac(&server_key, auth_message.as_bytes(), &signature)? {
            return Err(SaslError::ServerVerificationFailed);
        }
        self.state = State::Verified;
        Ok(())
    }
}

impl<H: ScramHash> Mechanism for Scram<H> {
    fn name(&self) -> &'static str {
        H::MECHANISM
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError> {
        if !matches!(self.state, State::Initial) {
            return Err(SaslError::UnexpectedStep("auth"));
        }
        let gs2_header = match &self.authzid {
            Some(authzid) => format!("n,a={},", escape_name(authzid)),
            None => "n,,".to_string(),
        };
        let client_first_bare = format!("n={},r={}", escape_name(&self.username), self.client_nonce);
        let message = format!("{}{}", gs2_header, client_first_bare);
        self.state = State::ClientFirstSent {
            gs2_header,
            client_first_bare,
        };
        Ok(Some(message.into_bytes()))
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        match std::mem::replace(&mut self.state, State::Failed) {
            State::ClientFirstSent {
                gs2_header,
                client_first_bare,
            } => {
                let server_first = std::str::from_utf8(challenge)
                    .map_err(|_| SaslError::MalformedChallenge("server-first-message is not UTF-8".to_string()))?;
                let (client_final, server_key, auth_message) =
                    self.client_final(server_first, &gs2_header, &client_first_bare)?;
                self.state = State::ClientFinalSent {
                    server_key,
                    auth_message,
                };
                Ok(client_final.into_bytes())
            }
            // Some servers send the verifier as a challenge and an empty success.
            state @ State::ClientFinalSent { .. } => {
                self.state = state;
                self.verify_server_final(challenge)?;
                Ok(Vec::new())
            }
            _ => Err(SaslError::UnexpectedStep("challenge")),
        }
    }

    fn finish(&mut self, additional: &[u8]) -> Result<(), SaslError> {
        match self.state {
            State::Verified => Ok(()),
            State::ClientFinalSent { .. } if additional.is_empty() => {
                self.state = State::Failed;
                Err(SaslError::ServerVerificationFailed)
            }
            State::ClientFinalSent { .. } => self.verify_server_final(additional),
            _ => Err(SaslError::UnexpectedStep("success")),
        }
    }
}

fn missing(name: &str) -> SaslError {
    SaslError::MalformedChallenge(format!("missing attribute '{}'", name))
}

fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn parse_attributes(message: &str) -> Result<Vec<(char, &str)>, SaslError> {
    message
        .split(',')
        .map(|part| {
            let mut chars = part.chars();
            match (chars.next(), chars.next()) {
                (Some(key), Some('=')) if key.is_ascii_alphabetic() => Ok((key, &part[2..])),
                _ => Err(SaslError::MalformedChallenge(format!("bad attribute: {}", part))),
            }
        })
        .collect()
}

fn attr<'a>(attrs: &[(char, &'a str)], key: char) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_pencil() -> Credentials {
        Credentials {
            username: "user".to_string(),
            password: "pencil".to_string(),
            authzid: None,
            domain: "example.com".to_string(),
        }
    }

    #[test]
    fn test_scram_sha1_reference_vector() {
        let mut scram = Scram::<ScramSha1>::with_nonce(&user_pencil(), "fyko+d2lbbFgONRv9qkxdawL");
        assert_eq!(
            scram.initial_response().unwrap().unwrap(),
            b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL"
        );

        let client_final = scram
            .respond(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap();
        assert_eq!(
            String::from_utf8(client_final).unwrap(),
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );

        scram.finish(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=").unwrap();
    }

    #[test]
    fn test_scram_sha256_reference_vector() {
        let mut scram = Scram::<ScramSha256>::with_nonce(&user_pencil(), "rOprNGfwEbeRWgbNEkqO");
        scram.initial_response().unwrap();
        let client_final = scram
            .respond(b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap();
        assert_eq!(
            String::from_utf8(client_final).unwrap(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        // Verifier delivered as a challenge, followed by an empty success.
        assert_eq!(
            scram.respond(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=").unwrap(),
            b""
        );
        scram.finish(b"").unwrap();
    }

    fn after_client_final() -> Scram<ScramSha1> {
        let mut scram = Scram::<ScramSha1>::with_nonce(&user_pencil(), "fyko+d2lbbFgONRv9qkxdawL");
        scram.initial_response().unwrap();
        scram
            .respond(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap();
        scram
    }

    #[test]
    fn test_tampered_server_signature_fails() {
        let mut scram = after_client_final();
        assert_eq!(
            scram.finish(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA="),
            Err(SaslError::ServerVerificationFailed)
        );
    }

    #[test]
    fn test_success_without_verifier_fails_closed() {
        let mut scram = after_client_final();
        assert_eq!(scram.finish(b""), Err(SaslError::ServerVerificationFailed));
    }

    #[test]
    fn test_server_error_attribute() {
        let mut scram = after_client_final();
        assert_eq!(
            scram.finish(b"e=invalid-proof"),
            Err(SaslError::ServerError("invalid-proof".to_string()))
        );
    }

    #[test]
    fn test_nonce_must_extend_client_nonce() {
        let mut scram = Scram::<ScramSha1>::with_nonce(&user_pencil(), "abc");
        scram.initial_response().unwrap();
        assert_eq!(scram.respond(b"r=xyz123,s=QSXCR+Q6sek8bf92,i=4096"), Err(SaslError::NonceMismatch));

        let mut scram = Scram::<ScramSha1>::with_nonce(&user_pencil(), "abc");
        scram.initial_response().unwrap();
        assert_eq!(scram.respond(b"r=abc,s=QSXCR+Q6sek8bf92,i=4096"), Err(SaslError::NonceMismatch));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let mut scram = Scram::<ScramSha1>::with_nonce(&user_pencil(), "abc");
        scram.initial_response().unwrap();
        assert!(matches!(
            scram.respond(b"r=abcdef,s=QSXCR+Q6sek8bf92,i=0"),
            Err(SaslError::MalformedChallenge(_))
        ));
    }

    #[test]
    fn test_excessive_iteration_count_rejected() {
        for count in ["1000001", "4294967295"] {
            let mut scram = Scram::<ScramSha1>::with_nonce(&user_pencil(), "abc");
            scram.initial_response().unwrap();
            let server_first = format!("r=abcdef,s=QSXCR+Q6sek8bf92,i={}", count);
            assert!(matches!(
                scram.respond(server_first.as_bytes()),
                Err(SaslError::MalformedChallenge(_))
            ));
        }
    }

    #[test]
    fn test_username_and_authzid_escaping() {
        let credentials = Credentials {
            username: "a,b=c".to_string(),
            password: "p".to_string(),
            authzid: Some("x=y".to_string()),
            domain: "d".to_string(),
        };
        let mut scram = Scram::<ScramSha256>::with_nonce(&credentials, "n0nce");
        assert_eq!(
            scram.initial_response().unwrap().unwrap(),
            b"n,a=x=3Dy,n=a=2Cb=3Dc,r=n0nce"
        );
    }

    #[test]
    fn test_generated_nonces_differ() {
        let mut a = Scram::<ScramSha512>::new(&user_pencil());
        let mut b = Scram::<ScramSha512>::new(&user_pencil());
        assert_ne!(a.initial_response().unwrap(), b.initial_response().unwrap());
    }
}
