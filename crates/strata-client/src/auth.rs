//! Credential providers and SASL handshake sequencing.
//!
//! Only the sequencing lives here: the driver iterates the configured
//! mechanism preference list, falls back on NOT_SUPPORTED, and drives the
//! challenge/response loop through a [`SaslClient`]. PLAIN ships in-tree;
//! SCRAM families plug in through [`SaslClientFactory`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, ErrorKind, Result};
use crate::routing::ServiceType;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Supplies credentials at handshake time. Implementations may consult
/// rotating secrets; the driver calls this once per bootstrap or HTTP
/// request.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn credentials(&self, service: ServiceType, endpoint: &str) -> Result<Credentials>;
}

/// Fixed username/password provider.
#[derive(Debug, Clone)]
pub struct PasswordAuthProvider {
    credentials: Credentials,
}

impl PasswordAuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials {
                username: username.into(),
                password: password.into(),
            },
        }
    }
}

#[async_trait]
impl AuthProvider for PasswordAuthProvider {
    async fn credentials(&self, _service: ServiceType, _endpoint: &str) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha1,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn wire_name(self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha1 => "SCRAM-SHA1",
            SaslMechanism::ScramSha256 => "SCRAM-SHA256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA512",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PLAIN" => Some(SaslMechanism::Plain),
            "SCRAM-SHA1" => Some(SaslMechanism::ScramSha1),
            "SCRAM-SHA256" => Some(SaslMechanism::ScramSha256),
            "SCRAM-SHA512" => Some(SaslMechanism::ScramSha512),
            _ => None,
        }
    }
}

/// One in-progress SASL conversation.
pub trait SaslClient: Send {
    fn mechanism(&self) -> SaslMechanism;
    /// Payload for SASL_AUTH.
    fn initial_payload(&mut self) -> Result<Vec<u8>>;
    /// Payload for SASL_STEP given the server challenge; `None` means the
    /// conversation produced nothing further to send.
    fn step(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Builds a [`SaslClient`] for a mechanism, or `None` when unsupported.
pub type SaslClientFactory =
    Arc<dyn Fn(SaslMechanism, &Credentials) -> Option<Box<dyn SaslClient>> + Send + Sync>;

/// PLAIN: authzid NUL authcid NUL passwd.
pub struct PlainSaslClient {
    credentials: Credentials,
}

impl PlainSaslClient {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl SaslClient for PlainSaslClient {
    fn mechanism(&self) -> SaslMechanism {
        SaslMechanism::Plain
    }

    fn initial_payload(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(
            self.credentials.username.len() + self.credentials.password.len() + 2,
        );
        payload.push(0);
        payload.extend_from_slice(self.credentials.username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.credentials.password.as_bytes());
        Ok(payload)
    }

    fn step(&mut self, _challenge: &[u8]) -> Result<Option<Vec<u8>>> {
        Err(Error::new(ErrorKind::Protocol)
            .with_context("server sent a challenge for PLAIN"))
    }
}

/// Default factory: PLAIN only. SCRAM implementations are supplied by the
/// embedding SDK.
pub fn default_sasl_factory() -> SaslClientFactory {
    Arc::new(|mechanism, credentials| match mechanism {
        SaslMechanism::Plain => Some(Box::new(PlainSaslClient::new(credentials.clone()))),
        _ => None,
    })
}

/// Parse a SASL_LIST_MECHS body (space-separated mechanism names).
pub fn parse_mech_list(body: &[u8]) -> Vec<SaslMechanism> {
    String::from_utf8_lossy(body)
        .split_whitespace()
        .filter_map(SaslMechanism::parse)
        .collect()
}
