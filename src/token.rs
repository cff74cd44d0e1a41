//! ==============================================================================
//! token.rs - short-lived signed credentials for the mqtt bridge
//! ==============================================================================
//!
//! the bridge authenticates devices with a jwt in the mqtt password field.
//! claims are `aud` (project id), `iat` and `exp`, signed with the device's
//! private key (RS256 or ES256).
//!
//! the issuer never caches. each mint() is a fresh credential and the session
//! decides when to throw one away.
//!
//! ==============================================================================

use crate::error::SigningError;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum SigningAlgorithm {
    #[default]
    #[serde(rename = "RS256")]
    Rs256,
    #[serde(rename = "ES256")]
    Es256,
}

impl From<SigningAlgorithm> for Algorithm {
    fn from(alg: SigningAlgorithm) -> Self {
        match alg {
            SigningAlgorithm::Rs256 => Algorithm::RS256,
            SigningAlgorithm::Es256 => Algorithm::ES256,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeClaims {
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// An immutable minted credential. Replaced, never mutated.
#[derive(Clone)]
pub struct Credential {
    /// mqtt client id the credential was minted for
    pub subject: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// compact jwt; the signature travels inside it
    pub token: String,
}

impl Credential {
    /// valid only while `now < expires_at`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now >= self.expires_at - margin
    }
}

// keep the token itself out of logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &self.subject)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("token", &"<redacted>")
            .finish()
    }
}

pub struct TokenIssuer {
    key: EncodingKey,
    algorithm: SigningAlgorithm,
    audience: String,
    validity: Duration,
}

impl TokenIssuer {
    /// Parse the PEM private key up front so a bad key fails at startup.
    pub fn from_pem(
        pem: &[u8],
        algorithm: SigningAlgorithm,
        audience: &str,
        validity: Duration,
    ) -> Result<Self, SigningError> {
        if validity.num_seconds() < 1 {
            return Err(SigningError::InvalidValidity);
        }

        let key = match algorithm {
            SigningAlgorithm::Rs256 => EncodingKey::from_rsa_pem(pem),
            SigningAlgorithm::Es256 => EncodingKey::from_ec_pem(pem),
        }
        .map_err(|e| SigningError::MalformedKey(e.to_string()))?;

        Ok(Self {
            key,
            algorithm,
            audience: audience.to_string(),
            validity,
        })
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Mint a fresh credential for `subject`, issued at `now`.
    pub fn mint(&self, subject: &str, now: DateTime<Utc>) -> Result<Credential, SigningError> {
        let expires_at = now + self.validity;
        let claims = BridgeClaims {
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(self.algorithm.into()), &claims, &self.key)
            .map_err(|e| SigningError::Sign(e.to_string()))?;

        Ok(Credential {
            subject: subject.to_string(),
            issued_at: now,
            expires_at,
            token,
        })
    }
}
