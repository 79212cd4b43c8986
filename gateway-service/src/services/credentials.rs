//! Signed access/refresh credentials.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::models::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Access,
    Refresh,
}

impl CredentialType {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialType::Access => "access",
            CredentialType::Refresh => "refresh",
        }
    }
}

/// Claim set carried by every credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Subject identity, absent for the shared password login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    /// Makes every issued credential distinct, even within one second
    pub jti: String,
}

impl Claims {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp <= now.timestamp()
    }

    /// Credentials minted without a tier predate tiering and are unrestricted.
    pub fn tier(&self) -> Tier {
        self.tier.unwrap_or(Tier::Full)
    }
}

#[derive(Debug, Clone)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Signing secret not configured")]
    NotConfigured,

    #[error("Failed to encode credential: {0}")]
    Encoding(String),

    #[error("Invalid or expired refresh credential")]
    Rejected,
}

#[derive(Clone)]
struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Issues, verifies and rotates HS256 credentials.
#[derive(Clone)]
pub struct CredentialManager {
    keys: Option<SigningKeys>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl CredentialManager {
    pub fn new(config: &AuthConfig) -> Self {
        let keys = config
            .signing_secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .map(|secret| SigningKeys {
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: DecodingKey::from_secret(secret.as_bytes()),
            });

        if keys.is_some() {
            tracing::info!("Credential manager initialized with HS256 secret");
        }

        Self {
            keys,
            access_ttl: Duration::seconds(config.access_ttl_seconds),
            refresh_ttl: Duration::seconds(config.refresh_ttl_seconds),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.keys.is_some()
    }

    pub fn ttl(&self, credential_type: CredentialType) -> Duration {
        match credential_type {
            CredentialType::Access => self.access_ttl,
            CredentialType::Refresh => self.refresh_ttl,
        }
    }

    pub fn issue(
        &self,
        credential_type: CredentialType,
        identity: Option<&str>,
        tier: Option<Tier>,
    ) -> Result<String, CredentialError> {
        self.issue_at(credential_type, identity, tier, Utc::now())
    }

    /// Issue a credential as if minted at `issued_at`.
    pub fn issue_at(
        &self,
        credential_type: CredentialType,
        identity: Option<&str>,
        tier: Option<Tier>,
        issued_at: DateTime<Utc>,
    ) -> Result<String, CredentialError> {
        let keys = self.keys.as_ref().ok_or(CredentialError::NotConfigured)?;

        let claims = Claims {
            credential_type,
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl(credential_type)).timestamp(),
            sub: identity.map(str::to_string),
            tier,
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| CredentialError::Encoding(e.to_string()))
    }

    /// Issue a fresh access/refresh pair bound to the same identity and tier.
    pub fn issue_pair(
        &self,
        identity: Option<&str>,
        tier: Option<Tier>,
    ) -> Result<CredentialPair, CredentialError> {
        Ok(CredentialPair {
            access: self.issue(CredentialType::Access, identity, tier)?,
            refresh: self.issue(CredentialType::Refresh, identity, tier)?,
        })
    }

    /// True only for an unexpired, correctly signed credential of `expected` type.
    pub fn verify(&self, token: &str, expected: CredentialType) -> bool {
        let Some(keys) = self.keys.as_ref() else {
            return false;
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        match decode::<Claims>(token, &keys.decoding, &validation) {
            Ok(data) if data.claims.credential_type == expected => true,
            Ok(data) => {
                tracing::debug!(
                    expected = expected.as_str(),
                    actual = data.claims.credential_type.as_str(),
                    "Credential type mismatch"
                );
                false
            }
            Err(e) => {
                tracing::debug!(error = %e, "Credential rejected");
                false
            }
        }
    }

    /// Claims of a correctly signed credential, expired or not.
    pub fn decode(&self, token: &str) -> Option<Claims> {
        let keys = self.keys.as_ref()?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;

        decode::<Claims>(token, &keys.decoding, &validation)
            .map(|data| data.claims)
            .ok()
    }

    /// Exchange a valid refresh credential for a brand-new pair.
    pub fn rotate(&self, refresh_token: &str) -> Result<CredentialPair, CredentialError> {
        if !self.is_configured() {
            return Err(CredentialError::NotConfigured);
        }
        if !self.verify(refresh_token, CredentialType::Refresh) {
            return Err(CredentialError::Rejected);
        }
        let claims = self.decode(refresh_token).ok_or(CredentialError::Rejected)?;
        self.issue_pair(claims.sub.as_deref(), claims.tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(secret: Option<&str>) -> AuthConfig {
        AuthConfig {
            signing_secret: secret.map(str::to_string),
            password_hash: None,
            access_ttl_seconds: 15 * 60,
            refresh_ttl_seconds: 7 * 24 * 3600,
            auth_required: true,
            cookie_secure: true,
        }
    }

    fn manager() -> CredentialManager {
        CredentialManager::new(&config(Some("test-signing-secret")))
    }

    #[test]
    fn issued_credential_verifies_for_its_own_type() {
        let credentials = manager();
        let access = credentials
            .issue(CredentialType::Access, Some("a@b.edu"), Some(Tier::Academic))
            .unwrap();
        let refresh = credentials
            .issue(CredentialType::Refresh, None, Some(Tier::Full))
            .unwrap();

        assert!(credentials.verify(&access, CredentialType::Access));
        assert!(credentials.verify(&refresh, CredentialType::Refresh));
    }

    #[test]
    fn type_confusion_is_rejected_both_ways() {
        let credentials = manager();
        let access = credentials.issue(CredentialType::Access, None, None).unwrap();
        let refresh = credentials.issue(CredentialType::Refresh, None, None).unwrap();

        assert!(!credentials.verify(&access, CredentialType::Refresh));
        assert!(!credentials.verify(&refresh, CredentialType::Access));
    }

    #[test]
    fn access_signed_an_hour_ago_with_fifteen_minute_ttl_is_rejected() {
        let credentials = manager();
        let token = credentials
            .issue_at(
                CredentialType::Access,
                Some("a@b.edu"),
                Some(Tier::Academic),
                Utc::now() - Duration::hours(1),
            )
            .unwrap();

        assert!(!credentials.verify(&token, CredentialType::Access));

        // The signature is still good, so trusted callers can read the claims.
        let claims = credentials.decode(&token).expect("signature is valid");
        assert_eq!(claims.sub.as_deref(), Some("a@b.edu"));
        assert!(claims.is_expired_at(Utc::now()));
    }

    #[test]
    fn foreign_signature_and_garbage_are_rejected() {
        let other = CredentialManager::new(&config(Some("another-secret")));
        let token = other.issue(CredentialType::Access, None, None).unwrap();

        let credentials = manager();
        assert!(!credentials.verify(&token, CredentialType::Access));
        assert!(credentials.decode(&token).is_none());

        assert!(!credentials.verify("not-a-token", CredentialType::Access));
        assert!(credentials.decode("a.b.c").is_none());
    }

    #[test]
    fn decode_returns_full_claim_set() {
        let credentials = manager();
        let token = credentials
            .issue(CredentialType::Access, Some("a@b.edu"), Some(Tier::Academic))
            .unwrap();

        let claims = credentials.decode(&token).unwrap();
        assert_eq!(claims.credential_type, CredentialType::Access);
        assert_eq!(claims.tier(), Tier::Academic);
        assert_eq!(claims.exp - claims.iat, 15 * 60);
    }

    #[test]
    fn unconfigured_secret_fails_issue_and_verifies_nothing() {
        let credentials = CredentialManager::new(&config(None));
        assert!(matches!(
            credentials.issue(CredentialType::Access, None, None),
            Err(CredentialError::NotConfigured)
        ));

        let token = manager().issue(CredentialType::Access, None, None).unwrap();
        assert!(!credentials.verify(&token, CredentialType::Access));
        assert!(credentials.decode(&token).is_none());
    }

    #[test]
    fn rotation_issues_a_brand_new_pair_with_same_binding() {
        let credentials = manager();
        let original = credentials
            .issue_pair(Some("a@b.edu"), Some(Tier::Academic))
            .unwrap();

        let rotated = credentials.rotate(&original.refresh).unwrap();

        assert_ne!(rotated.access, original.access);
        assert_ne!(rotated.refresh, original.refresh);
        let claims = credentials.decode(&rotated.access).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("a@b.edu"));
        assert_eq!(claims.tier, Some(Tier::Academic));
    }

    #[test]
    fn rotation_refuses_an_access_credential() {
        let credentials = manager();
        let pair = credentials.issue_pair(None, Some(Tier::Full)).unwrap();
        assert!(matches!(
            credentials.rotate(&pair.access),
            Err(CredentialError::Rejected)
        ));
    }
}
