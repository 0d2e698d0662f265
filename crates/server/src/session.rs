use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use homeward_core::Role;
use homeward_crypto::{
    generate_signing_key, sign_message, verify_signature, verifying_key_from,
    verifying_key_from_base64, Signature, SigningKey, VerifyingKey,
};
use serde::{Deserialize, Serialize};

use crate::{
    config::SessionConfig,
    identity::{CredentialVerifier, VerifiedClaims, VerifyError},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Mints session tokens of the form `base64url(claims).base64url(signature)`.
#[derive(Clone)]
pub struct SessionSigner {
    signing_key: SigningKey,
    ttl: Duration,
}

impl SessionSigner {
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let ttl = Duration::seconds(config.token_ttl_secs as i64);
        match config.signing_key.as_deref() {
            Some(raw) => {
                let decoded = URL_SAFE_NO_PAD.decode(raw.trim()).with_context(|| {
                    "failed to decode session signing key from base64 (URL-safe)"
                })?;
                let bytes: [u8; 32] = decoded
                    .try_into()
                    .map_err(|_| anyhow!("session signing key must be 32 bytes"))?;
                Ok(Self {
                    signing_key: SigningKey::from_bytes(&bytes),
                    ttl,
                })
            }
            None => Ok(Self {
                signing_key: generate_signing_key(),
                ttl,
            }),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        verifying_key_from(&self.signing_key)
    }

    pub fn verifying_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key().as_bytes())
    }

    pub fn issue(&self, subject: &str, role: Role) -> Result<String> {
        let issued_at = Utc::now();
        self.sign(&SessionClaims {
            sub: subject.to_string(),
            role,
            issued_at,
            expires_at: issued_at + self.ttl,
        })
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String> {
        let payload = serde_json::to_vec(claims)?;
        let signature = sign_message(&self.signing_key, &payload);

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// Checks session tokens against the active key and any rotation fallbacks.
#[derive(Clone)]
pub struct SessionVerifier {
    keys: Vec<VerifyingKey>,
}

impl SessionVerifier {
    pub fn new(active: VerifyingKey, fallbacks: Vec<VerifyingKey>) -> Self {
        let mut keys = Vec::with_capacity(fallbacks.len() + 1);
        keys.push(active);
        keys.extend(fallbacks);
        Self { keys }
    }

    pub fn from_config(signer: &SessionSigner, config: &SessionConfig) -> Result<Self> {
        let fallbacks = config
            .fallback_verifying_keys
            .iter()
            .map(|raw| {
                verifying_key_from_base64(raw).context("invalid session fallback verifying key")
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(signer.verifying_key(), fallbacks))
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn decode(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, VerifyError> {
        let (payload_b64, signature_b64) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| VerifyError::Invalid("token is not two dot-separated parts".into()))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| VerifyError::Invalid("payload is not base64url".into()))?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| VerifyError::Invalid("signature is not base64url".into()))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| VerifyError::Invalid("signature has the wrong length".into()))?;

        if !self
            .keys
            .iter()
            .any(|key| verify_signature(key, &payload, &signature).is_ok())
        {
            return Err(VerifyError::Invalid("signature mismatch".into()));
        }

        let claims: SessionClaims = serde_json::from_slice(&payload)
            .map_err(|err| VerifyError::Invalid(format!("claims are malformed: {err}")))?;
        if claims.expires_at <= now {
            return Err(VerifyError::Expired);
        }
        Ok(claims)
    }
}

#[async_trait]
impl CredentialVerifier for SessionVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedClaims, VerifyError> {
        let claims = self.decode(token, Utc::now())?;
        Ok(VerifiedClaims {
            subject: claims.sub,
            role: claims.role,
            expires_at: claims.expires_at,
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use uuid::Uuid;

    pub struct SessionTestHarness {
        pub signer: SessionSigner,
        pub verifier: SessionVerifier,
    }

    impl SessionTestHarness {
        pub fn new() -> Self {
            let config = SessionConfig::default();
            let signer = SessionSigner::from_config(&config).expect("signer");
            let verifier = SessionVerifier::from_config(&signer, &config).expect("verifier");
            Self { signer, verifier }
        }

        pub fn agent_token(&self, agent_id: Uuid) -> String {
            self.signer
                .issue(&agent_id.to_string(), Role::Agent)
                .expect("token")
        }
    }

    #[tokio::test]
    async fn issued_token_verifies() {
        let harness = SessionTestHarness::new();
        let agent_id = Uuid::new_v4();
        let token = harness.agent_token(agent_id);

        let claims = harness.verifier.verify(&token).await.expect("valid token");
        assert_eq!(claims.subject, agent_id.to_string());
        assert_eq!(claims.role, Role::Agent);
    }

    #[test]
    fn expired_token_is_rejected() {
        let harness = SessionTestHarness::new();
        let issued_at = Utc::now() - Duration::hours(2);
        let token = harness
            .signer
            .sign(&SessionClaims {
                sub: "someone".into(),
                role: Role::Agent,
                issued_at,
                expires_at: issued_at + Duration::hours(1),
            })
            .unwrap();

        let err = harness.verifier.decode(&token, Utc::now()).unwrap_err();
        assert!(matches!(err, VerifyError::Expired));
    }

    #[test]
    fn token_from_unknown_key_is_invalid() {
        let harness = SessionTestHarness::new();
        let stranger = SessionSigner::from_config(&SessionConfig::default()).unwrap();
        let token = stranger.issue("intruder", Role::Agent).unwrap();

        let err = harness.verifier.decode(&token, Utc::now()).unwrap_err();
        assert!(matches!(err, VerifyError::Invalid(_)));
        assert!(matches!(
            harness.verifier.decode("garbage", Utc::now()),
            Err(VerifyError::Invalid(_))
        ));
    }

    #[test]
    fn rotated_key_is_still_honoured() {
        let previous = SessionSigner::from_config(&SessionConfig::default()).unwrap();
        let config = SessionConfig {
            fallback_verifying_keys: vec![previous.verifying_key_base64()],
            ..SessionConfig::default()
        };
        let current = SessionSigner::from_config(&config).unwrap();
        let verifier = SessionVerifier::from_config(&current, &config).unwrap();
        assert_eq!(verifier.key_count(), 2);

        let token = previous.issue("veteran", Role::Agent).unwrap();
        let claims = verifier.decode(&token, Utc::now()).expect("fallback key accepted");
        assert_eq!(claims.sub, "veteran");
    }
}
