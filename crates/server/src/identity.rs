use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homeward_core::{Identity, Role, VerifiedSource};
use thiserror::Error;
use uuid::Uuid;

use crate::store::GatewayStore;

/// Claims extracted from a credential that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaims {
    pub subject: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("credential rejected: {0}")]
    Invalid(String),
    #[error("credential expired")]
    Expired,
    #[error("credential verifier unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedClaims, VerifyError>;
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("authentication failed: {0}")]
    VerifierUnavailable(#[source] anyhow::Error),
}

/// What a socket presented when it connected.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub role: Option<Role>,
    pub token: Option<String>,
    pub timeline_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub identity: Identity,
    pub role: Role,
}

/// Turns a handshake into a connection identity.
///
/// Missing or bad credentials degrade to a synthetic or anonymous identity;
/// only an unreachable verifier is an error.
#[derive(Clone)]
pub struct IdentityResolver {
    verifier: Arc<dyn CredentialVerifier>,
    store: Arc<dyn GatewayStore>,
}

impl IdentityResolver {
    pub fn new(verifier: Arc<dyn CredentialVerifier>, store: Arc<dyn GatewayStore>) -> Self {
        Self { verifier, store }
    }

    pub async fn resolve(&self, handshake: &Handshake) -> Result<ResolvedIdentity, IdentityError> {
        match handshake.role {
            Some(Role::Agent) => self.resolve_agent(handshake.token.as_deref()).await,
            Some(Role::Client) => match non_empty(handshake.timeline_id.as_deref()) {
                Some(timeline_id) => Ok(self.resolve_timeline_client(timeline_id).await),
                None => Ok(anonymous(Role::Client)),
            },
            None => Ok(anonymous(Role::Client)),
        }
    }

    async fn resolve_agent(&self, token: Option<&str>) -> Result<ResolvedIdentity, IdentityError> {
        let Some(token) = non_empty(token) else {
            tracing::warn!("agent connected without a credential; using fallback identity");
            return Ok(ResolvedIdentity {
                identity: Identity::agent_fallback(),
                role: Role::Agent,
            });
        };

        let identity = match self.verifier.verify(token).await {
            Ok(claims) if claims.role == Role::Agent => {
                Identity::verified(claims.subject, VerifiedSource::SessionToken)
            }
            Ok(claims) => {
                tracing::warn!(
                    subject = %claims.subject,
                    role = %claims.role,
                    "credential was not issued to an agent; using fallback identity"
                );
                Identity::agent_fallback()
            }
            Err(VerifyError::Unavailable(err)) => {
                return Err(IdentityError::VerifierUnavailable(err));
            }
            Err(err) => {
                tracing::warn!(error = %err, "agent credential failed verification; using fallback identity");
                Identity::agent_fallback()
            }
        };

        Ok(ResolvedIdentity {
            identity,
            role: Role::Agent,
        })
    }

    async fn resolve_timeline_client(&self, timeline_id: &str) -> ResolvedIdentity {
        let linked = match Uuid::parse_str(timeline_id) {
            Ok(id) => match self.store.find_timeline_client(id).await {
                Ok(found) => found,
                Err(err) => {
                    tracing::warn!(error = %err, timeline_id, "timeline client lookup failed");
                    None
                }
            },
            Err(_) => None,
        };

        let identity = match linked {
            Some(record) => {
                Identity::verified(record.client_id.to_string(), VerifiedSource::TimelineLink)
            }
            None => Identity::synthetic_client(timeline_id),
        };

        ResolvedIdentity {
            identity,
            role: Role::Client,
        }
    }
}

fn anonymous(role: Role) -> ResolvedIdentity {
    ResolvedIdentity {
        identity: Identity::anonymous(Utc::now().timestamp_millis(), Uuid::new_v4()),
        role,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{session::tests::SessionTestHarness, store::InMemoryStore};
    use homeward_core::SyntheticSource;

    struct UnreachableVerifier;

    #[async_trait]
    impl CredentialVerifier for UnreachableVerifier {
        async fn verify(&self, _token: &str) -> Result<VerifiedClaims, VerifyError> {
            Err(VerifyError::Unavailable(anyhow::anyhow!("connection refused")))
        }
    }

    fn resolver_with(store: Arc<InMemoryStore>) -> (IdentityResolver, SessionTestHarness) {
        let harness = SessionTestHarness::new();
        let resolver = IdentityResolver::new(Arc::new(harness.verifier.clone()), store);
        (resolver, harness)
    }

    #[tokio::test]
    async fn agent_token_resolves_to_subject() {
        let (resolver, harness) = resolver_with(Arc::new(InMemoryStore::new()));
        let agent_id = Uuid::new_v4();

        let resolved = resolver
            .resolve(&Handshake {
                role: Some(Role::Agent),
                token: Some(harness.agent_token(agent_id)),
                timeline_id: None,
            })
            .await
            .unwrap();

        assert_eq!(resolved.role, Role::Agent);
        assert_eq!(resolved.identity.account_id(), Some(agent_id));
    }

    #[tokio::test]
    async fn bad_agent_token_degrades_to_fallback() {
        let (resolver, _) = resolver_with(Arc::new(InMemoryStore::new()));

        for token in [Some("not-a-token".to_string()), None] {
            let resolved = resolver
                .resolve(&Handshake {
                    role: Some(Role::Agent),
                    token,
                    timeline_id: None,
                })
                .await
                .unwrap();
            assert_eq!(resolved.identity, Identity::agent_fallback());
        }
    }

    #[tokio::test]
    async fn unreachable_verifier_is_an_error() {
        let resolver = IdentityResolver::new(
            Arc::new(UnreachableVerifier),
            Arc::new(InMemoryStore::new()),
        );
        let result = resolver
            .resolve(&Handshake {
                role: Some(Role::Agent),
                token: Some("anything".into()),
                timeline_id: None,
            })
            .await;
        assert!(matches!(result, Err(IdentityError::VerifierUnavailable(_))));
    }

    #[tokio::test]
    async fn linked_timeline_resolves_to_client_record() {
        let store = Arc::new(InMemoryStore::new());
        let client = store.insert_client(None).await;
        let timeline = store.insert_timeline(None, Some(client)).await;
        let (resolver, _) = resolver_with(store);

        let resolved = resolver
            .resolve(&Handshake {
                role: Some(Role::Client),
                token: None,
                timeline_id: Some(timeline.to_string()),
            })
            .await
            .unwrap();

        assert_eq!(
            resolved.identity,
            Identity::verified(client.to_string(), VerifiedSource::TimelineLink)
        );
    }

    #[tokio::test]
    async fn unknown_timeline_yields_the_same_synthetic_identity_each_time() {
        let (resolver, _) = resolver_with(Arc::new(InMemoryStore::new()));
        let handshake = Handshake {
            role: Some(Role::Client),
            token: None,
            timeline_id: Some("shared-link-7".into()),
        };

        let first = resolver.resolve(&handshake).await.unwrap();
        let second = resolver.resolve(&handshake).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.identity.user_id(), "client_shared-link-7");
        assert!(matches!(
            first.identity,
            Identity::Synthetic {
                derived_from: SyntheticSource::Timeline(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_role_or_context_is_anonymous() {
        let (resolver, _) = resolver_with(Arc::new(InMemoryStore::new()));

        for handshake in [
            Handshake::default(),
            Handshake {
                role: Some(Role::Client),
                ..Handshake::default()
            },
        ] {
            let resolved = resolver.resolve(&handshake).await.unwrap();
            assert!(matches!(resolved.identity, Identity::Anonymous { .. }));
            assert!(resolved.identity.user_id().starts_with("anonymous_"));
        }
    }
}
