//! Session Authenticator (spec.md §4.1): verifies the token presented at
//! socket handshake and resolves it to a [`UserIdentity`], once per
//! connection.

use crate::errors::{BrokerError, BrokerResult};
use crate::models::UserIdentity;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> BrokerResult<UserIdentity>;
}

/// Calls out to the application tier's identity service, the way
/// `webhooks::deliver_webhooks` calls out over HTTP with a bounded timeout.
pub struct HttpTokenVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenVerifier {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build identity service HTTP client");
        Self { client, base_url }
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> BrokerResult<UserIdentity> {
        let url = format!("{}/verify", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| BrokerError::AuthenticationFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(BrokerError::AuthenticationFailed(format!(
                "identity service returned {}",
                resp.status()
            )));
        }

        resp.json::<UserIdentity>()
            .await
            .map_err(|e| BrokerError::AuthenticationFailed(e.to_string()))
    }
}

/// Local fallback verifier for development and tests: tokens are
/// `<user_id>.<name>.<hex hmac>` signed with a shared secret, the same
/// HMAC-SHA256-over-bytes, hex-encoded construction the teacher uses to
/// sign outbound webhook bodies.
pub struct StaticTokenVerifier {
    secret: String,
}

impl StaticTokenVerifier {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Mint a token for tests and local tooling.
    pub fn sign(secret: &str, user_id: &str, name: &str) -> String {
        let message = format!("{user_id}.{name}");
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(message.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        format!("{message}.{signature}")
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> BrokerResult<UserIdentity> {
        let mut parts = token.splitn(3, '.');
        let (user_id, name, signature) = match (parts.next(), parts.next(), parts.next()) {
            (Some(u), Some(n), Some(s)) => (u, n, s),
            _ => {
                return Err(BrokerError::AuthenticationFailed(
                    "malformed token".to_string(),
                ));
            }
        };

        let message = format!("{user_id}.{name}");
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| BrokerError::InternalFault(e.to_string()))?;
        mac.update(message.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        if expected != signature {
            return Err(BrokerError::AuthenticationFailed(
                "signature mismatch".to_string(),
            ));
        }

        Ok(UserIdentity {
            user_id: user_id.to_string(),
            name: name.to_string(),
            avatar_ref: None,
        })
    }
}

/// Builds the verifier the running broker should use: an HTTP-backed one
/// when an identity service URL is configured, the local HMAC one otherwise.
pub fn build_verifier(config: &crate::config::BrokerConfig) -> Box<dyn TokenVerifier> {
    match &config.identity_service_url {
        Some(url) => Box::new(HttpTokenVerifier::new(url.clone())),
        None => Box::new(StaticTokenVerifier::new(
            config
                .ingress_shared_secret
                .clone()
                .unwrap_or_else(|| "dev-secret".to_string()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_round_trips_a_signed_token() {
        let verifier = StaticTokenVerifier::new("shh".to_string());
        let token = StaticTokenVerifier::sign("shh", "u1", "Ada");
        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.name, "Ada");
    }

    #[tokio::test]
    async fn static_verifier_rejects_tampered_signature() {
        let verifier = StaticTokenVerifier::new("shh".to_string());
        let token = StaticTokenVerifier::sign("other-secret", "u1", "Ada");
        assert!(verifier.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn static_verifier_rejects_malformed_token() {
        let verifier = StaticTokenVerifier::new("shh".to_string());
        assert!(verifier.verify("not-enough-parts").await.is_err());
    }
}
