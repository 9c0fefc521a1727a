//! Actor authentication (spec §1: "authentication of the actor is
//! externalized" -- this is the default collaborator a standalone
//! deployment wires in). HMAC signature over api_key+timestamp+body,
//! constant-time compared, grounded directly on the teacher's
//! `create_hmac_signature`/`verify_hmac` pair.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use syncular_core::SyncResult;

use crate::database::ServerDatabase;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_WINDOW_SECS: i64 = 300;

pub struct ActorCredentials {
    pub api_key: String,
    pub secret: String,
}

#[derive(Clone)]
pub struct AuthState {
    db: Arc<ServerDatabase>,
}

impl AuthState {
    pub fn new(db: Arc<ServerDatabase>) -> Self {
        Self { db }
    }

    pub fn generate_actor_credentials() -> ActorCredentials {
        let mut rng = rand::thread_rng();
        let api_key_bytes: [u8; 32] = rng.gen();
        let secret_bytes: [u8; 32] = rng.gen();

        ActorCredentials {
            api_key: format!("sya_{}", hex::encode(api_key_bytes)),
            secret: format!("sys_{}", hex::encode(secret_bytes)),
        }
    }

    pub async fn save_credentials(
        &self,
        credentials: &ActorCredentials,
        actor_id: Uuid,
        name: &str,
    ) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO actor_credentials (api_key, secret, actor_id, name) VALUES ($1, $2, $3, $4)",
        )
        .bind(&credentials.api_key)
        .bind(&credentials.secret)
        .bind(actor_id)
        .bind(name)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub fn create_hmac_signature(
        secret: &str,
        timestamp: i64,
        api_key: &str,
        body: &str,
    ) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        let message = format!("{timestamp}.{api_key}.{body}");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a request's HMAC signature and return the authenticated
    /// actor id on success.
    pub async fn verify_hmac(
        &self,
        api_key: &str,
        signature: &str,
        timestamp: i64,
        body: &str,
    ) -> SyncResult<Option<Uuid>> {
        let now = chrono::Utc::now().timestamp();
        if (now - timestamp).abs() > SIGNATURE_WINDOW_SECS {
            tracing::warn!("HMAC timestamp outside signature window");
            return Ok(None);
        }

        if !api_key.starts_with("sya_") {
            tracing::warn!("invalid api key format");
            return Ok(None);
        }

        let row: Option<(String, Uuid)> = sqlx::query_as(
            "SELECT secret, actor_id FROM actor_credentials WHERE api_key = $1 AND is_active = true",
        )
        .bind(api_key)
        .fetch_optional(&self.db.pool)
        .await?;

        let Some((secret, actor_id)) = row else {
            tracing::warn!("api key not found");
            return Ok(None);
        };

        let expected = Self::create_hmac_signature(&secret, timestamp, api_key, body);
        if !bool::from(signature.as_bytes().ct_eq(expected.as_bytes())) {
            tracing::warn!("HMAC signature mismatch");
            return Ok(None);
        }

        sqlx::query("UPDATE actor_credentials SET last_used_at = NOW() WHERE api_key = $1")
            .bind(api_key)
            .execute(&self.db.pool)
            .await?;

        Ok(Some(actor_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_same_inputs() {
        let a = AuthState::create_hmac_signature("secret", 1000, "sya_x", "{}");
        let b = AuthState::create_hmac_signature("secret", 1000, "sya_x", "{}");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_changes_with_body() {
        let a = AuthState::create_hmac_signature("secret", 1000, "sya_x", "{}");
        let b = AuthState::create_hmac_signature("secret", 1000, "sya_x", "{\"a\":1}");
        assert_ne!(a, b);
    }

    #[test]
    fn generated_credentials_have_expected_prefixes() {
        let creds = AuthState::generate_actor_credentials();
        assert!(creds.api_key.starts_with("sya_"));
        assert!(creds.secret.starts_with("sys_"));
    }
}
