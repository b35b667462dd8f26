//! Identity collaborator contract and the Postgres ticket verifier.
//!
//! ARCHITECTURE
//! ============
//! The engine never authenticates users itself — an upstream auth flow
//! issues short-lived one-time tickets, and the gateway exchanges the ticket
//! for a verified identity before the websocket upgrade.
//!
//! TRADE-OFFS
//! ==========
//! Ticket consumption is destructive (`DELETE ... RETURNING`) to guarantee
//! single use; this favors replay safety over reconnect convenience.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::frame::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("identity backend: {0}")]
    Backend(String),
}

impl ErrorCode for IdentityError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "E_UNAUTHENTICATED",
            Self::Backend(_) => "E_IDENTITY_BACKEND",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Opaque verified identity handed to the gateway by the collaborator.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub user_id: Uuid,
    pub name: String,
}

/// External collaborator boundary: exchange a credential for an identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify a credential. Fails with `Unauthenticated` when the credential
    /// is unknown, expired, or already consumed.
    async fn verify(&self, credential: &str) -> Result<VerifiedIdentity, IdentityError>;
}

/// Verifier backed by the `ws_tickets` table.
pub struct PgTicketVerifier {
    pool: PgPool,
}

impl PgTicketVerifier {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityVerifier for PgTicketVerifier {
    async fn verify(&self, credential: &str) -> Result<VerifiedIdentity, IdentityError> {
        let row = sqlx::query(
            "DELETE FROM ws_tickets WHERE ticket = $1 AND expires_at > now() RETURNING user_id, user_name",
        )
        .bind(credential)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IdentityError::Backend(e.to_string()))?;

        let Some(row) = row else {
            return Err(IdentityError::Unauthenticated);
        };
        Ok(VerifiedIdentity { user_id: row.get("user_id"), name: row.get("user_name") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_helpers::AllowAll;

    #[tokio::test]
    async fn allow_all_rejects_empty_credential() {
        let verifier = AllowAll;
        let result = verifier.verify("").await;
        assert!(matches!(result.unwrap_err(), IdentityError::Unauthenticated));
    }

    #[tokio::test]
    async fn allow_all_accepts_any_ticket() {
        let verifier = AllowAll;
        let identity = verifier.verify("some-ticket").await.unwrap();
        assert_eq!(identity.name, "tester");
    }

    #[test]
    fn error_codes_are_grepable() {
        assert_eq!(IdentityError::Unauthenticated.error_code(), "E_UNAUTHENTICATED");
        assert!(!IdentityError::Unauthenticated.retryable());
        assert!(IdentityError::Backend("down".into()).retryable());
    }
}
