//! Auth Collaborator
//!
//! Opaque bearer tokens resolved against the sessions table. The gateway
//! authenticates long-lived connections through here; the ingress
//! collaborator mints sessions out of band.
//!
//! First contact with a user's balance row grants the configured starter
//! balance, exactly once.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Session, User, UserRole};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("malformed bearer token")]
    MalformedToken,

    #[error("unknown or revoked token")]
    UnknownToken,

    #[error("session expired")]
    SessionExpired,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct AuthService {
    pool: PgPool,
    starter_balance: Decimal,
}

impl AuthService {
    pub fn new(pool: PgPool, starter_balance: Decimal) -> Self {
        Self {
            pool,
            starter_balance,
        }
    }

    /// Resolve an opaque bearer token to its user, funding the balance row
    /// on first contact.
    pub async fn resolve_token(&self, token: &str) -> Result<User, AuthError> {
        let token: Uuid = token.parse().map_err(|_| AuthError::MalformedToken)?;

        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::UnknownToken)?;

        if session.is_expired(Utc::now()) {
            return Err(AuthError::SessionExpired);
        }

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(session.user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::UnknownToken)?;

        self.ensure_user_funded(user.id).await?;
        Ok(user)
    }

    /// Mint a session for a user. Exposed for the ingress collaborator and
    /// for operational tooling.
    pub async fn create_session(
        &self,
        user_id: Uuid,
        ttl_hours: i64,
    ) -> Result<Session, AuthError> {
        let session = Session {
            token: Uuid::new_v4(),
            user_id,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(ttl_hours),
        };
        sqlx::query(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(session.token)
        .bind(session.user_id)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(session)
    }

    /// Create the balance row with the starter grant if the user has none.
    /// The ON CONFLICT guard makes repeat calls no-ops, so the grant can
    /// never double-pay.
    pub async fn ensure_user_funded(&self, user_id: Uuid) -> Result<bool, AuthError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO balances (user_id, available, locked)
            VALUES ($1, $2, 0)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(self.starter_balance)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            tracing::info!(%user_id, starter_balance = %self.starter_balance, "starter balance granted");
        }
        Ok(inserted)
    }

    pub async fn is_admin(&self, user_id: Uuid) -> Result<bool, AuthError> {
        let role: Option<UserRole> = sqlx::query_scalar("SELECT role FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role == Some(UserRole::Admin))
    }
}
