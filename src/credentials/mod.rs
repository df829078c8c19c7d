//! Provider credential resolution
//!
//! Resolution order per provider:
//! 1. Environment variable (`NOVITA_API_KEY`, ...)
//! 2. Persisted `provider_credentials` row
//! 3. Error
//!
//! Mandatory stages call [`CredentialResolver::resolve`] and abort on error;
//! optional stages call [`CredentialResolver::resolve_optional`] and skip
//! themselves when it yields None.

use std::fmt;
use std::sync::Arc;

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::ProviderKind;

/// A provider API key; Debug output is redacted
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Credential errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no API key configured for {0}")]
    Missing(&'static str),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves provider keys from the environment, then the database
#[derive(Clone)]
pub struct CredentialResolver {
    pool: SqlitePool,
    env: EnvLookup,
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver").finish_non_exhaustive()
    }
}

impl CredentialResolver {
    /// Create a resolver reading the process environment
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_env_lookup(pool, |name| std::env::var(name).ok())
    }

    /// Create a resolver with a custom environment source
    pub fn with_env_lookup(
        pool: SqlitePool,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            pool,
            env: Arc::new(env),
        }
    }

    /// Resolve a key or fail
    pub async fn resolve(&self, provider: ProviderKind) -> Result<ApiKey, CredentialError> {
        if let Some(key) = (self.env)(provider.env_var()).filter(|k| !k.trim().is_empty()) {
            debug!("Using {} key from environment", provider.as_str());
            return Ok(ApiKey::new(key.trim()));
        }

        let row: Option<(String,)> =
            sqlx::query_as("SELECT api_key FROM provider_credentials WHERE provider = ?")
                .bind(provider.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((key,)) if !key.trim().is_empty() => {
                debug!("Using {} key from database", provider.as_str());
                Ok(ApiKey::new(key.trim()))
            }
            _ => Err(CredentialError::Missing(provider.as_str())),
        }
    }

    /// Resolve a key for an optional stage; never fails
    pub async fn resolve_optional(&self, provider: ProviderKind) -> Option<ApiKey> {
        match self.resolve(provider).await {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Optional stage credentials unavailable: {}", e);
                None
            }
        }
    }

    /// Persist a key for this deployment
    pub async fn store(&self, provider: ProviderKind, api_key: &str) -> Result<(), CredentialError> {
        sqlx::query(
            r#"
            INSERT INTO provider_credentials (provider, api_key, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(provider) DO UPDATE SET api_key = excluded.api_key, updated_at = excluded.updated_at
            "#,
        )
        .bind(provider.as_str())
        .bind(api_key)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
