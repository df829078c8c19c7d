//! Account service
//!
//! Accounts carry the subscription plan and the explicit-content opt-in the
//! access gate reads. One live session per account: logging in rotates it.

use std::str::FromStr;

use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use tracing::warn;

use super::{generate_salt, generate_token, hash_password, token_digest, verify_password, MIN_PASSWORD_LEN};
use crate::access::{Caller, Plan};

const MAX_USERNAME_LEN: usize = 32;

/// Account data
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub plan: Plan,
    pub nsfw_enabled: bool,
    pub created_at: String,
}

impl Account {
    /// The gate's view of this account
    pub fn caller(&self) -> Caller {
        Caller {
            account_id: self.id.clone(),
            plan: self.plan,
            nsfw_enabled: self.nsfw_enabled,
        }
    }
}

type AccountRow = (String, String, String, bool, String);

const ACCOUNT_COLUMNS: &str = "id, username, plan, nsfw_enabled, created_at";

fn from_row((id, username, plan, nsfw_enabled, created_at): AccountRow) -> Account {
    // Unrecognized stored plans read as free
    let plan = Plan::from_str(&plan).unwrap_or_else(|e| {
        warn!("Account {}: {}", id, e);
        Plan::Free
    });
    Account {
        id,
        username,
        plan,
        nsfw_enabled,
        created_at,
    }
}

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("username already exists")]
    UsernameExists,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("username and password are required")]
    MissingFields,

    #[error("username must be 1-32 letters, digits, '_' or '-'")]
    InvalidUsername,

    #[error("password must be at least 8 characters")]
    WeakPassword,

    #[error("account not found")]
    AccountNotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Username and password policy for new credentials
pub fn check_new_credentials(username: &str, password: &str) -> Result<(), AuthError> {
    if username.is_empty() || password.is_empty() {
        return Err(AuthError::MissingFields);
    }
    let valid_name = username.len() <= MAX_USERNAME_LEN
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid_name {
        return Err(AuthError::InvalidUsername);
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword);
    }
    Ok(())
}

/// Account operations over the `accounts` table
pub struct AccountService {
    pool: SqlitePool,
}

impl AccountService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a free-plan account and open its first session
    pub async fn create_account(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(Account, String), AuthError> {
        let username = username.trim();
        check_new_credentials(username, password)?;

        let id = uuid::Uuid::new_v4().to_string();
        let salt = generate_salt();
        let token = generate_token();
        let now = chrono::Utc::now().to_rfc3339();

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO accounts (id, username, password_hash, salt, session_digest, plan, created_at)
             VALUES (?, ?, ?, ?, ?, 'free', ?)",
        )
        .bind(&id)
        .bind(username)
        .bind(hash_password(password, &salt))
        .bind(&salt)
        .bind(token_digest(&token))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        // UNIQUE(username) makes the insert a no-op for taken names
        if inserted.rows_affected() == 0 {
            return Err(AuthError::UsernameExists);
        }

        let account = Account {
            id,
            username: username.to_string(),
            plan: Plan::Free,
            nsfw_enabled: false,
            created_at: now,
        };

        Ok((account, token))
    }

    /// Check a password and return the account if it matches
    async fn authenticate(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let row: Option<(String, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT id, password_hash, salt FROM accounts WHERE username = ?")
                .bind(username.trim())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((id, Some(stored), Some(salt))) if verify_password(password, &salt, &stored) => {
                Ok(id)
            }
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    /// Login with username and password; replaces any previous session
    pub async fn login(&self, username: &str, password: &str) -> Result<(Account, String), AuthError> {
        let id = self.authenticate(username, password).await?;
        let token = generate_token();

        sqlx::query("UPDATE accounts SET session_digest = ? WHERE id = ?")
            .bind(token_digest(&token))
            .bind(&id)
            .execute(&self.pool)
            .await?;

        let account = self
            .get_account(&id)
            .await?
            .ok_or(AuthError::AccountNotFound)?;

        Ok((account, token))
    }

    /// Resolve a session token to its account
    pub async fn validate_token(&self, token: &str) -> Result<Option<Account>, AuthError> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE session_digest = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(token_digest(token))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(from_row))
    }

    /// End the session; false if the token was not live
    pub async fn logout(&self, token: &str) -> Result<bool, AuthError> {
        let result = sqlx::query("UPDATE accounts SET session_digest = NULL WHERE session_digest = ?")
            .bind(token_digest(token))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Replace the password and end the current session
    pub async fn change_password(
        &self,
        username: &str,
        current: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let id = self.authenticate(username, current).await?;
        check_new_credentials(username.trim(), new_password)?;

        let salt = generate_salt();
        sqlx::query(
            "UPDATE accounts SET password_hash = ?, salt = ?, session_digest = NULL WHERE id = ?",
        )
        .bind(hash_password(new_password, &salt))
        .bind(&salt)
        .bind(&id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_account(&self, id: &str) -> Result<Option<Account>, AuthError> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(from_row))
    }

    /// Change an account's plan (billing webhook / admin)
    pub async fn set_plan(&self, id: &str, plan: Plan) -> Result<(), AuthError> {
        let result = sqlx::query("UPDATE accounts SET plan = ? WHERE id = ?")
            .bind(plan.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::AccountNotFound);
        }
        Ok(())
    }

    /// Record the caller's explicit-content opt-in
    pub async fn set_nsfw_enabled(&self, id: &str, enabled: bool) -> Result<(), AuthError> {
        let result = sqlx::query("UPDATE accounts SET nsfw_enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::AccountNotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_pool;

    #[tokio::test]
    async fn test_register_opens_session() {
        let service = AccountService::new(test_pool().await);

        let (account, token) = service
            .create_account("mira_fan", "password123")
            .await
            .unwrap();

        assert_eq!(account.username, "mira_fan");
        assert_eq!(account.plan, Plan::Free);
        assert!(!account.nsfw_enabled);

        let session = service.validate_token(&token).await.unwrap().unwrap();
        assert_eq!(session.id, account.id);
    }

    #[tokio::test]
    async fn test_register_rejections() {
        let service = AccountService::new(test_pool().await);
        service
            .create_account("taken", "password123")
            .await
            .unwrap();

        let taken = service.create_account("taken", "password123").await;
        assert!(matches!(taken, Err(AuthError::UsernameExists)));

        let blank = service.create_account("  ", "password123").await;
        assert!(matches!(blank, Err(AuthError::MissingFields)));

        let spaced = service.create_account("has space", "password123").await;
        assert!(matches!(spaced, Err(AuthError::InvalidUsername)));

        let weak = service.create_account("short_pw", "1234567").await;
        assert!(matches!(weak, Err(AuthError::WeakPassword)));
    }

    #[tokio::test]
    async fn test_login_rotates_session() {
        let service = AccountService::new(test_pool().await);
        let (_, first) = service
            .create_account("testuser", "password123")
            .await
            .unwrap();

        let (account, second) = service.login("testuser", "password123").await.unwrap();
        assert_eq!(account.username, "testuser");
        assert_ne!(first, second);
        assert!(service.validate_token(&first).await.unwrap().is_none());
        assert!(service.validate_token(&second).await.unwrap().is_some());

        let wrong = service.login("testuser", "wrongpassword").await;
        assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));

        let missing = service.login("nouser", "password123").await;
        assert!(matches!(missing, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_tokens_are_not_stored_in_clear() {
        let pool = test_pool().await;
        let service = AccountService::new(pool.clone());
        let (_, token) = service
            .create_account("testuser", "password123")
            .await
            .unwrap();

        let (stored,): (String,) = sqlx::query_as("SELECT session_digest FROM accounts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_ne!(stored, token);
        assert_eq!(stored, token_digest(&token));
    }

    #[tokio::test]
    async fn test_logout() {
        let service = AccountService::new(test_pool().await);
        let (_, token) = service
            .create_account("testuser", "password123")
            .await
            .unwrap();

        assert!(service.logout(&token).await.unwrap());
        assert!(service.validate_token(&token).await.unwrap().is_none());
        assert!(!service.logout(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_change_password() {
        let service = AccountService::new(test_pool().await);
        let (_, token) = service
            .create_account("testuser", "password123")
            .await
            .unwrap();

        let wrong = service
            .change_password("testuser", "nope-nope", "newpassword1")
            .await;
        assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));

        service
            .change_password("testuser", "password123", "newpassword1")
            .await
            .unwrap();
        assert!(service.validate_token(&token).await.unwrap().is_none());
        assert!(service.login("testuser", "password123").await.is_err());
        assert!(service.login("testuser", "newpassword1").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_stored_plan_reads_as_free() {
        let pool = test_pool().await;
        let service = AccountService::new(pool.clone());
        let (account, _) = service
            .create_account("legacy", "password123")
            .await
            .unwrap();
        sqlx::query("UPDATE accounts SET plan = 'gold' WHERE id = ?")
            .bind(&account.id)
            .execute(&pool)
            .await
            .unwrap();

        let loaded = service.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(loaded.plan, Plan::Free);
    }

    #[tokio::test]
    async fn test_plan_and_nsfw_flow_into_caller() {
        let service = AccountService::new(test_pool().await);
        let (account, token) = service
            .create_account("fan", "password123")
            .await
            .unwrap();

        service.set_plan(&account.id, Plan::Premium).await.unwrap();
        service.set_nsfw_enabled(&account.id, true).await.unwrap();

        let caller = service
            .validate_token(&token)
            .await
            .unwrap()
            .unwrap()
            .caller();
        assert_eq!(caller.plan, Plan::Premium);
        assert!(caller.nsfw_enabled);

        let missing = service.set_plan("nobody", Plan::Premium).await;
        assert!(matches!(missing, Err(AuthError::AccountNotFound)));
    }
}
