//! Character profiles and their persistence
//!
//! The pipeline never caches profiles: it calls [`CharacterStore::snapshot`]
//! right before composing a prompt so trait edits made between generations
//! are always picked up.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;

/// Free-form profile metadata (poses, environments, restrictions, ...)
pub type Metadata = HashMap<String, serde_json::Value>;

/// Visual identity fields used for the identity lock
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualTraits {
    pub hair: Option<String>,
    pub eyes: Option<String>,
    pub skin: Option<String>,
    pub ethnicity: Option<String>,
    pub age: Option<u32>,
    pub body: Option<String>,
}

/// A persisted character ("entity profile")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityProfile {
    pub id: String,
    /// Owning account; None for catalogue characters
    pub owner_id: Option<String>,
    pub is_public: bool,
    pub name: String,
    pub traits: VisualTraits,
    pub personality: String,
    pub metadata: Metadata,
    /// Reference face for identity-preserving post-processing
    pub face_image_url: Option<String>,
    pub anatomy_image_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl EntityProfile {
    /// Create a new private profile
    pub fn new(name: &str, owner_id: Option<&str>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.map(str::to_string),
            is_public: false,
            name: name.to_string(),
            traits: VisualTraits::default(),
            personality: String::new(),
            metadata: Metadata::new(),
            face_image_url: None,
            anatomy_image_url: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Whether `account_id` (None = anonymous) may use this profile
    pub fn visible_to(&self, account_id: Option<&str>) -> bool {
        self.is_public || (self.owner_id.is_some() && self.owner_id.as_deref() == account_id)
    }

    /// Restriction text from metadata; accepts a string or a list of strings
    pub fn restrictions(&self) -> Vec<String> {
        match self.metadata.get("restrictions") {
            Some(serde_json::Value::String(s)) => s
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Character store errors
#[derive(Debug, Error)]
pub enum CharacterError {
    #[error("character name is required")]
    MissingName,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid stored profile: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(sqlx::FromRow)]
struct CharacterRow {
    id: String,
    owner_id: Option<String>,
    is_public: bool,
    name: String,
    traits: String,
    personality: String,
    metadata: String,
    face_image_url: Option<String>,
    anatomy_image_url: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CharacterRow {
    fn into_profile(self) -> Result<EntityProfile, CharacterError> {
        Ok(EntityProfile {
            id: self.id,
            owner_id: self.owner_id,
            is_public: self.is_public,
            name: self.name,
            traits: serde_json::from_str(&self.traits)?,
            personality: self.personality,
            metadata: serde_json::from_str(&self.metadata)?,
            face_image_url: self.face_image_url,
            anatomy_image_url: self.anatomy_image_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, owner_id, is_public, name, traits, personality, metadata, face_image_url, anatomy_image_url, created_at, updated_at FROM characters";

/// Character storage with database backing
#[derive(Debug, Clone)]
pub struct CharacterStore {
    pool: SqlitePool,
}

impl CharacterStore {
    /// Create a new character store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a profile
    pub async fn create(&self, profile: &EntityProfile) -> Result<(), CharacterError> {
        if profile.name.trim().is_empty() {
            return Err(CharacterError::MissingName);
        }

        sqlx::query(
            r#"
            INSERT INTO characters (id, owner_id, is_public, name, traits, personality, metadata,
                                    face_image_url, anatomy_image_url, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.owner_id)
        .bind(profile.is_public)
        .bind(&profile.name)
        .bind(serde_json::to_string(&profile.traits)?)
        .bind(&profile.personality)
        .bind(serde_json::to_string(&profile.metadata)?)
        .bind(&profile.face_image_url)
        .bind(&profile.anatomy_image_url)
        .bind(&profile.created_at)
        .bind(&profile.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a profile by ID
    pub async fn get(&self, id: &str) -> Result<Option<EntityProfile>, CharacterError> {
        let row: Option<CharacterRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(CharacterRow::into_profile).transpose()
    }

    /// Fresh read for generation; hides profiles the caller may not use
    pub async fn snapshot(
        &self,
        id: &str,
        account_id: Option<&str>,
    ) -> Result<Option<EntityProfile>, CharacterError> {
        Ok(self.get(id).await?.filter(|p| p.visible_to(account_id)))
    }

    /// Profiles owned by the account plus all public ones
    pub async fn list_visible(&self, account_id: &str) -> Result<Vec<EntityProfile>, CharacterError> {
        let rows: Vec<CharacterRow> = sqlx::query_as(&format!(
            "{} WHERE owner_id = ? OR is_public = 1 ORDER BY created_at",
            SELECT_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CharacterRow::into_profile).collect()
    }

    /// Replace a profile's mutable fields
    pub async fn update(&self, profile: &EntityProfile) -> Result<bool, CharacterError> {
        let result = sqlx::query(
            r#"
            UPDATE characters
            SET is_public = ?, name = ?, traits = ?, personality = ?, metadata = ?,
                face_image_url = ?, anatomy_image_url = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(profile.is_public)
        .bind(&profile.name)
        .bind(serde_json::to_string(&profile.traits)?)
        .bind(&profile.personality)
        .bind(serde_json::to_string(&profile.metadata)?)
        .bind(&profile.face_image_url)
        .bind(&profile.anatomy_image_url)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(&profile.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a profile owned by `owner_id`
    pub async fn delete(&self, id: &str, owner_id: &str) -> Result<bool, CharacterError> {
        let result = sqlx::query("DELETE FROM characters WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
