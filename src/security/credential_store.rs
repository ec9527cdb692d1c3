use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::security::crypto::TokenCipher;

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS user_tokens (
        user_id         TEXT NOT NULL,
        org_name        TEXT NOT NULL,
        encrypted_token TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        last_used_at    TEXT NOT NULL,
        PRIMARY KEY (user_id, org_name)
    )";

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_user_tokens_user_id ON user_tokens(user_id)";

// Delegated OAuth token sets, one per principal, kept apart from org credentials.
const CREATE_DELEGATED_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS delegated_tokens (
        principal           TEXT PRIMARY KEY,
        encrypted_token_set TEXT NOT NULL,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL
    )";

/// Encrypted per-(user, organization) credentials plus per-principal delegated token sets.
///
/// Cloning is cheap; clones share the connection pool and cipher.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
    cipher: TokenCipher,
}

impl CredentialStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>, cipher: TokenCipher) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_INDEX).execute(&pool).await?;
        sqlx::query(CREATE_DELEGATED_TABLE).execute(&pool).await?;

        info!(path = %path.display(), ephemeral_key = cipher.is_ephemeral(), "credential store opened");
        Ok(Self { pool, cipher })
    }

    /// Insert or replace the token for (user, org). Last write wins.
    pub async fn store(&self, user_id: &str, org_name: &str, token: &str) -> Result<(), StorageError> {
        let encrypted = self
            .cipher
            .encrypt(token)
            .map_err(|_| StorageError::Encryption)?;
        let now = timestamp();

        sqlx::query(
            "INSERT INTO user_tokens (user_id, org_name, encrypted_token, created_at, last_used_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, org_name) DO UPDATE SET
                 encrypted_token = excluded.encrypted_token,
                 last_used_at = excluded.last_used_at",
        )
        .bind(user_id)
        .bind(org_name)
        .bind(&encrypted)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!(user_id, org_name, "credential stored");
        Ok(())
    }

    /// `Ok(None)` when nothing was written for the key; decryption problems are errors.
    pub async fn get(&self, user_id: &str, org_name: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT encrypted_token FROM user_tokens WHERE user_id = ? AND org_name = ?",
        )
        .bind(user_id)
        .bind(org_name)
        .fetch_optional(&self.pool)
        .await?;

        let Some((encrypted,)) = row else {
            return Ok(None);
        };
        let token = self.decrypt(user_id, org_name, &encrypted)?;
        self.touch(user_id, org_name).await?;
        Ok(Some(token))
    }

    /// All credentials of a user, keyed by organization name.
    pub async fn get_all(&self, user_id: &str) -> Result<BTreeMap<String, String>, StorageError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT org_name, encrypted_token FROM user_tokens WHERE user_id = ? ORDER BY org_name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut tokens = BTreeMap::new();
        for (org_name, encrypted) in rows {
            let token = self.decrypt(user_id, &org_name, &encrypted)?;
            tokens.insert(org_name, token);
        }
        Ok(tokens)
    }

    pub async fn list_orgs(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let orgs = sqlx::query_scalar::<_, String>(
            "SELECT org_name FROM user_tokens WHERE user_id = ? ORDER BY org_name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(orgs)
    }

    /// Returns whether a record was removed.
    pub async fn delete(&self, user_id: &str, org_name: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM user_tokens WHERE user_id = ? AND org_name = ?")
            .bind(user_id)
            .bind(org_name)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        debug!(user_id, org_name, removed, "credential delete");
        Ok(removed)
    }

    pub async fn touch(&self, user_id: &str, org_name: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE user_tokens SET last_used_at = ? WHERE user_id = ? AND org_name = ?")
            .bind(timestamp())
            .bind(user_id)
            .bind(org_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// (created_at, last_used_at) as stored, for diagnostics.
    pub async fn timestamps(
        &self,
        user_id: &str,
        org_name: &str,
    ) -> Result<Option<(String, String)>, StorageError> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT created_at, last_used_at FROM user_tokens WHERE user_id = ? AND org_name = ?",
        )
        .bind(user_id)
        .bind(org_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Insert or replace the serialized token set of `principal`.
    pub async fn store_token_set(&self, principal: &str, token_set: &str) -> Result<(), StorageError> {
        let encrypted = self
            .cipher
            .encrypt(token_set)
            .map_err(|_| StorageError::Encryption)?;
        let now = timestamp();

        sqlx::query(
            "INSERT INTO delegated_tokens (principal, encrypted_token_set, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(principal) DO UPDATE SET
                 encrypted_token_set = excluded.encrypted_token_set,
                 updated_at = excluded.updated_at",
        )
        .bind(principal)
        .bind(&encrypted)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!(principal, "delegated token set stored");
        Ok(())
    }

    pub async fn get_token_set(&self, principal: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT encrypted_token_set FROM delegated_tokens WHERE principal = ?",
        )
        .bind(principal)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(encrypted,)| {
            self.cipher
                .decrypt(&encrypted)
                .map_err(|_| StorageError::TokenSetDecryption(principal.to_string()))
        })
        .transpose()
    }

    /// Returns whether a token set was removed.
    pub async fn delete_token_set(&self, principal: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM delegated_tokens WHERE principal = ?")
            .bind(principal)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        debug!(principal, removed, "delegated token set delete");
        Ok(removed)
    }

    pub async fn list_principals(&self) -> Result<Vec<String>, StorageError> {
        let principals = sqlx::query_scalar::<_, String>(
            "SELECT principal FROM delegated_tokens ORDER BY principal",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(principals)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn decrypt(&self, user_id: &str, org_name: &str, encrypted: &str) -> Result<String, StorageError> {
        self.cipher
            .decrypt(encrypted)
            .map_err(|_| StorageError::Decryption {
                user_id: user_id.to_string(),
                org_name: org_name.to_string(),
            })
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
