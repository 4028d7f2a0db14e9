//! Account directory and acting-account resolution.
//!
//! Accounts are created and authenticated elsewhere; this module keeps a
//! local mirror of their identities plus the persisted selection of which
//! account is acting on this installation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, instrument, warn};

use crate::error::{AccessError, AccessResult};

/// Integer identity of an external account.
pub type AccountId = i64;

const ACTIVE_ACCOUNT_KEY: &str = "active_account_id";

/// Locally known account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    pub created_at: String,
}

/// Repository for the local account mirror.
#[derive(Debug, Clone)]
pub struct AccountDirectory {
    pool: SqlitePool,
}

impl AccountDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register (or rename) an account identity.
    #[instrument(skip(self))]
    pub async fn register(&self, id: AccountId, username: &str) -> Result<Account> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, username)
            VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET username = excluded.username
            "#,
        )
        .bind(id)
        .bind(username)
        .execute(&self.pool)
        .await
        .context("Failed to register account")?;

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Account not found after registration"))
    }

    pub async fn get(&self, id: AccountId) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, username, created_at FROM accounts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch account")?;

        Ok(account)
    }

    pub async fn exists(&self, id: AccountId) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    pub async fn list(&self) -> Result<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>(
            "SELECT id, username, created_at FROM accounts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list accounts")?;

        Ok(accounts)
    }

    /// Lowest existing identity, used when the selection needs healing.
    pub async fn lowest_id(&self) -> Result<Option<AccountId>> {
        let row: Option<(AccountId,)> =
            sqlx::query_as("SELECT id FROM accounts ORDER BY id ASC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch lowest account id")?;

        Ok(row.map(|(id,)| id))
    }
}

/// Resolves which account is acting for a call.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    pool: SqlitePool,
    accounts: AccountDirectory,
}

impl IdentityResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            accounts: AccountDirectory::new(pool.clone()),
            pool,
        }
    }

    pub fn accounts(&self) -> &AccountDirectory {
        &self.accounts
    }

    /// Currently persisted selection, whether or not it still exists.
    pub async fn selected(&self) -> Result<Option<AccountId>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM identity_state WHERE key = ?")
            .bind(ACTIVE_ACCOUNT_KEY)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read active account selection")?;

        // An unparseable value is treated like no selection and gets healed.
        Ok(row.and_then(|(value,)| value.parse().ok()))
    }

    async fn persist_selection(&self, id: AccountId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO identity_state (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')
            "#,
        )
        .bind(ACTIVE_ACCOUNT_KEY)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to persist active account selection")?;

        Ok(())
    }

    /// Select `id` as the acting account for subsequent calls.
    #[instrument(skip(self))]
    pub async fn select(&self, id: AccountId) -> AccessResult<()> {
        if !self.accounts.exists(id).await? {
            return Err(AccessError::AccountNotFound(id));
        }
        self.persist_selection(id).await?;
        info!(account_id = id, "Selected active account");
        Ok(())
    }

    /// Resolve the acting account.
    ///
    /// An explicit override must name an existing account. Otherwise the
    /// persisted selection is used while it still exists; if it does not,
    /// the lowest existing identity is selected and persisted.
    #[instrument(skip(self))]
    pub async fn resolve_acting_account(
        &self,
        explicit: Option<AccountId>,
    ) -> AccessResult<AccountId> {
        if let Some(id) = explicit {
            return if self.accounts.exists(id).await? {
                Ok(id)
            } else {
                Err(AccessError::AccountNotFound(id))
            };
        }

        let selected = self.selected().await?;
        if let Some(id) = selected
            && self.accounts.exists(id).await?
        {
            debug!(account_id = id, "Using selected account");
            return Ok(id);
        }

        let Some(healed) = self.accounts.lowest_id().await? else {
            return Err(AccessError::NoActiveAccount);
        };

        self.persist_selection(healed).await?;
        match selected {
            Some(stale) => warn!(
                stale_account_id = stale,
                account_id = healed,
                "Selected account no longer exists; switched to lowest account"
            ),
            None => info!(account_id = healed, "No account selected; defaulted to lowest account"),
        }

        Ok(healed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup() -> IdentityResolver {
        let db = Database::in_memory().await.unwrap();
        IdentityResolver::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_no_accounts_is_no_active_account() {
        let resolver = setup().await;
        let err = resolver.resolve_acting_account(None).await.unwrap_err();
        assert!(matches!(err, AccessError::NoActiveAccount));
    }

    #[tokio::test]
    async fn test_heals_to_lowest_and_persists() {
        let resolver = setup().await;
        resolver.accounts().register(7, "gale").await.unwrap();
        resolver.accounts().register(3, "ash").await.unwrap();

        assert_eq!(resolver.selected().await.unwrap(), None);
        assert_eq!(resolver.resolve_acting_account(None).await.unwrap(), 3);
        assert_eq!(resolver.selected().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_keeps_valid_selection() {
        let resolver = setup().await;
        resolver.accounts().register(1, "ash").await.unwrap();
        resolver.accounts().register(2, "birch").await.unwrap();
        resolver.select(2).await.unwrap();

        assert_eq!(resolver.resolve_acting_account(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_selection_is_healed() {
        let resolver = setup().await;
        resolver.accounts().register(4, "cedar").await.unwrap();
        resolver.accounts().register(9, "dune").await.unwrap();
        resolver.select(9).await.unwrap();

        sqlx::query("DELETE FROM accounts WHERE id = 9")
            .execute(&resolver.pool)
            .await
            .unwrap();

        assert_eq!(resolver.resolve_acting_account(None).await.unwrap(), 4);
        assert_eq!(resolver.selected().await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_explicit_override_must_exist() {
        let resolver = setup().await;
        resolver.accounts().register(1, "ash").await.unwrap();

        assert_eq!(resolver.resolve_acting_account(Some(1)).await.unwrap(), 1);
        let err = resolver.resolve_acting_account(Some(5)).await.unwrap_err();
        assert!(matches!(err, AccessError::AccountNotFound(5)));
        // An override never touches the persisted selection.
        assert_eq!(resolver.selected().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_select_unknown_account_fails() {
        let resolver = setup().await;
        assert!(matches!(
            resolver.select(42).await.unwrap_err(),
            AccessError::AccountNotFound(42)
        ));
    }

    #[tokio::test]
    async fn test_register_renames_existing() {
        let resolver = setup().await;
        resolver.accounts().register(1, "ash").await.unwrap();
        let renamed = resolver.accounts().register(1, "ashley").await.unwrap();
        assert_eq!(renamed.username, "ashley");
        assert_eq!(resolver.accounts().list().await.unwrap().len(), 1);
    }
}
