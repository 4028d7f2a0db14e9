//! Session store for shared sessions, memberships and join requests.

use anyhow::{Context, Result};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, instrument};

use super::join_code;
use super::models::{
    JoinDecision, JoinRequest, JoinRequestStatus, MemberRole, Membership, PendingJoinRequest,
    Session, Verdict,
};
use crate::identity::AccountId;
use crate::permissions::PermissionGrant;

#[derive(Debug, FromRow)]
struct MembershipRow {
    session_id: String,
    account_id: AccountId,
    #[sqlx(try_from = "String")]
    role: MemberRole,
    permissions: String,
    joined_at: String,
    updated_at: String,
}

impl From<MembershipRow> for Membership {
    fn from(row: MembershipRow) -> Self {
        Self {
            session_id: row.session_id,
            account_id: row.account_id,
            role: row.role,
            permissions: PermissionGrant::from_stored(&row.permissions),
            joined_at: row.joined_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct JoinRequestRow {
    id: String,
    session_id: String,
    requester_account_id: AccountId,
    #[sqlx(try_from = "String")]
    status: JoinRequestStatus,
    requested_at: String,
    decided_at: Option<String>,
    decided_by_account_id: Option<AccountId>,
    granted_permissions: Option<String>,
}

impl From<JoinRequestRow> for JoinRequest {
    fn from(row: JoinRequestRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            requester_account_id: row.requester_account_id,
            status: row.status,
            requested_at: row.requested_at,
            decided_at: row.decided_at,
            decided_by_account_id: row.decided_by_account_id,
            granted_permissions: row
                .granted_permissions
                .as_deref()
                .map(PermissionGrant::from_stored),
        }
    }
}

#[derive(Debug, FromRow)]
struct PendingRow {
    #[sqlx(flatten)]
    request: JoinRequestRow,
    session_name: String,
}

/// Repository for shared-session database operations.
#[derive(Debug, Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Create a new session store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn generate_session_id() -> String {
        format!("ses_{}", nanoid::nanoid!(12))
    }

    fn generate_request_id() -> String {
        format!("jrq_{}", nanoid::nanoid!(12))
    }

    /// Create a session together with its owner membership.
    #[instrument(skip(self))]
    pub async fn create_session(&self, owner: AccountId, name: &str) -> Result<Session> {
        let id = Self::generate_session_id();
        let code = join_code::ensure_unique(self).await?;
        let owner_grant = PermissionGrant::owner_default().to_stored();

        debug!("Creating session: {} ({})", name, id);

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO shared_sessions (id, owner_account_id, name, join_code, status)
            VALUES (?, ?, ?, ?, 'active')
            "#,
        )
        .bind(&id)
        .bind(owner)
        .bind(name)
        .bind(&code)
        .execute(&mut *tx)
        .await
        .context("Failed to insert session")?;

        sqlx::query(
            r#"
            INSERT INTO session_members (session_id, account_id, role, permissions)
            VALUES (?, ?, 'owner', ?)
            "#,
        )
        .bind(&id)
        .bind(owner)
        .bind(&owner_grant)
        .execute(&mut *tx)
        .await
        .context("Failed to insert owner membership")?;

        tx.commit().await.context("Failed to commit session creation")?;

        self.get_session(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Session not found after creation"))
    }

    /// Get a session by ID.
    #[instrument(skip(self))]
    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, owner_account_id, name, join_code, status, created_at, ended_at
            FROM shared_sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session")?;

        Ok(session)
    }

    /// Find the active session using `code`.
    #[instrument(skip(self))]
    pub async fn find_by_join_code(&self, code: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, owner_account_id, name, join_code, status, created_at, ended_at
            FROM shared_sessions
            WHERE join_code = ? AND status = 'active'
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session by join code")?;

        Ok(session)
    }

    /// Whether an active session already uses `code`.
    pub async fn join_code_in_use(&self, code: &str) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM shared_sessions WHERE join_code = ? AND status = 'active'",
        )
        .bind(code)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check join code availability")?;

        Ok(count.0 > 0)
    }

    /// Sessions owned by `account_id`, newest first.
    #[instrument(skip(self))]
    pub async fn list_owned(&self, account_id: AccountId) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, owner_account_id, name, join_code, status, created_at, ended_at
            FROM shared_sessions
            WHERE owner_account_id = ?
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list owned sessions")?;

        Ok(sessions)
    }

    /// Sessions `account_id` belongs to as a non-owner member.
    #[instrument(skip(self))]
    pub async fn list_joined(&self, account_id: AccountId) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT s.id, s.owner_account_id, s.name, s.join_code, s.status, s.created_at, s.ended_at
            FROM shared_sessions s
            JOIN session_members m ON m.session_id = s.id
            WHERE m.account_id = ? AND m.role = 'member'
            ORDER BY m.joined_at DESC, s.rowid DESC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list joined sessions")?;

        Ok(sessions)
    }

    /// Members of a session, owner first, then by join time.
    #[instrument(skip(self))]
    pub async fn list_members(&self, session_id: &str) -> Result<Vec<Membership>> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT session_id, account_id, role, permissions, joined_at, updated_at
            FROM session_members
            WHERE session_id = ?
            ORDER BY CASE role WHEN 'owner' THEN 0 ELSE 1 END, joined_at ASC, rowid ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list session members")?;

        Ok(rows.into_iter().map(Membership::from).collect())
    }

    #[instrument(skip(self))]
    pub async fn get_membership(
        &self,
        session_id: &str,
        account_id: AccountId,
    ) -> Result<Option<Membership>> {
        let row = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT session_id, account_id, role, permissions, joined_at, updated_at
            FROM session_members
            WHERE session_id = ? AND account_id = ?
            "#,
        )
        .bind(session_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch membership")?;

        Ok(row.map(Membership::from))
    }

    /// Insert or update a membership.
    ///
    /// An existing owner row is never modified; the current row is returned
    /// either way.
    #[instrument(skip(self, grant))]
    pub async fn upsert_membership(
        &self,
        session_id: &str,
        account_id: AccountId,
        role: MemberRole,
        grant: &PermissionGrant,
    ) -> Result<Membership> {
        sqlx::query(
            r#"
            INSERT INTO session_members (session_id, account_id, role, permissions)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id, account_id) DO UPDATE
            SET role = excluded.role,
                permissions = excluded.permissions,
                updated_at = datetime('now')
            WHERE session_members.role != 'owner'
            "#,
        )
        .bind(session_id)
        .bind(account_id)
        .bind(role.to_string())
        .bind(grant.to_stored())
        .execute(&self.pool)
        .await
        .context("Failed to upsert membership")?;

        self.get_membership(session_id, account_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Membership not found after upsert"))
    }

    /// Delete a non-owner membership. Returns whether a row was removed.
    #[instrument(skip(self))]
    pub async fn delete_membership(&self, session_id: &str, account_id: AccountId) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM session_members WHERE session_id = ? AND account_id = ? AND role = 'member'",
        )
        .bind(session_id)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .context("Failed to delete membership")?;

        Ok(result.rows_affected() > 0)
    }

    /// Create a pending join request for an active session.
    ///
    /// Returns the pending request and whether it was created by this call.
    /// A concurrent duplicate is absorbed by the one-pending index and the
    /// existing request is returned instead. `None` means the session is not
    /// active.
    #[instrument(skip(self))]
    pub async fn create_join_request(
        &self,
        session_id: &str,
        requester: AccountId,
    ) -> Result<Option<(JoinRequest, bool)>> {
        let id = Self::generate_request_id();

        let result = sqlx::query(
            r#"
            INSERT INTO join_requests (id, session_id, requester_account_id, status)
            SELECT ?, ?, ?, 'pending'
            WHERE EXISTS (SELECT 1 FROM shared_sessions WHERE id = ? AND status = 'active')
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(requester)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to insert join request")?;

        let created = result.rows_affected() > 0;
        let pending = self.find_pending_join_request(session_id, requester).await?;
        if created {
            debug!("Created join request {} for session {}", id, session_id);
        }

        Ok(pending.map(|request| (request, created)))
    }

    #[instrument(skip(self))]
    pub async fn find_pending_join_request(
        &self,
        session_id: &str,
        requester: AccountId,
    ) -> Result<Option<JoinRequest>> {
        let row = sqlx::query_as::<_, JoinRequestRow>(
            r#"
            SELECT id, session_id, requester_account_id, status, requested_at,
                   decided_at, decided_by_account_id, granted_permissions
            FROM join_requests
            WHERE session_id = ? AND requester_account_id = ? AND status = 'pending'
            "#,
        )
        .bind(session_id)
        .bind(requester)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch pending join request")?;

        Ok(row.map(JoinRequest::from))
    }

    #[instrument(skip(self))]
    pub async fn get_join_request(&self, id: &str) -> Result<Option<JoinRequest>> {
        let row = sqlx::query_as::<_, JoinRequestRow>(
            r#"
            SELECT id, session_id, requester_account_id, status, requested_at,
                   decided_at, decided_by_account_id, granted_permissions
            FROM join_requests
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch join request")?;

        Ok(row.map(JoinRequest::from))
    }

    /// Pending requests across the owner's active sessions, oldest first.
    #[instrument(skip(self))]
    pub async fn list_pending_for_owner(&self, owner: AccountId) -> Result<Vec<PendingJoinRequest>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT jr.id, jr.session_id, jr.requester_account_id, jr.status, jr.requested_at,
                   jr.decided_at, jr.decided_by_account_id, jr.granted_permissions,
                   s.name AS session_name
            FROM join_requests jr
            JOIN shared_sessions s ON s.id = jr.session_id
            WHERE s.owner_account_id = ? AND s.status = 'active' AND jr.status = 'pending'
            ORDER BY jr.requested_at ASC, jr.rowid ASC
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pending join requests")?;

        Ok(rows
            .into_iter()
            .map(|row| PendingJoinRequest {
                request: row.request.into(),
                session_name: row.session_name,
            })
            .collect())
    }

    /// Apply a verdict to a pending join request.
    ///
    /// The status transition and, on acceptance, the membership write happen
    /// in one transaction. Returns `None` when the request is no longer
    /// decidable: it is not pending or its session is no longer active.
    #[instrument(skip(self, verdict))]
    pub async fn decide_join_request(
        &self,
        request_id: &str,
        verdict: Verdict,
        decider: AccountId,
    ) -> Result<Option<JoinDecision>> {
        let (status, granted) = match &verdict {
            Verdict::Accept(grant) => (JoinRequestStatus::Accepted, Some(grant.to_stored())),
            Verdict::Reject => (JoinRequestStatus::Rejected, None),
        };

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // Only a pending request on an active session may transition.
        let result = sqlx::query(
            r#"
            UPDATE join_requests
            SET status = ?,
                decided_at = datetime('now'),
                decided_by_account_id = ?,
                granted_permissions = ?
            WHERE id = ?
              AND status = 'pending'
              AND EXISTS (
                  SELECT 1 FROM shared_sessions s
                  WHERE s.id = join_requests.session_id AND s.status = 'active'
              )
            "#,
        )
        .bind(status.to_string())
        .bind(decider)
        .bind(&granted)
        .bind(request_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update join request")?;

        if result.rows_affected() == 0 {
            tx.rollback().await.context("Failed to roll back transaction")?;
            debug!("Join request {} is no longer decidable", request_id);
            return Ok(None);
        }

        let request: JoinRequest = sqlx::query_as::<_, JoinRequestRow>(
            r#"
            SELECT id, session_id, requester_account_id, status, requested_at,
                   decided_at, decided_by_account_id, granted_permissions
            FROM join_requests
            WHERE id = ?
            "#,
        )
        .bind(request_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to fetch decided join request")?
        .into();

        let member = match granted {
            Some(grant) => {
                sqlx::query(
                    r#"
                    INSERT INTO session_members (session_id, account_id, role, permissions)
                    VALUES (?, ?, 'member', ?)
                    ON CONFLICT(session_id, account_id) DO UPDATE
                    SET permissions = excluded.permissions,
                        updated_at = datetime('now')
                    WHERE session_members.role = 'member'
                    "#,
                )
                .bind(&request.session_id)
                .bind(request.requester_account_id)
                .bind(&grant)
                .execute(&mut *tx)
                .await
                .context("Failed to insert membership")?;

                let row = sqlx::query_as::<_, MembershipRow>(
                    r#"
                    SELECT session_id, account_id, role, permissions, joined_at, updated_at
                    FROM session_members
                    WHERE session_id = ? AND account_id = ?
                    "#,
                )
                .bind(&request.session_id)
                .bind(request.requester_account_id)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to fetch membership")?;

                Some(Membership::from(row))
            }
            None => None,
        };

        tx.commit().await.context("Failed to commit join decision")?;

        info!(
            request_id,
            status = %request.status,
            session_id = %request.session_id,
            requester = request.requester_account_id,
            "Join request decided"
        );

        Ok(Some(JoinDecision { request, member }))
    }

    /// Rename an active session. Returns whether a row changed.
    #[instrument(skip(self))]
    pub async fn rename_session(&self, id: &str, name: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE shared_sessions SET name = ? WHERE id = ? AND status = 'active'",
        )
        .bind(name)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to rename session")?;

        Ok(result.rows_affected() > 0)
    }

    /// Give an active session a fresh join code.
    ///
    /// Returns the new code, or `None` if the session is not active.
    #[instrument(skip(self))]
    pub async fn regenerate_join_code(&self, id: &str) -> Result<Option<String>> {
        let code = join_code::ensure_unique(self).await?;

        let result = sqlx::query(
            "UPDATE shared_sessions SET join_code = ? WHERE id = ? AND status = 'active'",
        )
        .bind(&code)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to regenerate join code")?;

        Ok((result.rows_affected() > 0).then_some(code))
    }

    /// End an active session. Irreversible.
    #[instrument(skip(self))]
    pub async fn end_session(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE shared_sessions
            SET status = 'ended', ended_at = datetime('now')
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to end session")?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::permissions::Capability;
    use crate::session::models::SessionStatus;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    async fn setup() -> SessionStore {
        let db = Database::in_memory().await.unwrap();
        SessionStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_create_session_adds_owner_membership() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();

        assert!(session.id.starts_with("ses_"));
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.ended_at, None);

        let members = store.list_members(&session.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].is_owner());
        assert_eq!(members[0].permissions, PermissionGrant::owner_default());
    }

    #[tokio::test]
    async fn test_find_by_join_code_only_active() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();

        let found = store.find_by_join_code(&session.join_code).await.unwrap();
        assert_eq!(found.map(|s| s.id), Some(session.id.clone()));

        assert!(store.end_session(&session.id).await.unwrap());
        assert!(store
            .find_by_join_code(&session.join_code)
            .await
            .unwrap()
            .is_none());
        assert!(!store.join_code_in_use(&session.join_code).await.unwrap());
    }

    #[tokio::test]
    async fn test_active_join_codes_are_unique_in_schema() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();

        let err = sqlx::query(
            "INSERT INTO shared_sessions (id, owner_account_id, name, join_code) VALUES ('ses_x', 2, 'Other', ?)",
        )
        .bind(&session.join_code)
        .execute(store.pool())
        .await
        .unwrap_err();
        assert!(err.as_database_error().unwrap().is_unique_violation());
    }

    #[tokio::test]
    async fn test_owner_row_is_protected() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();

        let row = store
            .upsert_membership(&session.id, 1, MemberRole::Member, &PermissionGrant::deny_all())
            .await
            .unwrap();
        assert!(row.is_owner());
        assert_eq!(row.permissions, PermissionGrant::owner_default());

        assert!(!store.delete_membership(&session.id, 1).await.unwrap());
        assert!(store.get_membership(&session.id, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upsert_updates_member_grant() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();
        store
            .upsert_membership(&session.id, 2, MemberRole::Member, &PermissionGrant::member_default())
            .await
            .unwrap();

        let mut grant = PermissionGrant::deny_all();
        grant.set(Capability::AiAnalyze, true);
        let updated = store
            .upsert_membership(&session.id, 2, MemberRole::Member, &grant)
            .await
            .unwrap();
        assert_eq!(updated.permissions, grant);

        assert!(store.delete_membership(&session.id, 2).await.unwrap());
        assert!(store.get_membership(&session.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_stored_grant_is_denied() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();
        sqlx::query(
            "INSERT INTO session_members (session_id, account_id, role, permissions) VALUES (?, 2, 'member', 'not json')",
        )
        .bind(&session.id)
        .execute(store.pool())
        .await
        .unwrap();

        let member = store.get_membership(&session.id, 2).await.unwrap().unwrap();
        assert_eq!(member.permissions, PermissionGrant::deny_all());
    }

    #[tokio::test]
    async fn test_join_request_is_idempotent() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();

        let (first, created) = store.create_join_request(&session.id, 2).await.unwrap().unwrap();
        assert!(created);
        assert!(first.id.starts_with("jrq_"));
        let (second, created) = store.create_join_request(&session.id, 2).await.unwrap().unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM join_requests")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_join_request_requires_active_session() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();
        store.end_session(&session.id).await.unwrap();

        assert!(store.create_join_request(&session.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_accept_writes_membership_and_status() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();
        let (request, _) = store.create_join_request(&session.id, 2).await.unwrap().unwrap();

        let decision = store
            .decide_join_request(&request.id, Verdict::Accept(PermissionGrant::member_default()), 1)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(decision.request.status, JoinRequestStatus::Accepted);
        assert_eq!(decision.request.decided_by_account_id, Some(1));
        assert!(decision.request.decided_at.is_some());
        assert_eq!(
            decision.request.granted_permissions,
            Some(PermissionGrant::member_default())
        );
        let member = decision.member.unwrap();
        assert_eq!(member.role, MemberRole::Member);
        assert_eq!(member.permissions, PermissionGrant::member_default());

        let joined = store.list_joined(2).await.unwrap();
        assert_eq!(joined.len(), 1);
        assert!(store.list_joined(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_writes_no_membership() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();
        let (request, _) = store.create_join_request(&session.id, 2).await.unwrap().unwrap();

        let decision = store
            .decide_join_request(&request.id, Verdict::Reject, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.request.status, JoinRequestStatus::Rejected);
        assert!(decision.request.granted_permissions.is_none());
        assert!(decision.member.is_none());
        assert!(store.get_membership(&session.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decided_request_cannot_transition_again() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();
        let (request, _) = store.create_join_request(&session.id, 2).await.unwrap().unwrap();

        store
            .decide_join_request(&request.id, Verdict::Reject, 1)
            .await
            .unwrap()
            .unwrap();
        let again = store
            .decide_join_request(&request.id, Verdict::Accept(PermissionGrant::owner_default()), 1)
            .await
            .unwrap();
        assert!(again.is_none());
        assert!(store.get_membership(&session.id, 2).await.unwrap().is_none());

        let stored = store.get_join_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JoinRequestStatus::Rejected);
    }

    #[tokio::test]
    async fn test_decide_on_ended_session_is_refused() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();
        let (request, _) = store.create_join_request(&session.id, 2).await.unwrap().unwrap();
        store.end_session(&session.id).await.unwrap();

        let result = store
            .decide_join_request(&request.id, Verdict::Accept(PermissionGrant::member_default()), 1)
            .await
            .unwrap();
        assert!(result.is_none());
        let stored = store.get_join_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JoinRequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_membership_write_rolls_back_decision() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();
        let (request, _) = store.create_join_request(&session.id, 2).await.unwrap().unwrap();

        sqlx::query(
            r#"
            CREATE TRIGGER refuse_members BEFORE INSERT ON session_members
            BEGIN
                SELECT RAISE(ABORT, 'membership writes disabled');
            END
            "#,
        )
        .execute(store.pool())
        .await
        .unwrap();

        let err = store
            .decide_join_request(&request.id, Verdict::Accept(PermissionGrant::member_default()), 1)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("membership writes disabled"));

        let stored = store.get_join_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JoinRequestStatus::Pending);
        assert!(stored.decided_at.is_none());
        assert!(store.get_membership(&session.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_decisions_single_winner() {
        // A file-backed pool so the two deciders run on separate connections.
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("tandem.db")).await.unwrap();
        let store = Arc::new(SessionStore::new(db.pool().clone()));
        let session = store.create_session(1, "Team").await.unwrap();
        let (request, _) = store.create_join_request(&session.id, 2).await.unwrap().unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = Vec::new();
        for verdict in [Verdict::Accept(PermissionGrant::member_default()), Verdict::Reject] {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let request_id = request.id.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store.decide_join_request(&request_id, verdict, 1).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let stored = store.get_join_request(&request.id).await.unwrap().unwrap();
        let member = store.get_membership(&session.id, 2).await.unwrap();
        match stored.status {
            JoinRequestStatus::Accepted => assert!(member.is_some()),
            JoinRequestStatus::Rejected => assert!(member.is_none()),
            JoinRequestStatus::Pending => panic!("request left pending"),
        }
    }

    #[tokio::test]
    async fn test_pending_list_scoped_to_owner_and_active_sessions() {
        let store = setup().await;
        let team = store.create_session(1, "Team").await.unwrap();
        let other = store.create_session(5, "Other").await.unwrap();
        let closed = store.create_session(1, "Closed").await.unwrap();

        store.create_join_request(&team.id, 2).await.unwrap();
        store.create_join_request(&other.id, 2).await.unwrap();
        store.create_join_request(&closed.id, 3).await.unwrap();
        store.end_session(&closed.id).await.unwrap();

        let pending = store.list_pending_for_owner(1).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].session_name, "Team");
        assert_eq!(pending[0].request.requester_account_id, 2);
    }

    #[tokio::test]
    async fn test_mutations_only_touch_active_sessions() {
        let store = setup().await;
        let session = store.create_session(1, "Team").await.unwrap();

        assert!(store.rename_session(&session.id, "Crew").await.unwrap());
        let code = store.regenerate_join_code(&session.id).await.unwrap().unwrap();
        assert_ne!(code, session.join_code);

        let current = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(current.name, "Crew");
        assert_eq!(current.join_code, code);

        assert!(store.end_session(&session.id).await.unwrap());
        assert!(!store.end_session(&session.id).await.unwrap());
        assert!(!store.rename_session(&session.id, "Again").await.unwrap());
        assert!(store.regenerate_join_code(&session.id).await.unwrap().is_none());

        let ended = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        assert!(ended.ended_at.is_some());
        assert_eq!(ended.name, "Crew");
    }
}
