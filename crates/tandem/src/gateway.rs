//! Access-control gateway.
//!
//! Public entry point for every shared-session operation. Each call is
//! served by exactly one authority: the remote one when configured,
//! otherwise the local store. Results carry the source that produced them.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::authority::{
    Ack, AuthoritySource, DelegatingAuthority, JoinRequested, LocalAuthority, PendingRequests,
    RemoteAuthorityConfig, RenamedSession, SessionAuthority, SessionList, SessionMembers,
    SessionWithCode, Sourced, UpdatedMember,
};
use crate::db::Database;
use crate::error::{AccessResult, ErrorKind};
use crate::identity::{AccountId, IdentityResolver};
use crate::permissions::PermissionGrant;
use crate::session::{Decision, JoinDecision, SessionStore};

/// Gateway over the local and (optional) remote authority.
pub struct AccessControlGateway {
    local: Arc<LocalAuthority>,
    identity: IdentityResolver,
    remote: RwLock<Option<Arc<DelegatingAuthority>>>,
}

impl AccessControlGateway {
    /// Build a gateway over an opened database.
    pub fn new(db: &Database) -> Self {
        Self {
            local: Arc::new(LocalAuthority::new(SessionStore::new(db.pool().clone()))),
            identity: IdentityResolver::new(db.pool().clone()),
            remote: RwLock::new(None),
        }
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn store(&self) -> &SessionStore {
        self.local.store()
    }

    /// Route every following operation to a remote authority.
    #[instrument(skip(self, config), fields(base_url = %config.base_url))]
    pub async fn configure_remote(&self, config: RemoteAuthorityConfig) -> AccessResult<()> {
        let authority = DelegatingAuthority::new(config)?;
        *self.remote.write().await = Some(Arc::new(authority));
        info!("Remote authority configured");
        Ok(())
    }

    /// Go back to serving from local state. Returns whether a remote was set.
    pub async fn clear_remote(&self) -> bool {
        let cleared = self.remote.write().await.take().is_some();
        if cleared {
            info!("Remote authority cleared; serving from local state");
        }
        cleared
    }

    /// Base URL of the configured remote authority, if any.
    pub async fn remote_base_url(&self) -> Option<String> {
        self.remote
            .read()
            .await
            .as_ref()
            .map(|remote| remote.base_url().to_string())
    }

    pub async fn resolve_acting_account(&self, explicit: Option<AccountId>) -> AccessResult<AccountId> {
        self.identity.resolve_acting_account(explicit).await
    }

    async fn authority(&self) -> Arc<dyn SessionAuthority> {
        match self.remote.read().await.as_ref() {
            Some(remote) => Arc::clone(remote) as Arc<dyn SessionAuthority>,
            None => Arc::clone(&self.local) as Arc<dyn SessionAuthority>,
        }
    }

    pub async fn source(&self) -> AuthoritySource {
        self.authority().await.source()
    }

    #[instrument(skip(self))]
    pub async fn list_sessions(&self, actor: AccountId) -> AccessResult<Sourced<SessionList>> {
        let authority = self.authority().await;
        let result = authority.list_sessions(actor).await;
        observe("list_sessions", authority.source(), result)
    }

    #[instrument(skip(self))]
    pub async fn create_session(
        &self,
        actor: AccountId,
        name: Option<&str>,
    ) -> AccessResult<Sourced<SessionWithCode>> {
        let authority = self.authority().await;
        let result = authority.create_session(actor, name).await;
        observe("create_session", authority.source(), result)
    }

    #[instrument(skip(self))]
    pub async fn request_join(
        &self,
        actor: AccountId,
        join_code: &str,
    ) -> AccessResult<Sourced<JoinRequested>> {
        let authority = self.authority().await;
        let result = authority.request_join(actor, join_code).await;
        observe("request_join", authority.source(), result)
    }

    #[instrument(skip(self))]
    pub async fn list_pending_requests(
        &self,
        actor: AccountId,
    ) -> AccessResult<Sourced<PendingRequests>> {
        let authority = self.authority().await;
        let result = authority.list_pending_requests(actor).await;
        observe("list_pending_requests", authority.source(), result)
    }

    #[instrument(skip(self, grant))]
    pub async fn decide_join_request(
        &self,
        actor: AccountId,
        request_id: &str,
        decision: Decision,
        grant: Option<PermissionGrant>,
    ) -> AccessResult<Sourced<JoinDecision>> {
        let authority = self.authority().await;
        let result = authority
            .decide_join_request(actor, request_id, decision, grant)
            .await;
        observe("decide_join_request", authority.source(), result)
    }

    #[instrument(skip(self))]
    pub async fn list_members(
        &self,
        actor: AccountId,
        session_id: &str,
    ) -> AccessResult<Sourced<SessionMembers>> {
        let authority = self.authority().await;
        let result = authority.list_members(actor, session_id).await;
        observe("list_members", authority.source(), result)
    }

    #[instrument(skip(self))]
    pub async fn leave_session(&self, actor: AccountId, session_id: &str) -> AccessResult<Sourced<Ack>> {
        let authority = self.authority().await;
        let result = authority.leave_session(actor, session_id).await;
        observe("leave_session", authority.source(), result)
    }

    #[instrument(skip(self))]
    pub async fn end_session(&self, actor: AccountId, session_id: &str) -> AccessResult<Sourced<Ack>> {
        let authority = self.authority().await;
        let result = authority.end_session(actor, session_id).await;
        observe("end_session", authority.source(), result)
    }

    #[instrument(skip(self))]
    pub async fn rename_session(
        &self,
        actor: AccountId,
        session_id: &str,
        name: &str,
    ) -> AccessResult<Sourced<RenamedSession>> {
        let authority = self.authority().await;
        let result = authority.rename_session(actor, session_id, name).await;
        observe("rename_session", authority.source(), result)
    }

    #[instrument(skip(self))]
    pub async fn regenerate_join_code(
        &self,
        actor: AccountId,
        session_id: &str,
    ) -> AccessResult<Sourced<SessionWithCode>> {
        let authority = self.authority().await;
        let result = authority.regenerate_join_code(actor, session_id).await;
        observe("regenerate_join_code", authority.source(), result)
    }

    #[instrument(skip(self, grant))]
    pub async fn update_member_permissions(
        &self,
        actor: AccountId,
        session_id: &str,
        member: AccountId,
        grant: PermissionGrant,
    ) -> AccessResult<Sourced<UpdatedMember>> {
        let authority = self.authority().await;
        let result = authority
            .update_member_permissions(actor, session_id, member, grant)
            .await;
        observe("update_member_permissions", authority.source(), result)
    }

    #[instrument(skip(self))]
    pub async fn remove_member(
        &self,
        actor: AccountId,
        session_id: &str,
        member: AccountId,
    ) -> AccessResult<Sourced<Ack>> {
        let authority = self.authority().await;
        let result = authority.remove_member(actor, session_id, member).await;
        observe("remove_member", authority.source(), result)
    }
}

/// Log failures at a level matching their kind.
fn observe<T>(
    operation: &'static str,
    source: AuthoritySource,
    result: AccessResult<Sourced<T>>,
) -> AccessResult<Sourced<T>> {
    if let Err(err) = &result {
        match err.kind() {
            ErrorKind::DelegationFailure | ErrorKind::DelegationUnavailable => {
                warn!(operation, %source, code = err.code(), "Delegated call failed: {}", err)
            }
            ErrorKind::Internal => {
                error!(operation, %source, "Operation failed: {:#}", err)
            }
            _ => debug!(operation, %source, code = err.code(), "Operation refused: {}", err),
        }
    }
    result
}
