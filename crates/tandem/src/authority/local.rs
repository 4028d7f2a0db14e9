//! Local authority backed by the session store.
//!
//! Session-scoped operations check the caller's standing before the
//! session's status. Join decisions are the exception: the request's own
//! lifecycle (missing, decided, session ended) is reported before ownership.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::types::*;
use super::{AuthoritySource, SessionAuthority, Sourced};
use crate::error::{AccessError, AccessResult};
use crate::identity::AccountId;
use crate::permissions::PermissionGrant;
use crate::session::join_code::normalize_input;
use crate::session::{Decision, JoinDecision, MemberRole, Session, SessionStore, Verdict};

/// Name given to sessions created without one.
pub const DEFAULT_SESSION_NAME: &str = "Shared session";

/// Longest accepted session name, in characters.
pub const MAX_SESSION_NAME_LEN: usize = 64;

fn validate_name(name: &str) -> AccessResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AccessError::validation("session name cannot be empty"));
    }
    if name.chars().count() > MAX_SESSION_NAME_LEN {
        return Err(AccessError::validation(format!(
            "session name cannot exceed {MAX_SESSION_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

fn local<T>(data: T) -> AccessResult<Sourced<T>> {
    Ok(Sourced::new(AuthoritySource::Local, data))
}

/// Authority that serves every operation from local state.
#[derive(Debug, Clone)]
pub struct LocalAuthority {
    store: SessionStore,
}

impl LocalAuthority {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    async fn session(&self, session_id: &str) -> AccessResult<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AccessError::SessionNotFound(session_id.to_string()))
    }

    /// Load a session the actor owns.
    async fn owned_session(&self, actor: AccountId, session_id: &str) -> AccessResult<Session> {
        let session = self.session(session_id).await?;
        if !session.is_owned_by(actor) {
            debug!(session_id, actor, "Refused: caller does not own session");
            return Err(AccessError::NotOwner);
        }
        Ok(session)
    }

    fn require_active(session: &Session) -> AccessResult<()> {
        if session.is_active() {
            Ok(())
        } else {
            Err(AccessError::SessionNotActive(session.id.clone()))
        }
    }
}

#[async_trait]
impl SessionAuthority for LocalAuthority {
    fn source(&self) -> AuthoritySource {
        AuthoritySource::Local
    }

    #[instrument(skip(self))]
    async fn list_sessions(&self, actor: AccountId) -> AccessResult<Sourced<SessionList>> {
        let owned = self
            .store
            .list_owned(actor)
            .await?
            .into_iter()
            .map(|session| SessionView {
                session,
                is_owner: true,
                permissions: PermissionGrant::owner_default(),
            })
            .collect();

        let mut joined = Vec::new();
        for session in self.store.list_joined(actor).await? {
            let permissions = self
                .store
                .get_membership(&session.id, actor)
                .await?
                .map(|m| m.permissions)
                .unwrap_or_default();
            joined.push(SessionView {
                session,
                is_owner: false,
                permissions,
            });
        }

        local(SessionList { owned, joined })
    }

    #[instrument(skip(self))]
    async fn create_session(
        &self,
        actor: AccountId,
        name: Option<&str>,
    ) -> AccessResult<Sourced<SessionWithCode>> {
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => validate_name(name)?,
            None => DEFAULT_SESSION_NAME.to_string(),
        };

        let session = self.store.create_session(actor, &name).await?;
        info!(session_id = %session.id, owner = actor, "Created shared session");

        local(SessionWithCode {
            join_code: session.join_code.clone(),
            session,
        })
    }

    #[instrument(skip(self))]
    async fn request_join(
        &self,
        actor: AccountId,
        join_code: &str,
    ) -> AccessResult<Sourced<JoinRequested>> {
        let code = normalize_input(join_code);
        if code.is_empty() {
            return Err(AccessError::validation("join code cannot be empty"));
        }

        let session = self
            .store
            .find_by_join_code(&code)
            .await?
            .ok_or_else(|| AccessError::SessionNotFound(code.clone()))?;

        if session.is_owned_by(actor) {
            return Err(AccessError::AlreadyOwner(actor));
        }
        if self.store.get_membership(&session.id, actor).await?.is_some() {
            return Err(AccessError::AlreadyMember(actor));
        }

        // The session can end between lookup and insert.
        let (request, created) = self
            .store
            .create_join_request(&session.id, actor)
            .await?
            .ok_or_else(|| AccessError::SessionNotFound(code.clone()))?;

        if created {
            info!(request_id = %request.id, session_id = %session.id, requester = actor, "Join requested");
        } else {
            debug!(request_id = %request.id, "Returning existing pending request");
        }

        local(JoinRequested {
            request,
            already_pending: !created,
        })
    }

    #[instrument(skip(self))]
    async fn list_pending_requests(
        &self,
        actor: AccountId,
    ) -> AccessResult<Sourced<PendingRequests>> {
        let requests = self.store.list_pending_for_owner(actor).await?;
        local(PendingRequests { requests })
    }

    #[instrument(skip(self, grant))]
    async fn decide_join_request(
        &self,
        actor: AccountId,
        request_id: &str,
        decision: Decision,
        grant: Option<PermissionGrant>,
    ) -> AccessResult<Sourced<JoinDecision>> {
        let request = self
            .store
            .get_join_request(request_id)
            .await?
            .ok_or_else(|| AccessError::RequestNotFound(request_id.to_string()))?;
        if request.status.is_terminal() {
            return Err(AccessError::RequestAlreadyDecided(request.id));
        }

        let session = self.session(&request.session_id).await?;
        Self::require_active(&session)?;
        if !session.is_owned_by(actor) {
            debug!(request_id, actor, "Refused: caller does not own session");
            return Err(AccessError::NotOwner);
        }

        let verdict = match decision {
            Decision::Accept => Verdict::Accept(grant.unwrap_or_else(PermissionGrant::member_default)),
            Decision::Reject => Verdict::Reject,
        };

        if let Some(decided) = self
            .store
            .decide_join_request(request_id, verdict, actor)
            .await?
        {
            return local(decided);
        }

        // Lost a race: either another decision landed or the session ended.
        let current = self.store.get_join_request(request_id).await?;
        match current {
            Some(current) if current.status.is_terminal() => {
                Err(AccessError::RequestAlreadyDecided(current.id))
            }
            Some(_) => Err(AccessError::SessionNotActive(session.id)),
            None => Err(AccessError::RequestNotFound(request_id.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn list_members(
        &self,
        actor: AccountId,
        session_id: &str,
    ) -> AccessResult<Sourced<SessionMembers>> {
        let session = self.session(session_id).await?;
        if !session.is_owned_by(actor) && self.store.get_membership(session_id, actor).await?.is_none()
        {
            debug!(session_id, actor, "Refused: caller is not a member");
            return Err(AccessError::NotMember(actor));
        }

        let members = self.store.list_members(session_id).await?;
        local(SessionMembers { session, members })
    }

    #[instrument(skip(self))]
    async fn leave_session(
        &self,
        actor: AccountId,
        session_id: &str,
    ) -> AccessResult<Sourced<Ack>> {
        let session = self.session(session_id).await?;
        if session.is_owned_by(actor) {
            return Err(AccessError::OwnerMustEndSession);
        }
        if self.store.get_membership(session_id, actor).await?.is_none() {
            return Err(AccessError::NotMember(actor));
        }
        Self::require_active(&session)?;

        if !self.store.delete_membership(session_id, actor).await? {
            return Err(AccessError::NotMember(actor));
        }
        info!(session_id, account_id = actor, "Member left session");
        local(Ack::ok())
    }

    #[instrument(skip(self))]
    async fn end_session(&self, actor: AccountId, session_id: &str) -> AccessResult<Sourced<Ack>> {
        let session = self.owned_session(actor, session_id).await?;
        if !self.store.end_session(&session.id).await? {
            return Err(AccessError::SessionNotActive(session.id));
        }
        info!(session_id, "Ended shared session");
        local(Ack::ok())
    }

    #[instrument(skip(self))]
    async fn rename_session(
        &self,
        actor: AccountId,
        session_id: &str,
        name: &str,
    ) -> AccessResult<Sourced<RenamedSession>> {
        let name = validate_name(name)?;
        let session = self.owned_session(actor, session_id).await?;
        if !self.store.rename_session(&session.id, &name).await? {
            return Err(AccessError::SessionNotActive(session.id));
        }

        let session = self.session(session_id).await?;
        local(RenamedSession { session })
    }

    #[instrument(skip(self))]
    async fn regenerate_join_code(
        &self,
        actor: AccountId,
        session_id: &str,
    ) -> AccessResult<Sourced<SessionWithCode>> {
        let session = self.owned_session(actor, session_id).await?;
        Self::require_active(&session)?;

        let Some(join_code) = self.store.regenerate_join_code(&session.id).await? else {
            return Err(AccessError::SessionNotActive(session.id));
        };
        info!(session_id, "Regenerated join code");

        let session = self.session(session_id).await?;
        local(SessionWithCode { session, join_code })
    }

    #[instrument(skip(self, grant))]
    async fn update_member_permissions(
        &self,
        actor: AccountId,
        session_id: &str,
        member: AccountId,
        grant: PermissionGrant,
    ) -> AccessResult<Sourced<UpdatedMember>> {
        let session = self.owned_session(actor, session_id).await?;
        if session.is_owned_by(member) {
            return Err(AccessError::CannotModifyOwner);
        }
        Self::require_active(&session)?;
        if self.store.get_membership(session_id, member).await?.is_none() {
            return Err(AccessError::MemberNotFound {
                session_id: session.id,
                account_id: member,
            });
        }

        let member = self
            .store
            .upsert_membership(session_id, member, MemberRole::Member, &grant)
            .await?;
        info!(session_id, account_id = member.account_id, "Updated member permissions");
        local(UpdatedMember { member })
    }

    #[instrument(skip(self))]
    async fn remove_member(
        &self,
        actor: AccountId,
        session_id: &str,
        member: AccountId,
    ) -> AccessResult<Sourced<Ack>> {
        let session = self.owned_session(actor, session_id).await?;
        if session.is_owned_by(member) {
            return Err(AccessError::OwnerCannotBeRemoved);
        }
        Self::require_active(&session)?;

        if !self.store.delete_membership(session_id, member).await? {
            return Err(AccessError::MemberNotFound {
                session_id: session.id,
                account_id: member,
            });
        }
        info!(session_id, account_id = member, "Removed member");
        local(Ack::ok())
    }
}
