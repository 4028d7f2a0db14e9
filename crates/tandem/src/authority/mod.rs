//! Session authorities.
//!
//! The [`SessionAuthority`] trait is the full operation set over shared
//! sessions. Two implementations exist:
//!
//! - [`LocalAuthority`] enforces ownership and membership rules against the
//!   local [`SessionStore`](crate::session::SessionStore).
//! - [`DelegatingAuthority`] forwards every operation to a remote authority
//!   over HTTP and never touches local state.
//!
//! The gateway decides per call which one serves the request.

mod delegating;
mod local;
mod types;

pub use delegating::{DelegatingAuthority, RemoteAuthorityConfig};
pub use local::{DEFAULT_SESSION_NAME, LocalAuthority, MAX_SESSION_NAME_LEN};
pub use types::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::AccessResult;
use crate::identity::AccountId;
use crate::permissions::PermissionGrant;
use crate::session::{Decision, JoinDecision};

/// Which authority produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthoritySource {
    Local,
    Remote,
}

impl std::fmt::Display for AuthoritySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthoritySource::Local => write!(f, "local"),
            AuthoritySource::Remote => write!(f, "remote"),
        }
    }
}

/// A result tagged with the authority that produced it.
///
/// Delegated results keep the remote body exactly as received; it is what
/// gets serialised, with `source` added. `data` is the typed view of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub source: AuthoritySource,
    pub data: T,
    relayed: Option<Map<String, Value>>,
}

impl<T> Sourced<T> {
    pub fn new(source: AuthoritySource, data: T) -> Self {
        Self {
            source,
            data,
            relayed: None,
        }
    }

    /// Result decoded from a remote body that is relayed unchanged.
    pub fn relayed(data: T, mut body: Map<String, Value>) -> Self {
        body.remove("source");
        Self {
            source: AuthoritySource::Remote,
            data,
            relayed: Some(body),
        }
    }

    /// The remote body, when this result was delegated.
    pub fn relayed_body(&self) -> Option<&Map<String, Value>> {
        self.relayed.as_ref()
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T: Serialize> Serialize for Sourced<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Tagged<'a, D> {
            source: AuthoritySource,
            #[serde(flatten)]
            data: &'a D,
        }

        match &self.relayed {
            Some(body) => Tagged {
                source: self.source,
                data: body,
            }
            .serialize(serializer),
            None => Tagged {
                source: self.source,
                data: &self.data,
            }
            .serialize(serializer),
        }
    }
}

/// The operation set every authority serves.
///
/// `actor` is the acting account resolved by the caller. Remote authorities
/// identify the caller from their credential instead.
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    fn source(&self) -> AuthoritySource;

    async fn list_sessions(&self, actor: AccountId) -> AccessResult<Sourced<SessionList>>;

    async fn create_session(
        &self,
        actor: AccountId,
        name: Option<&str>,
    ) -> AccessResult<Sourced<SessionWithCode>>;

    async fn request_join(
        &self,
        actor: AccountId,
        join_code: &str,
    ) -> AccessResult<Sourced<JoinRequested>>;

    async fn list_pending_requests(
        &self,
        actor: AccountId,
    ) -> AccessResult<Sourced<PendingRequests>>;

    /// Decide a pending request. `grant` only applies to acceptance.
    async fn decide_join_request(
        &self,
        actor: AccountId,
        request_id: &str,
        decision: Decision,
        grant: Option<PermissionGrant>,
    ) -> AccessResult<Sourced<JoinDecision>>;

    async fn list_members(
        &self,
        actor: AccountId,
        session_id: &str,
    ) -> AccessResult<Sourced<SessionMembers>>;

    async fn leave_session(&self, actor: AccountId, session_id: &str)
    -> AccessResult<Sourced<Ack>>;

    async fn end_session(&self, actor: AccountId, session_id: &str)
    -> AccessResult<Sourced<Ack>>;

    async fn rename_session(
        &self,
        actor: AccountId,
        session_id: &str,
        name: &str,
    ) -> AccessResult<Sourced<RenamedSession>>;

    async fn regenerate_join_code(
        &self,
        actor: AccountId,
        session_id: &str,
    ) -> AccessResult<Sourced<SessionWithCode>>;

    async fn update_member_permissions(
        &self,
        actor: AccountId,
        session_id: &str,
        member: AccountId,
        grant: PermissionGrant,
    ) -> AccessResult<Sourced<UpdatedMember>>;

    async fn remove_member(
        &self,
        actor: AccountId,
        session_id: &str,
        member: AccountId,
    ) -> AccessResult<Sourced<Ack>>;
}
