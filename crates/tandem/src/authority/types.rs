//! Operation results shared by every authority.
//!
//! These shapes are also the remote wire format, so they derive both
//! `Serialize` and `Deserialize` with camelCase keys.

use serde::{Deserialize, Serialize};

use crate::permissions::PermissionGrant;
use crate::session::{JoinRequest, Membership, PendingJoinRequest, Session};

/// Session annotated with the caller's standing in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    #[serde(default)]
    pub is_owner: bool,
    /// The caller's own grant in this session.
    #[serde(default)]
    pub permissions: PermissionGrant,
}

/// Sessions the caller owns and sessions it has joined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionList {
    #[serde(default)]
    pub owned: Vec<SessionView>,
    #[serde(default)]
    pub joined: Vec<SessionView>,
}

/// A session together with its (new) join code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWithCode {
    pub session: Session,
    pub join_code: String,
}

/// Result of asking to join a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequested {
    pub request: JoinRequest,
    /// True when an earlier pending request was returned unchanged.
    #[serde(default)]
    pub already_pending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequests {
    #[serde(default)]
    pub requests: Vec<PendingJoinRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMembers {
    pub session: Session,
    #[serde(default)]
    pub members: Vec<Membership>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamedSession {
    pub session: Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedMember {
    pub member: Membership,
}

/// Acknowledgement for operations without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default = "acknowledged")]
    pub ok: bool,
}

fn acknowledged() -> bool {
    true
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}
