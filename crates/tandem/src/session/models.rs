//! Shared-session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::identity::AccountId;
use crate::permissions::PermissionGrant;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting join requests and membership changes.
    Active,
    /// Closed by its owner; read-only from here on.
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A shareable collaboration scope owned by one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session ID (`ses_...`).
    pub id: String,
    /// Account that created and controls the session.
    pub owner_account_id: AccountId,
    /// Display name.
    pub name: String,
    /// Code other accounts use to ask to join.
    #[serde(default)]
    pub join_code: String,
    /// Current status.
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// When the session was created.
    #[serde(default)]
    pub created_at: String,
    /// When the session was ended.
    pub ended_at: Option<String>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn is_owned_by(&self, account_id: AccountId) -> bool {
        self.owner_account_id == account_id
    }
}

/// Role of an account within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Member,
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberRole::Owner => write!(f, "owner"),
            MemberRole::Member => write!(f, "member"),
        }
    }
}

impl std::str::FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(MemberRole::Owner),
            "member" => Ok(MemberRole::Member),
            _ => Err(format!("unknown member role: {}", s)),
        }
    }
}

impl TryFrom<String> for MemberRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// An account's standing and capability grant within a session.
///
/// Remote authorities may omit the grant and timestamps; those read as
/// deny-all and empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub session_id: String,
    pub account_id: AccountId,
    pub role: MemberRole,
    #[serde(default)]
    pub permissions: PermissionGrant,
    #[serde(default)]
    pub joined_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Membership {
    pub fn is_owner(&self) -> bool {
        self.role == MemberRole::Owner
    }
}

/// Join request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinRequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl JoinRequestStatus {
    /// Accepted and rejected requests never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JoinRequestStatus::Pending)
    }
}

impl std::fmt::Display for JoinRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinRequestStatus::Pending => write!(f, "pending"),
            JoinRequestStatus::Accepted => write!(f, "accepted"),
            JoinRequestStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for JoinRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JoinRequestStatus::Pending),
            "accepted" => Ok(JoinRequestStatus::Accepted),
            "rejected" => Ok(JoinRequestStatus::Rejected),
            _ => Err(format!("unknown join request status: {}", s)),
        }
    }
}

impl TryFrom<String> for JoinRequestStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A request by an account to join a session, kept as an audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Unique request ID (`jrq_...`).
    pub id: String,
    pub session_id: String,
    pub requester_account_id: AccountId,
    pub status: JoinRequestStatus,
    #[serde(default)]
    pub requested_at: String,
    pub decided_at: Option<String>,
    pub decided_by_account_id: Option<AccountId>,
    /// Only set once accepted.
    pub granted_permissions: Option<PermissionGrant>,
}

/// Owner's answer to a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Accept => write!(f, "accept"),
            Decision::Reject => write!(f, "reject"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accept" | "approve" => Ok(Decision::Accept),
            "reject" | "deny" => Ok(Decision::Reject),
            _ => Err(format!("decision must be accept or reject: {}", s)),
        }
    }
}

/// A decision with everything the store needs to apply it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept(PermissionGrant),
    Reject,
}

/// Outcome of applying a verdict: the decided request and, on acceptance,
/// the membership written in the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDecision {
    pub request: JoinRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<Membership>,
}

/// Pending request annotated with the session it targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJoinRequest {
    #[serde(flatten)]
    pub request: JoinRequest,
    pub session_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!("ACTIVE".parse::<SessionStatus>(), Ok(SessionStatus::Active));
        assert!("paused".parse::<SessionStatus>().is_err());
        assert_eq!("approve".parse::<Decision>(), Ok(Decision::Accept));
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JoinRequestStatus::Pending.is_terminal());
        assert!(JoinRequestStatus::Accepted.is_terminal());
        assert!(JoinRequestStatus::Rejected.is_terminal());
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let session = Session {
            id: "ses_1".into(),
            owner_account_id: 1,
            name: "Team".into(),
            join_code: "AB12-CD34".into(),
            status: SessionStatus::Active,
            created_at: "2025-01-01 00:00:00".into(),
            ended_at: None,
        };
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["ownerAccountId"], 1);
        assert_eq!(value["joinCode"], "AB12-CD34");
        assert_eq!(value["status"], "active");
    }

    #[test]
    fn test_sparse_membership_decodes() {
        let member: Membership = serde_json::from_value(serde_json::json!({
            "sessionId": "ses_1",
            "accountId": 2,
            "role": "member",
            "region": "eu-west"
        }))
        .unwrap();
        assert_eq!(member.account_id, 2);
        assert_eq!(member.permissions, PermissionGrant::deny_all());
        assert!(member.joined_at.is_empty());
        assert!(member.updated_at.is_empty());
    }
}
