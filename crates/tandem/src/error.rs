//! Error types for shared-session operations.

use serde::Serialize;
use thiserror::Error;

use crate::identity::AccountId;

/// Result type for gateway and authority operations.
pub type AccessResult<T> = Result<T, AccessError>;

/// Coarse error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    InvalidState,
    NoActiveAccount,
    DelegationFailure,
    DelegationUnavailable,
    Internal,
}

/// Errors returned by the access-control gateway.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Join request not found: {0}")]
    RequestNotFound(String),

    #[error("Account {account_id} is not a member of session {session_id}")]
    MemberNotFound {
        session_id: String,
        account_id: AccountId,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account {0} already owns this session")]
    AlreadyOwner(AccountId),

    #[error("Account {0} is already a member of this session")]
    AlreadyMember(AccountId),

    #[error("Join code conflict: {0}")]
    JoinCodeConflict(String),

    #[error("Only the session owner can do this")]
    NotOwner,

    #[error("Account {0} is not a member of this session")]
    NotMember(AccountId),

    #[error("The owner's membership cannot be modified")]
    CannotModifyOwner,

    #[error("The owner cannot be removed from the session")]
    OwnerCannotBeRemoved,

    #[error("The owner cannot leave; end the session instead")]
    OwnerMustEndSession,

    #[error("Session {0} is not active")]
    SessionNotActive(String),

    #[error("Join request {0} has already been decided")]
    RequestAlreadyDecided(String),

    #[error("No active account is available")]
    NoActiveAccount,

    #[error("Remote authority returned {status}: {body}")]
    DelegationFailure { status: u16, body: String },

    #[error("Remote authority unavailable: {0}")]
    DelegationUnavailable(String),

    #[error("Storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
}

impl AccessError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::SessionNotFound(_)
            | Self::RequestNotFound(_)
            | Self::MemberNotFound { .. }
            | Self::AccountNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyOwner(_) | Self::AlreadyMember(_) | Self::JoinCodeConflict(_) => {
                ErrorKind::Conflict
            }
            Self::NotOwner
            | Self::NotMember(_)
            | Self::CannotModifyOwner
            | Self::OwnerCannotBeRemoved
            | Self::OwnerMustEndSession => ErrorKind::Forbidden,
            Self::SessionNotActive(_) | Self::RequestAlreadyDecided(_) => ErrorKind::InvalidState,
            Self::NoActiveAccount => ErrorKind::NoActiveAccount,
            Self::DelegationFailure { .. } => ErrorKind::DelegationFailure,
            Self::DelegationUnavailable(_) => ErrorKind::DelegationUnavailable,
            Self::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::RequestNotFound(_) => "REQUEST_NOT_FOUND",
            Self::MemberNotFound { .. } => "MEMBER_NOT_FOUND",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::AlreadyOwner(_) => "ALREADY_OWNER",
            Self::AlreadyMember(_) => "ALREADY_MEMBER",
            Self::JoinCodeConflict(_) => "JOIN_CODE_CONFLICT",
            Self::NotOwner => "NOT_OWNER",
            Self::NotMember(_) => "NOT_MEMBER",
            Self::CannotModifyOwner => "CANNOT_MODIFY_OWNER",
            Self::OwnerCannotBeRemoved => "OWNER_CANNOT_BE_REMOVED",
            Self::OwnerMustEndSession => "OWNER_MUST_END_SESSION",
            Self::SessionNotActive(_) => "SESSION_NOT_ACTIVE",
            Self::RequestAlreadyDecided(_) => "REQUEST_ALREADY_DECIDED",
            Self::NoActiveAccount => "NO_ACTIVE_ACCOUNT",
            Self::DelegationFailure { .. } => "DELEGATION_FAILURE",
            Self::DelegationUnavailable(_) => "DELEGATION_UNAVAILABLE",
            Self::Storage(_) => "INTERNAL_ERROR",
        }
    }
}

/// Repository errors arrive as `anyhow` chains; unique-index violations are
/// the only storage failures callers can act on.
impl From<anyhow::Error> for AccessError {
    fn from(err: anyhow::Error) -> Self {
        let unique_violation = err
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .is_some_and(|db| db.is_unique_violation());

        if unique_violation {
            AccessError::JoinCodeConflict(format!("{err:#}"))
        } else {
            AccessError::Storage(err)
        }
    }
}

/// Structured error body used by the CLI in machine-readable mode.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    pub kind: ErrorKind,
}

impl From<&AccessError> for ErrorResponse {
    fn from(err: &AccessError) -> Self {
        Self {
            error: err.to_string(),
            code: err.code(),
            kind: err.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_kinds_follow_taxonomy() {
        assert_eq!(AccessError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(
            AccessError::SessionNotFound("s".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(AccessError::AlreadyMember(2).kind(), ErrorKind::Conflict);
        assert_eq!(AccessError::NotOwner.kind(), ErrorKind::Forbidden);
        assert_eq!(AccessError::CannotModifyOwner.kind(), ErrorKind::Forbidden);
        assert_eq!(
            AccessError::RequestAlreadyDecided("r".into()).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            AccessError::DelegationFailure {
                status: 502,
                body: String::new()
            }
            .kind(),
            ErrorKind::DelegationFailure
        );
    }

    #[test]
    fn test_plain_anyhow_becomes_storage() {
        let err: AccessError = anyhow::anyhow!("disk on fire").into();
        assert!(matches!(err, AccessError::Storage(_)));
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_context_is_kept_in_message() {
        let inner: anyhow::Result<()> = Err(anyhow::anyhow!("locked"));
        let err: AccessError = inner.context("updating session").unwrap_err().into();
        assert!(err.to_string().contains("updating session"));
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn test_error_response_shape() {
        let err = AccessError::OwnerMustEndSession;
        let body = serde_json::to_value(ErrorResponse::from(&err)).unwrap();
        assert_eq!(body["code"], "OWNER_MUST_END_SESSION");
        assert_eq!(body["kind"], "forbidden");
    }
}
