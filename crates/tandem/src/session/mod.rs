//! Shared session module.
//!
//! Persists sessions, their memberships and the join requests that lead to
//! membership, and generates the join codes sessions are shared by.

pub mod join_code;
mod models;
mod repository;

pub use models::{
    Decision, JoinDecision, JoinRequest, JoinRequestStatus, MemberRole, Membership,
    PendingJoinRequest, Session, SessionStatus, Verdict,
};
pub use repository::SessionStore;
