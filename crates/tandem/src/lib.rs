//! Shared-session access control.
//!
//! An owner shares a session through a join code, other accounts ask to
//! join, and the owner accepts them with a capability grant. Every
//! operation goes through [`AccessControlGateway`], which serves it from the
//! local store or forwards it to a configured remote authority.

pub mod authority;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod permissions;
pub mod session;

pub use authority::{AuthoritySource, RemoteAuthorityConfig, SessionAuthority, Sourced};
pub use db::Database;
pub use error::{AccessError, AccessResult, ErrorKind, ErrorResponse};
pub use gateway::AccessControlGateway;
pub use identity::{Account, AccountId, IdentityResolver};
pub use permissions::{Capability, PermissionGrant};
