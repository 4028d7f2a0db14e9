//! Remote authority client.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

use super::types::*;
use super::{AuthoritySource, SessionAuthority, Sourced};
use crate::error::{AccessError, AccessResult};
use crate::identity::AccountId;
use crate::permissions::PermissionGrant;
use crate::session::{Decision, JoinDecision};

/// Connection settings for a remote authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAuthorityConfig {
    /// Base URL, e.g. `https://authority.example.com/api`.
    pub base_url: String,
    /// Bearer credential identifying the caller to the remote.
    pub credential: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl RemoteAuthorityConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(base_url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credential: credential.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinBody<'a> {
    join_code: &'a str,
}

#[derive(Serialize)]
struct DecideBody {
    decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    grant: Option<PermissionGrant>,
}

#[derive(Serialize)]
struct RenameBody<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct PermissionsBody {
    grant: PermissionGrant,
}

/// Authority that forwards every operation to a remote service.
///
/// The remote identifies the caller from the bearer credential, so the
/// local acting account is never sent.
#[derive(Debug, Clone)]
pub struct DelegatingAuthority {
    client: Client,
    base_url: String,
    credential: String,
}

impl DelegatingAuthority {
    pub fn new(config: RemoteAuthorityConfig) -> AccessResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                AccessError::DelegationUnavailable(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credential: config.credential,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn session_path(session_id: &str, suffix: &str) -> String {
        format!("/sessions/{}{}", urlencoding::encode(session_id), suffix)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        debug!(%method, %url, "Delegating to remote authority");
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.credential))
    }

    /// Send a request and decode the relayed result.
    ///
    /// The remote reply is kept verbatim alongside the typed view so fields
    /// this client does not model still reach the caller.
    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> AccessResult<Sourced<T>> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(AccessError::DelegationFailure {
                status: status.as_u16(),
                body,
            });
        }

        let unparseable = |e: serde_json::Error| AccessError::DelegationFailure {
            status: status.as_u16(),
            body: format!("Failed to parse response: {e}"),
        };

        // Acknowledgements may come back without a body.
        let text: &str = if body.trim().is_empty() { "{}" } else { &body };
        let value: Value = serde_json::from_str(text).map_err(unparseable)?;
        let data: T = serde_json::from_value(value.clone()).map_err(unparseable)?;

        Ok(match value {
            Value::Object(map) => Sourced::relayed(data, map),
            _ => Sourced::new(AuthoritySource::Remote, data),
        })
    }
}

fn transport_error(err: reqwest::Error) -> AccessError {
    let reason = if err.is_timeout() {
        "request timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "transport error"
    };
    AccessError::DelegationUnavailable(format!("{reason}: {err}"))
}

#[async_trait]
impl SessionAuthority for DelegatingAuthority {
    fn source(&self) -> AuthoritySource {
        AuthoritySource::Remote
    }

    #[instrument(skip(self))]
    async fn list_sessions(&self, _actor: AccountId) -> AccessResult<Sourced<SessionList>> {
        self.execute(self.request(Method::GET, "/sessions")).await
    }

    #[instrument(skip(self))]
    async fn create_session(
        &self,
        _actor: AccountId,
        name: Option<&str>,
    ) -> AccessResult<Sourced<SessionWithCode>> {
        let request = self
            .request(Method::POST, "/sessions")
            .json(&CreateSessionBody { name });
        self.execute(request).await
    }

    #[instrument(skip(self))]
    async fn request_join(
        &self,
        _actor: AccountId,
        join_code: &str,
    ) -> AccessResult<Sourced<JoinRequested>> {
        let request = self
            .request(Method::POST, "/sessions/join")
            .json(&JoinBody { join_code });
        self.execute(request).await
    }

    #[instrument(skip(self))]
    async fn list_pending_requests(
        &self,
        _actor: AccountId,
    ) -> AccessResult<Sourced<PendingRequests>> {
        self.execute(self.request(Method::GET, "/sessions/requests"))
            .await
    }

    #[instrument(skip(self, grant))]
    async fn decide_join_request(
        &self,
        _actor: AccountId,
        request_id: &str,
        decision: Decision,
        grant: Option<PermissionGrant>,
    ) -> AccessResult<Sourced<JoinDecision>> {
        let path = format!(
            "/sessions/requests/{}/decide",
            urlencoding::encode(request_id)
        );
        let request = self
            .request(Method::POST, &path)
            .json(&DecideBody { decision, grant });
        self.execute(request).await
    }

    #[instrument(skip(self))]
    async fn list_members(
        &self,
        _actor: AccountId,
        session_id: &str,
    ) -> AccessResult<Sourced<SessionMembers>> {
        let path = Self::session_path(session_id, "/members");
        self.execute(self.request(Method::GET, &path)).await
    }

    #[instrument(skip(self))]
    async fn leave_session(
        &self,
        _actor: AccountId,
        session_id: &str,
    ) -> AccessResult<Sourced<Ack>> {
        let path = Self::session_path(session_id, "/leave");
        self.execute(self.request(Method::POST, &path)).await
    }

    #[instrument(skip(self))]
    async fn end_session(&self, _actor: AccountId, session_id: &str) -> AccessResult<Sourced<Ack>> {
        let path = Self::session_path(session_id, "/end");
        self.execute(self.request(Method::POST, &path)).await
    }

    #[instrument(skip(self))]
    async fn rename_session(
        &self,
        _actor: AccountId,
        session_id: &str,
        name: &str,
    ) -> AccessResult<Sourced<RenamedSession>> {
        let path = Self::session_path(session_id, "");
        let request = self
            .request(Method::PATCH, &path)
            .json(&RenameBody { name });
        self.execute(request).await
    }

    #[instrument(skip(self))]
    async fn regenerate_join_code(
        &self,
        _actor: AccountId,
        session_id: &str,
    ) -> AccessResult<Sourced<SessionWithCode>> {
        let path = Self::session_path(session_id, "/join-code");
        self.execute(self.request(Method::POST, &path)).await
    }

    #[instrument(skip(self, grant))]
    async fn update_member_permissions(
        &self,
        _actor: AccountId,
        session_id: &str,
        member: AccountId,
        grant: PermissionGrant,
    ) -> AccessResult<Sourced<UpdatedMember>> {
        let path = Self::session_path(session_id, &format!("/members/{member}/permissions"));
        let request = self
            .request(Method::PUT, &path)
            .json(&PermissionsBody { grant });
        self.execute(request).await
    }

    #[instrument(skip(self))]
    async fn remove_member(
        &self,
        _actor: AccountId,
        session_id: &str,
        member: AccountId,
    ) -> AccessResult<Sourced<Ack>> {
        let path = Self::session_path(session_id, &format!("/members/{member}"));
        self.execute(self.request(Method::DELETE, &path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let authority =
            DelegatingAuthority::new(RemoteAuthorityConfig::new("http://remote.test/api/", "tok"))
                .unwrap();
        assert_eq!(authority.base_url(), "http://remote.test/api");
        assert_eq!(authority.url("/sessions"), "http://remote.test/api/sessions");
    }

    #[test]
    fn test_session_path_encodes_ids() {
        assert_eq!(
            DelegatingAuthority::session_path("ses_a/b", "/members"),
            "/sessions/ses_a%2Fb/members"
        );
        assert_eq!(DelegatingAuthority::session_path("ses_1", ""), "/sessions/ses_1");
    }

    #[test]
    fn test_default_timeout() {
        let config = RemoteAuthorityConfig::new("http://remote.test", "tok");
        assert_eq!(config.timeout, Duration::from_secs(30));
        let config = config.with_timeout(Duration::from_millis(250));
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_decide_body_shape() {
        let body = serde_json::to_value(DecideBody {
            decision: Decision::Accept,
            grant: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"decision": "accept"}));
    }
}
