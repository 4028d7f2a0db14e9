//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tandem::permissions::PermissionGrant;
use tandem::{AccessControlGateway, AccountId, Database};

pub const OWNER: AccountId = 1;
pub const MEMBER: AccountId = 2;
pub const OUTSIDER: AccountId = 3;

/// Gateway over a fresh in-memory database.
pub async fn test_gateway() -> AccessControlGateway {
    let db = Database::in_memory()
        .await
        .expect("Failed to open in-memory database");
    AccessControlGateway::new(&db)
}

/// Create a session owned by `owner` and bring `member` in with `grant`.
pub async fn session_with_member(
    gateway: &AccessControlGateway,
    owner: AccountId,
    member: AccountId,
    grant: Option<PermissionGrant>,
) -> String {
    let created = gateway
        .create_session(owner, Some("Team"))
        .await
        .expect("create session");
    let join_code = created.data.join_code;
    let session_id = created.data.session.id;

    let requested = gateway
        .request_join(member, &join_code)
        .await
        .expect("request join");
    gateway
        .decide_join_request(
            owner,
            &requested.data.request.id,
            tandem::session::Decision::Accept,
            grant,
        )
        .await
        .expect("accept join request");

    session_id
}

/// A request seen by the fake remote authority.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub body: Value,
    pub authorization: Option<String>,
}

/// Minimal stand-in for a remote authority.
///
/// Replies with canned payloads keyed by method and path and records every
/// request it receives.
#[derive(Clone, Default)]
pub struct FakeRemote {
    recorded: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeRemote {
    pub fn recorded(&self) -> Vec<Recorded> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn last(&self) -> Recorded {
        self.recorded().pop().expect("no request recorded")
    }
}

/// Serve a [`FakeRemote`] on an ephemeral local port.
pub async fn spawn_fake_remote() -> (FakeRemote, String) {
    let remote = FakeRemote::default();
    let app = Router::new()
        .fallback(handle_fake)
        .with_state(remote.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake remote");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve fake remote");
    });

    (remote, format!("http://{addr}/api"))
}

/// Address of a port nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway listener");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}

async fn handle_fake(
    State(remote): State<FakeRemote>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = uri
        .path()
        .strip_prefix("/api")
        .unwrap_or(uri.path())
        .to_string();
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    remote.recorded.lock().unwrap().push(Recorded {
        method: method.clone(),
        path: path.clone(),
        body: serde_json::from_str(&body).unwrap_or(Value::Null),
        authorization,
    });

    if path.contains("ses_slow") {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    if path.contains("ses_denied") {
        return (StatusCode::FORBIDDEN, "not your session").into_response();
    }

    let reply = match (method.as_str(), path.as_str()) {
        ("GET", "/sessions") => json!({
            "owned": [view()],
            "joined": [],
        }),
        ("POST", "/sessions") => json!({"session": session(), "joinCode": "AAAA-BBBB"}),
        ("POST", "/sessions/join") => json!({"request": request("pending"), "alreadyPending": false}),
        ("GET", "/sessions/requests") => json!({
            "requests": [pending()],
        }),
        ("POST", "/sessions/requests/jrq_remote/decide") => json!({
            "request": request("accepted"),
            "member": member(),
        }),
        ("GET", "/sessions/ses_remote/members") => json!({
            "session": session(),
            "members": [member()],
        }),
        ("POST", "/sessions/ses_remote/leave") => return StatusCode::OK.into_response(),
        ("POST", "/sessions/ses_remote/end") => json!({"ok": true}),
        ("PATCH", "/sessions/ses_remote") => json!({"session": session(), "etag": "w/17"}),
        ("POST", "/sessions/ses_remote/join-code") => {
            json!({"session": session(), "joinCode": "CCCC-DDDD"})
        }
        ("PUT", "/sessions/ses_remote/members/8/permissions") => json!({"member": member()}),
        ("DELETE", "/sessions/ses_remote/members/8") => {
            return StatusCode::NO_CONTENT.into_response();
        }
        ("GET", "/sessions/ses_sparse/members") => json!({
            "session": session(),
            "members": [{
                "sessionId": "ses_remote",
                "accountId": 8,
                "role": "member",
                "region": "eu-west",
            }],
            "total": 1,
        }),
        ("GET", "/sessions/ses_garbled/members") => {
            return (StatusCode::OK, "<html>oops</html>").into_response();
        }
        _ => return (StatusCode::NOT_FOUND, "no such route").into_response(),
    };

    (StatusCode::OK, reply.to_string()).into_response()
}

fn session() -> Value {
    json!({
        "id": "ses_remote",
        "ownerAccountId": 7,
        "name": "Remote team",
        "joinCode": "AAAA-BBBB",
        "status": "active",
        "createdAt": "2025-01-01 00:00:00",
        "endedAt": null,
    })
}

fn view() -> Value {
    let mut view = session();
    view["isOwner"] = json!(true);
    view["permissions"] = json!({"servers": {"view": true}});
    view
}

fn request(status: &str) -> Value {
    json!({
        "id": "jrq_remote",
        "sessionId": "ses_remote",
        "requesterAccountId": 8,
        "status": status,
        "requestedAt": "2025-01-01 00:00:00",
        "decidedAt": null,
        "decidedByAccountId": null,
        "grantedPermissions": null,
    })
}

fn pending() -> Value {
    let mut pending = request("pending");
    pending["sessionName"] = json!("Remote team");
    pending
}

fn member() -> Value {
    json!({
        "sessionId": "ses_remote",
        "accountId": 8,
        "role": "member",
        "permissions": {"servers": {"view": true, "control": true}},
        "joinedAt": "2025-01-01 00:00:00",
        "updatedAt": "2025-01-01 00:00:00",
    })
}
