mod common;

use beadhub::auth::{sign_context, PrincipalType};
use common::{init_agent, TestServer};
use serde_json::Value;
use uuid::Uuid;

const SECRET: &str = "proxy-test-secret";

fn public_reader_headers(project_id: &str) -> Vec<(&'static str, String)> {
    let actor_id = Uuid::new_v4().to_string();
    let signed = sign_context(
        SECRET,
        project_id,
        PrincipalType::PublicReader,
        &actor_id,
        &actor_id,
    );
    vec![
        ("X-BH-Auth", signed),
        ("X-Project-ID", project_id.to_string()),
        ("X-Aweb-Actor-ID", actor_id),
    ]
}

fn make_project_public(server: &TestServer, project_id: &str) {
    let conn = rusqlite::Connection::open(server.db_path()).expect("open db");
    conn.execute(
        "UPDATE server_projects SET visibility = 'public' WHERE id = ?1",
        rusqlite::params![project_id],
    )
    .expect("flip visibility");
}

#[tokio::test]
async fn public_reader_sees_aliases_but_no_pii_and_cannot_write() {
    let server = TestServer::start_with_env(&[("INTERNAL_AUTH_SECRET", SECRET)]).await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;
    make_project_public(&server, &alice.project_id);

    let mut request = client.get(format!("{}/v1/workspaces", server.base_url));
    for (name, value) in public_reader_headers(&alice.project_id) {
        request = request.header(name, value);
    }
    let resp = request.send().await.expect("public list");
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.expect("public list body");
    let workspace = &body["workspaces"][0];
    assert_eq!(workspace["alias"], "alice");
    assert!(workspace.get("human_name").is_none());
    assert!(workspace.get("hostname").is_none());

    // Writes from the public reader are refused.
    let mut request = client
        .post(format!("{}/v1/claims", server.base_url))
        .json(&serde_json::json!({
            "workspace_id": alice.workspace_id,
            "bead_id": "bd-1",
        }));
    for (name, value) in public_reader_headers(&alice.project_id) {
        request = request.header(name, value);
    }
    let resp = request.send().await.expect("public write");
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn public_reader_is_refused_on_private_projects() {
    let server = TestServer::start_with_env(&[("INTERNAL_AUTH_SECRET", SECRET)]).await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;

    let mut request = client.get(format!("{}/v1/workspaces", server.base_url));
    for (name, value) in public_reader_headers(&alice.project_id) {
        request = request.header(name, value);
    }
    let resp = request.send().await.expect("private list");
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn tampered_proxy_context_is_unauthenticated() {
    let server = TestServer::start_with_env(&[("INTERNAL_AUTH_SECRET", SECRET)]).await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;
    make_project_public(&server, &alice.project_id);

    let other_project = Uuid::new_v4().to_string();
    let mut headers = public_reader_headers(&alice.project_id);
    // Point the mirror header at a different project than the signature.
    headers[1] = ("X-Project-ID", other_project);

    let mut request = client.get(format!("{}/v1/workspaces", server.base_url));
    for (name, value) in headers {
        request = request.header(name, value);
    }
    let resp = request.send().await.expect("tampered");
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn proxy_headers_without_secret_fall_back_to_bearer() {
    // No INTERNAL_AUTH_SECRET: client-supplied internal headers are
    // ignored, not trusted.
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;

    let mut request = client.get(format!("{}/v1/workspaces", server.base_url));
    for (name, value) in public_reader_headers(&alice.project_id) {
        request = request.header(name, value);
    }
    // Headers alone (no bearer key) leave the request unauthenticated.
    let resp = request.send().await.expect("no secret");
    assert_eq!(resp.status(), 401);

    // With a bearer key the same request succeeds as the key's identity.
    let mut request = client
        .get(format!("{}/v1/workspaces", server.base_url))
        .bearer_auth(&alice.api_key);
    for (name, value) in public_reader_headers(&alice.project_id) {
        request = request.header(name, value);
    }
    let resp = request.send().await.expect("bearer fallback");
    assert!(resp.status().is_success());
}
