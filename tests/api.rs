mod common;

use common::{init_agent, TestServer};
use serde_json::Value;

#[tokio::test]
async fn health_reports_ok() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .expect("health");
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.expect("health body");
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn init_is_idempotent_and_aliases_collide() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let alice = init_agent(&server.base_url, "demo", "alice").await;

    // Same alias against the same repo: same workspace, fresh key.
    let resp: Value = client
        .post(format!("{}/v1/init", server.base_url))
        .json(&serde_json::json!({
            "project_slug": "demo",
            "alias": "alice",
            "human_name": "Alice Human",
            "repo_origin": "git@github.com:acme/widgets.git",
        }))
        .send()
        .await
        .expect("re-init")
        .json()
        .await
        .expect("re-init body");
    assert_eq!(resp["workspace_id"], alice.workspace_id.as_str());
    assert_eq!(resp["created"], false);

    // Same alias, different repo: conflict.
    let resp = client
        .post(format!("{}/v1/init", server.base_url))
        .json(&serde_json::json!({
            "project_slug": "demo",
            "alias": "alice",
            "human_name": "Impostor",
            "repo_origin": "https://github.com/acme/other.git",
        }))
        .send()
        .await
        .expect("conflicting init");
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.expect("conflict body");
    assert_eq!(body["code"], "conflict");

    // With suggest_alias the server walks to the next free alias.
    let resp: Value = client
        .post(format!("{}/v1/init", server.base_url))
        .json(&serde_json::json!({
            "project_slug": "demo",
            "alias": "alice",
            "suggest_alias": true,
            "human_name": "Second Alice",
            "repo_origin": "https://github.com/acme/other.git",
        }))
        .send()
        .await
        .expect("suggested init")
        .json()
        .await
        .expect("suggested body");
    assert_eq!(resp["alias"], "alice-2");
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/v1/workspaces", server.base_url))
        .send()
        .await
        .expect("list without auth");
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("{}/v1/workspaces", server.base_url))
        .bearer_auth("aw_sk_0000000000000000000000000000000000000000000")
        .send()
        .await
        .expect("list with bogus key");
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn claim_conflict_reports_claimants() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;
    let bob = init_agent(&server.base_url, "demo", "bob").await;

    // Alice claims bd-12 through a sync snapshot.
    let resp = client
        .post(format!("{}/v1/bdh/sync", server.base_url))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({
            "workspace_id": alice.workspace_id,
            "alias": "alice",
            "human_name": "Alice Human",
            "repo_origin": "https://github.com/acme/widgets.git",
            "sync_mode": "incremental",
            "claims_snapshot": [{"bead_id": "bd-12"}],
        }))
        .send()
        .await
        .expect("alice sync");
    assert!(resp.status().is_success(), "sync failed: {:?}", resp.text().await);

    // Bob's plain claim is rejected with the holder's alias.
    let resp = client
        .post(format!("{}/v1/claims", server.base_url))
        .bearer_auth(&bob.api_key)
        .json(&serde_json::json!({
            "workspace_id": bob.workspace_id,
            "bead_id": "bd-12",
        }))
        .send()
        .await
        .expect("bob claim");
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.expect("conflict body");
    assert_eq!(body["detail"], "bd-12 is claimed by alice");
    assert_eq!(body["code"], "conflict");
    assert_eq!(body["fields"]["claimants"][0]["alias"], "alice");

    // Jump-in joins instead.
    let resp = client
        .post(format!("{}/v1/claims", server.base_url))
        .bearer_auth(&bob.api_key)
        .json(&serde_json::json!({
            "workspace_id": bob.workspace_id,
            "bead_id": "bd-12",
            "jump_in": true,
        }))
        .send()
        .await
        .expect("bob jump-in");
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.expect("jump-in body");
    assert_eq!(body["co_claimants"][0], "alice");

    // The status endpoint now reports the conflict.
    let body: Value = client
        .get(format!("{}/v1/status", server.base_url))
        .bearer_auth(&alice.api_key)
        .send()
        .await
        .expect("status")
        .json()
        .await
        .expect("status body");
    assert_eq!(body["conflicts"][0]["bead_id"], "bd-12");
    assert_eq!(body["conflicts"][0]["claimants"].as_array().unwrap().len(), 2);
}

fn issue_jsonl(bead_id: &str, status: &str) -> String {
    serde_json::json!({
        "id": bead_id,
        "title": "widget polish",
        "status": status,
        "priority": 1,
    })
    .to_string()
}

#[tokio::test]
async fn status_change_notifies_subscriber_and_ack_is_idempotent() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;
    let charlie = init_agent(&server.base_url, "demo", "charlie").await;

    let resp = client
        .post(format!("{}/v1/subscriptions", server.base_url))
        .bearer_auth(&charlie.api_key)
        .json(&serde_json::json!({
            "workspace_id": charlie.workspace_id,
            "bead_id": "bd-42",
            "event_types": ["status_change"],
        }))
        .send()
        .await
        .expect("subscribe");
    assert!(resp.status().is_success());

    for status in ["open", "in_progress"] {
        let resp = client
            .post(format!("{}/v1/bdh/sync", server.base_url))
            .bearer_auth(&alice.api_key)
            .json(&serde_json::json!({
                "workspace_id": alice.workspace_id,
                "alias": "alice",
                "human_name": "Alice Human",
                "repo_origin": "https://github.com/acme/widgets.git",
                "issues_jsonl": issue_jsonl("bd-42", status),
            }))
            .send()
            .await
            .expect("sync");
        assert!(resp.status().is_success());
    }

    // Within 5 s the dispatcher lands one unread mail in charlie's inbox.
    let mut message_id = None;
    for _ in 0..50 {
        let body: Value = client
            .get(format!(
                "{}/v1/messages/inbox?workspace_id={}&unread_only=true",
                server.base_url, charlie.workspace_id
            ))
            .bearer_auth(&charlie.api_key)
            .send()
            .await
            .expect("inbox")
            .json()
            .await
            .expect("inbox body");
        let messages = body["messages"].as_array().expect("messages").clone();
        if !messages.is_empty() {
            let mail = &messages[0];
            assert!(mail["body"].as_str().unwrap().contains("bd-42"));
            assert!(mail["body"]
                .as_str()
                .unwrap()
                .contains("open -> in_progress"));
            message_id = Some(mail["id"].as_str().unwrap().to_string());
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    let message_id = message_id.expect("notification mail within 5s");

    let first: Value = client
        .post(format!(
            "{}/v1/messages/{}/ack",
            server.base_url, message_id
        ))
        .bearer_auth(&charlie.api_key)
        .json(&serde_json::json!({"workspace_id": charlie.workspace_id}))
        .send()
        .await
        .expect("first ack")
        .json()
        .await
        .expect("first ack body");
    assert_eq!(first["read"], true);

    let second: Value = client
        .post(format!(
            "{}/v1/messages/{}/ack",
            server.base_url, message_id
        ))
        .bearer_auth(&charlie.api_key)
        .json(&serde_json::json!({"workspace_id": charlie.workspace_id}))
        .send()
        .await
        .expect("second ack")
        .json()
        .await
        .expect("second ack body");
    assert_eq!(second["read_at"], first["read_at"]);
}

#[tokio::test]
async fn policy_versions_race_with_optimistic_concurrency() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;

    // Bootstraps version 1.
    let active: Value = client
        .get(format!("{}/v1/policies/active", server.base_url))
        .bearer_auth(&alice.api_key)
        .send()
        .await
        .expect("active")
        .json()
        .await
        .expect("active body");
    assert_eq!(active["version"], 1);
    let base = active["policy_id"].as_str().unwrap().to_string();

    let bundle = |title: &str| {
        serde_json::json!({
            "invariants": [{"id": "inv-1", "title": title, "body_md": "body"}],
            "roles": {},
            "adapters": {},
        })
    };

    let first: Value = client
        .post(format!("{}/v1/policies", server.base_url))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({"bundle": bundle("first"), "base_policy_id": base}))
        .send()
        .await
        .expect("first create")
        .json()
        .await
        .expect("first create body");
    assert_eq!(first["version"], 2);
    assert_eq!(first["created"], true);

    // Second writer raced on the same base and loses.
    let resp = client
        .post(format!("{}/v1/policies", server.base_url))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({"bundle": bundle("second"), "base_policy_id": base}))
        .send()
        .await
        .expect("second create");
    assert_eq!(resp.status(), 409);

    // Activate v2, then re-posting the identical bundle is idempotent.
    let policy_id = first["policy_id"].as_str().unwrap();
    let resp = client
        .post(format!(
            "{}/v1/policies/{}/activate",
            server.base_url, policy_id
        ))
        .bearer_auth(&alice.api_key)
        .send()
        .await
        .expect("activate");
    assert!(resp.status().is_success());

    let repeat: Value = client
        .post(format!("{}/v1/policies", server.base_url))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({"bundle": bundle("first"), "base_policy_id": policy_id}))
        .send()
        .await
        .expect("repeat create")
        .json()
        .await
        .expect("repeat body");
    assert_eq!(repeat["created"], false);
    assert_eq!(repeat["policy_id"], first["policy_id"]);
}

#[tokio::test]
async fn reservations_warn_then_expire() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;
    let bob = init_agent(&server.base_url, "demo", "bob").await;

    let resp = client
        .post(format!("{}/v1/reservations", server.base_url))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({
            "workspace_id": alice.workspace_id,
            "paths": ["src/x.py"],
            "ttl_seconds": 1,
        }))
        .send()
        .await
        .expect("reserve");
    assert!(resp.status().is_success());

    let check: Value = client
        .post(format!("{}/v1/bdh/check", server.base_url))
        .bearer_auth(&bob.api_key)
        .json(&serde_json::json!({
            "workspace_id": bob.workspace_id,
            "alias": "bob",
            "command": "update",
            "paths": ["src/x.py"],
        }))
        .send()
        .await
        .expect("check")
        .json()
        .await
        .expect("check body");
    assert_eq!(check["paths"][0]["decision"], "warn");
    assert_eq!(check["paths"][0]["holder"], "alice");

    // After the TTL the path is free again.
    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
    let check: Value = client
        .post(format!("{}/v1/bdh/check", server.base_url))
        .bearer_auth(&bob.api_key)
        .json(&serde_json::json!({
            "workspace_id": bob.workspace_id,
            "alias": "bob",
            "command": "update",
            "paths": ["src/x.py"],
        }))
        .send()
        .await
        .expect("second check")
        .json()
        .await
        .expect("second check body");
    assert_eq!(check["paths"][0]["decision"], "allow");
}

#[tokio::test]
async fn mail_body_bounds_are_enforced() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;
    let _bob = init_agent(&server.base_url, "demo", "bob").await;

    let send = |body: String| {
        let client = client.clone();
        let base = server.base_url.clone();
        let key = alice.api_key.clone();
        let ws = alice.workspace_id.clone();
        async move {
            client
                .post(format!("{}/v1/messages", base))
                .bearer_auth(&key)
                .json(&serde_json::json!({
                    "workspace_id": ws,
                    "to_alias": "bob",
                    "subject": "bounds",
                    "body": body,
                }))
                .send()
                .await
                .expect("send")
        }
    };

    assert_eq!(send(String::new()).await.status(), 400);
    assert_eq!(send("x".repeat(64 * 1024 + 1)).await.status(), 400);
    assert!(send("hello".to_string()).await.status().is_success());
}

#[tokio::test]
async fn workspace_bindings_are_immutable_and_aliases_recycle() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;

    // Immutable field change fails with 412.
    let resp = client
        .patch(format!(
            "{}/v1/workspaces/{}",
            server.base_url, alice.workspace_id
        ))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({"alias": "alice-renamed"}))
        .send()
        .await
        .expect("patch alias");
    assert_eq!(resp.status(), 412);

    // Mutable fields patch fine.
    let resp = client
        .patch(format!(
            "{}/v1/workspaces/{}",
            server.base_url, alice.workspace_id
        ))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({"role": "implementer", "current_branch": "main"}))
        .send()
        .await
        .expect("patch role");
    assert!(resp.status().is_success());

    // Soft-delete frees the alias for reuse.
    let resp = client
        .delete(format!(
            "{}/v1/workspaces/{}",
            server.base_url, alice.workspace_id
        ))
        .bearer_auth(&alice.api_key)
        .send()
        .await
        .expect("delete");
    assert!(resp.status().is_success());

    let alice2 = init_agent(&server.base_url, "demo", "alice").await;
    assert_ne!(alice2.workspace_id, alice.workspace_id);

    // Restoring the original now conflicts with the reuse.
    let resp = client
        .post(format!(
            "{}/v1/workspaces/{}/restore",
            server.base_url, alice.workspace_id
        ))
        .bearer_auth(&alice.api_key)
        .send()
        .await
        .expect("restore");
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn actor_binding_rejects_cross_workspace_writes() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;
    let bob = init_agent(&server.base_url, "demo", "bob").await;

    // Alice's key cannot act as bob.
    let resp = client
        .post(format!("{}/v1/claims", server.base_url))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({
            "workspace_id": bob.workspace_id,
            "bead_id": "bd-1",
        }))
        .send()
        .await
        .expect("cross-workspace claim");
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn tenant_isolation_hides_other_projects() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;
    let eve = init_agent(&server.base_url, "other", "eve").await;
    assert_ne!(alice.project_id, eve.project_id);

    // Alice syncs an issue into demo.
    let resp = client
        .post(format!("{}/v1/bdh/sync", server.base_url))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({
            "workspace_id": alice.workspace_id,
            "alias": "alice",
            "human_name": "Alice Human",
            "repo_origin": "https://github.com/acme/widgets.git",
            "issues_jsonl": issue_jsonl("bd-9", "open"),
        }))
        .send()
        .await
        .expect("sync");
    assert!(resp.status().is_success());

    // Eve sees no demo issues or workspaces.
    let body: Value = client
        .get(format!("{}/v1/beads/issues", server.base_url))
        .bearer_auth(&eve.api_key)
        .send()
        .await
        .expect("eve issues")
        .json()
        .await
        .expect("eve issues body");
    assert!(body["issues"].as_array().unwrap().is_empty());

    let resp = client
        .get(format!(
            "{}/v1/beads/issues/{}",
            server.base_url, "bd-9"
        ))
        .bearer_auth(&eve.api_key)
        .send()
        .await
        .expect("eve issue get");
    assert_eq!(resp.status(), 404);

    let body: Value = client
        .get(format!("{}/v1/workspaces", server.base_url))
        .bearer_auth(&eve.api_key)
        .send()
        .await
        .expect("eve workspaces")
        .json()
        .await
        .expect("eve workspaces body");
    let aliases: Vec<&str> = body["workspaces"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["alias"].as_str().unwrap())
        .collect();
    assert_eq!(aliases, vec!["eve"]);
}
