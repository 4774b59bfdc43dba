mod common;

use common::{init_agent, TestServer};
use serde_json::Value;

#[tokio::test]
async fn chat_wait_is_released_by_reply_and_leave_ends_the_exchange() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;
    let bob = init_agent(&server.base_url, "demo", "bob").await;

    // Alice opens the conversation and waits for a reply.
    let base = server.base_url.clone();
    let alice_key = alice.api_key.clone();
    let alice_ws = alice.workspace_id.clone();
    let waiter = tokio::spawn(async move {
        let client = reqwest::Client::new();
        let resp: Value = client
            .post(format!("{}/v1/chat/sessions", base))
            .bearer_auth(&alice_key)
            .json(&serde_json::json!({
                "workspace_id": alice_ws,
                "to_aliases": ["bob"],
                "message": "got a minute?",
                "start_conversation": true,
                "wait_seconds": 300,
            }))
            .send()
            .await
            .expect("start chat")
            .json()
            .await
            .expect("start chat body");
        resp
    });

    // Give the wait time to register, then bob replies and leaves.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let pending: Value = client
        .get(format!(
            "{}/v1/chat/pending?workspace_id={}",
            server.base_url, bob.workspace_id
        ))
        .bearer_auth(&bob.api_key)
        .send()
        .await
        .expect("pending")
        .json()
        .await
        .expect("pending body");
    assert_eq!(pending["count"], 1);
    let session_id = pending["sessions"][0]["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    let reply: Value = client
        .post(format!(
            "{}/v1/chat/sessions/{}/messages",
            server.base_url, session_id
        ))
        .bearer_auth(&bob.api_key)
        .json(&serde_json::json!({
            "workspace_id": bob.workspace_id,
            "body": "ok",
            "leaving": true,
            "wait_seconds": 0,
        }))
        .send()
        .await
        .expect("bob reply")
        .json()
        .await
        .expect("bob reply body");
    // Alice was waiting, so bob's send observed a live recipient.
    assert_eq!(reply["delivered"], true);

    // Alice's wait resolves with bob's reply well before the 300 s
    // deadline.
    let started = std::time::Instant::now();
    let resp = waiter.await.expect("waiter join");
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert_eq!(resp["reply"]["from_alias"], "bob");
    assert_eq!(resp["reply"]["body"], "ok");
    assert_eq!(resp["reply"]["leaving"], true);

    // Bob left: a follow-up wait drains to its deadline undelivered.
    let resp: Value = client
        .post(format!(
            "{}/v1/chat/sessions/{}/messages",
            server.base_url, session_id
        ))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({
            "workspace_id": alice.workspace_id,
            "body": "still there?",
            "wait_seconds": 1,
        }))
        .send()
        .await
        .expect("follow-up")
        .json()
        .await
        .expect("follow-up body");
    assert_eq!(resp["delivered"], false);
    assert!(resp["reply"].is_null());
}

#[tokio::test]
async fn zero_wait_returns_immediately_and_history_is_ordered() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let alice = init_agent(&server.base_url, "demo", "alice").await;
    let bob = init_agent(&server.base_url, "demo", "bob").await;

    let started = std::time::Instant::now();
    let first: Value = client
        .post(format!("{}/v1/chat/sessions", server.base_url))
        .bearer_auth(&alice.api_key)
        .json(&serde_json::json!({
            "workspace_id": alice.workspace_id,
            "to_aliases": ["bob"],
            "message": "one",
            "wait_seconds": 0,
        }))
        .send()
        .await
        .expect("first send")
        .json()
        .await
        .expect("first body");
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
    assert_eq!(first["waited"], false);
    let session_id = first["session_id"].as_str().unwrap().to_string();

    // The same pair reuses the session.
    let second: Value = client
        .post(format!("{}/v1/chat/sessions", server.base_url))
        .bearer_auth(&bob.api_key)
        .json(&serde_json::json!({
            "workspace_id": bob.workspace_id,
            "to_aliases": ["alice"],
            "message": "two",
            "wait_seconds": 0,
        }))
        .send()
        .await
        .expect("second send")
        .json()
        .await
        .expect("second body");
    assert_eq!(second["session_id"], session_id.as_str());

    let history: Value = client
        .get(format!(
            "{}/v1/chat/sessions/{}/messages?workspace_id={}",
            server.base_url, session_id, alice.workspace_id
        ))
        .bearer_auth(&alice.api_key)
        .send()
        .await
        .expect("history")
        .json()
        .await
        .expect("history body");
    let bodies: Vec<&str> = history["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["body"].as_str().unwrap())
        .collect();
    assert_eq!(bodies, vec!["one", "two"]);

    // Outsiders cannot read the session.
    let eve = init_agent(&server.base_url, "demo", "eve").await;
    let resp = client
        .get(format!(
            "{}/v1/chat/sessions/{}/messages?workspace_id={}",
            server.base_url, session_id, eve.workspace_id
        ))
        .bearer_auth(&eve.api_key)
        .send()
        .await
        .expect("eve history");
    assert_eq!(resp.status(), 403);
}
