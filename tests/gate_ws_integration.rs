//! Integration tests for the gate WebSocket + REST server.
//!
//! Each test spins up an Axum server on a random port, connects via
//! tokio-tungstenite, and exercises the real WS contract.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use ops_assist::audit::Actor;
use ops_assist::decision::Decision;
use ops_assist::gate::ApprovalGate;
use ops_assist::gate::routes::gate_routes;
use ops_assist::item::{ActionKind, Channel, NewItem, Payload, PlanStep, Priority, Stage};
use ops_assist::store::{LibSqlStore, PipelineStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Start an Axum gate server on a random port.
async fn start_server() -> (u16, Arc<dyn PipelineStore>, Arc<ApprovalGate>) {
    let store: Arc<dyn PipelineStore> = Arc::new(LibSqlStore::open_memory().await.unwrap());
    let gate = ApprovalGate::new(Arc::clone(&store));
    let app = gate_routes(Arc::clone(&gate), Arc::clone(&store));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, store, gate)
}

/// Drive an item to PendingApproval directly through the store.
async fn pending_item(store: &Arc<dyn PipelineStore>) -> Uuid {
    let new_item = NewItem::new(
        Channel::Mail,
        Uuid::new_v4().to_string(),
        Payload {
            sender: Some("customer@example.com".into()),
            subject: Some("Question".into()),
            body: "please reply when you can".into(),
            metadata: serde_json::json!({}),
        },
        Utc::now(),
    );
    let item = store
        .admit(&new_item, &Actor::Watcher(Channel::Mail))
        .await
        .unwrap();
    let decision = Decision {
        classification: "email".into(),
        priority: Priority::P2,
        requires_approval: true,
        action: ActionKind::SendMessage,
        plan: vec![PlanStep::new("Draft reply"), PlanStep::new("Send reply")],
    };
    store.record_decision(item.id, &decision).await.unwrap();
    for (from, to) in [
        (Stage::Intake, Stage::Classified),
        (Stage::Classified, Stage::Planned),
        (Stage::Planned, Stage::PendingApproval),
    ] {
        store
            .transition(item.id, from, to, &Actor::Planner, None)
            .await
            .unwrap();
    }
    item.id
}

async fn next_json(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Value {
    loop {
        let msg = timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for WS message")
            .expect("WS stream ended")
            .expect("WS error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("invalid JSON from server");
        }
    }
}

#[tokio::test]
async fn connect_receives_pending_sync() {
    let (port, store, _gate) = start_server().await;
    let a = pending_item(&store).await;
    let b = pending_item(&store).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .unwrap();

    let sync = next_json(&mut ws).await;
    assert_eq!(sync["type"], "pending_sync");
    let items = sync["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    let ids: Vec<&str> = items.iter().map(|i| i["id"].as_str().unwrap()).collect();
    assert!(ids.contains(&a.to_string().as_str()));
    assert!(ids.contains(&b.to_string().as_str()));
}

#[tokio::test]
async fn ws_approve_action_moves_item_and_broadcasts() {
    let (port, store, _gate) = start_server().await;
    let id = pending_item(&store).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .unwrap();
    let _sync = next_json(&mut ws).await;

    let action = serde_json::json!({
        "action": "approve",
        "item_id": id,
        "user": "alice",
    });
    ws.send(Message::Text(action.to_string().into()))
        .await
        .unwrap();

    let event = next_json(&mut ws).await;
    assert_eq!(event["type"], "item_decided");
    assert_eq!(event["id"], id.to_string());
    assert_eq!(event["stage"], "approved");

    let item = store.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.stage, Stage::Approved);
}

#[tokio::test]
async fn ws_reject_action_attaches_feedback() {
    let (port, store, _gate) = start_server().await;
    let id = pending_item(&store).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .unwrap();
    let _sync = next_json(&mut ws).await;

    let action = serde_json::json!({
        "action": "reject",
        "item_id": id,
        "feedback": "needs a softer tone",
        "user": "alice",
    });
    ws.send(Message::Text(action.to_string().into()))
        .await
        .unwrap();

    let event = next_json(&mut ws).await;
    assert_eq!(event["type"], "item_decided");
    assert_eq!(event["stage"], "rejected");

    let item = store.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.stage, Stage::Rejected);
    assert_eq!(item.feedback.as_deref(), Some("needs a softer tone"));
}

#[tokio::test]
async fn gate_decision_is_pushed_to_connected_clients() {
    let (port, store, gate) = start_server().await;
    let id = pending_item(&store).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .unwrap();
    let _sync = next_json(&mut ws).await;

    // Decision arrives through the gate API (not this client).
    gate.decide(id, ops_assist::gate::GateDecision::Approve, "alice")
        .await
        .unwrap();

    let event = next_json(&mut ws).await;
    assert_eq!(event["type"], "item_decided");
    assert_eq!(event["id"], id.to_string());
}

#[tokio::test]
async fn stale_ws_decision_does_not_crash_the_server() {
    let (port, store, gate) = start_server().await;
    let id = pending_item(&store).await;

    gate.decide(id, ops_assist::gate::GateDecision::Approve, "alice")
        .await
        .unwrap();

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .unwrap();
    let _sync = next_json(&mut ws).await;

    // Second decision over WS is stale — server logs and carries on.
    let action = serde_json::json!({
        "action": "approve",
        "item_id": id,
        "user": "bob",
    });
    ws.send(Message::Text(action.to_string().into()))
        .await
        .unwrap();

    // The connection stays usable: a fresh pending item still broadcasts.
    let fresh = pending_item(&store).await;
    gate.decide(fresh, ops_assist::gate::GateDecision::Approve, "alice")
        .await
        .unwrap();
    let event = next_json(&mut ws).await;
    assert_eq!(event["id"], fresh.to_string());

    // And the original item kept its first decision.
    let item = store.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.stage, Stage::Approved);
}
