mod common;

use std::time::Duration;

use common::{RawClient, ScriptedEngine, eventually, start_scripted};
use qstream::core::dispatcher::{Completion, InvariantViolation, Op, Tag};
use qstream::core::tracker::CallEnd;
use qstream::rpc::protocol::{SHUTTING_DOWN, ServerMessage};
use qstream::rpc::{QueryParams, RpcClient, ServerError};
use tokio::time::timeout;

#[tokio::test]
async fn test_idle_server_stops_cleanly() {
    let engine = ScriptedEngine::new();
    let server = start_scripted(engine).await;
    let tracker = server.tracker.clone();

    let client = RpcClient::new(server.addr);
    client.query(QueryParams::new("one")).await.unwrap();
    server.settled().await;

    server.stop().await.unwrap();
    assert_eq!(tracker.live(), 0);
    assert_eq!(tracker.ended(CallEnd::Succeeded), 1);
    assert_eq!(tracker.ended(CallEnd::Aborted), 0);
}

#[tokio::test]
async fn test_shutdown_refuses_new_calls_then_closes_stragglers() {
    let engine = ScriptedEngine::new();
    let server = start_scripted(engine.clone()).await;
    let tracker = server.tracker.clone();
    let services = server.server.services().clone();

    let mut client = RawClient::connect(server.addr).await;
    client.query(1, "stall").await;
    assert!(matches!(client.next().await, ServerMessage::Notification(_)));

    server.server.shutdown();
    eventually(|| services.listener.is_closed()).await;

    // The connection is still open during the grace period
    client.query(2, "late").await;
    let ServerMessage::Response(response) = client.next().await else {
        panic!("expected a refusal");
    };
    assert_eq!(response.error.unwrap().code, SHUTTING_DOWN);

    // Grace is one second, then the stalled call is torn down
    assert!(client.closed().await);
    let result = timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("timeout waiting for shutdown")
        .expect("server task panicked");
    assert!(result.is_ok());

    assert_eq!(engine.cancelled(), 1);
    assert_eq!(engine.submitted(), 1);
    assert_eq!(tracker.ended(CallEnd::Aborted), 1);
    assert_eq!(tracker.live(), 0);
}

#[tokio::test]
async fn test_in_flight_call_finishes_within_grace() {
    let engine = ScriptedEngine::new();
    let server = start_scripted(engine.clone()).await;
    let tracker = server.tracker.clone();

    let mut client = RawClient::connect(server.addr).await;
    client.query(1, "stream 50").await;
    assert!(matches!(client.next().await, ServerMessage::Notification(_)));
    server.server.shutdown();

    let mut progress = 1;
    loop {
        match client.next().await {
            ServerMessage::Notification(_) => progress += 1,
            ServerMessage::Response(response) => {
                assert_eq!(response.id, serde_json::json!(1));
                assert!(response.error.is_none());
                break;
            }
        }
    }
    assert_eq!(progress, 50);

    server.stop().await.unwrap();
    assert_eq!(tracker.ended(CallEnd::Succeeded), 1);
    assert_eq!(engine.cancelled(), 0);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let engine = ScriptedEngine::new();
    let server = start_scripted(engine).await;

    let again = server.server.start().await;
    assert!(matches!(
        again,
        Err(qstream::rpc::ServerError::AlreadyStarted)
    ));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_completion_for_finished_call_stops_the_server() {
    let engine = ScriptedEngine::new();
    let server = start_scripted(engine).await;
    let services = server.server.services().clone();

    // The status call lists itself, which gives us the tag of a call that
    // is done once the response arrives
    let status = RpcClient::new(server.addr).status().await.unwrap();
    let tag = Tag::from_raw(status["active"][0]["tag"].as_u64().unwrap());
    server.settled().await;

    services
        .io_queue()
        .send(Completion::success(tag, Op::Ready))
        .unwrap();

    let result = timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("timeout waiting for shutdown")
        .expect("server task panicked");
    match result {
        Err(ServerError::Invariant(InvariantViolation::NotParked(faulted))) => {
            assert_eq!(faulted, tag)
        }
        other => panic!("expected a fatal violation, got {other:?}"),
    }
    assert_eq!(services.violation(), Some(InvariantViolation::NotParked(tag)));
}
