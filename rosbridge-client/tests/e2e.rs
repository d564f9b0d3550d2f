//! End-to-end scenarios against the scripted mock transport.

mod common;

use common::{client_with_mock, connect_client};
use rosbridge_client::{
    ActionGoal, CallOptions, CancelOptions, ClientConfig, ClientError, ReconnectConfig,
    TopicCallback,
};
use rosbridge_protocol::cbor;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn no_reconnect() -> ClientConfig {
    ClientConfig::new().with_reconnect(ReconnectConfig::disabled())
}

fn fast_reconnect() -> ClientConfig {
    ClientConfig::new().with_reconnect(
        ReconnectConfig::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter_ratio(0.0),
    )
}

fn sink_callback() -> (TopicCallback, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: TopicCallback = Arc::new(move |msg: &Value| {
        let _ = tx.send(msg.clone());
    });
    (callback, rx)
}

#[tokio::test(start_paused = true)]
async fn test_service_call_round_trip() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_service("/demo/sum", "example/AddTwoInts", json!({"a": 1, "b": 2}))
                .await
        })
    };

    let envelope = link.recv_json().await;
    assert_eq!(envelope["op"], "call_service");
    assert_eq!(envelope["service"], "/demo/sum");
    assert_eq!(envelope["type"], "example/AddTwoInts");
    assert_eq!(envelope["args"], json!({"a": 1, "b": 2}));
    let id = envelope["id"].as_str().expect("missing call id").to_string();

    link.message_json(json!({
        "op": "service_response",
        "service": "/demo/sum",
        "id": id,
        "result": true,
        "values": {"echoed_args": {"a": 1, "b": 2}},
    }));

    let values = call.await.unwrap().unwrap();
    assert_eq!(values, json!({"echoed_args": {"a": 1, "b": 2}}));
}

#[tokio::test(start_paused = true)]
async fn test_service_call_failure_carries_server_error() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_service("/demo/fail", "example/Fail", json!({"force_fail": true}))
                .await
        })
    };

    let envelope = link.recv_json().await;
    let id = envelope["id"].as_str().unwrap().to_string();
    link.message_json(json!({
        "op": "service_response",
        "service": "/demo/fail",
        "id": id,
        "result": false,
        "error": "forced_failure",
    }));

    let error = call.await.unwrap().unwrap_err();
    assert!(error.to_string().contains("forced_failure"));
}

#[tokio::test(start_paused = true)]
async fn test_service_call_timeout_names_the_service() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_service_with(
                    "/slow",
                    "example/Slow",
                    json!({}),
                    CallOptions::new().with_timeout(Duration::from_millis(50)),
                )
                .await
        })
    };

    let _envelope = link.recv_json().await;
    let error = call.await.unwrap().unwrap_err();
    assert!(matches!(error, ClientError::ServiceTimeout { .. }));
    assert!(error.to_string().contains("/slow"));
}

#[tokio::test(start_paused = true)]
async fn test_action_goal_success_with_feedback() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let feedbacks = Arc::new(AtomicUsize::new(0));
    let goal = ActionGoal::new("/arm/move", "demo/MoveArm", json!({"x": 1, "y": 2}))
        .with_session_id("sess-1")
        .on_feedback({
            let feedbacks = feedbacks.clone();
            move |_feedback| {
                feedbacks.fetch_add(1, Ordering::SeqCst);
            }
        });

    let handle = client.send_action_goal(goal).await.unwrap();
    let goal_id = handle.id.clone();
    assert_eq!(handle.session_id.as_deref(), Some("sess-1"));

    let envelope = link.recv_json().await;
    assert_eq!(envelope["op"], "send_action_goal");
    assert_eq!(envelope["action"], "/arm/move");
    assert_eq!(envelope["action_type"], "demo/MoveArm");
    assert_eq!(envelope["goal"], json!({"x": 1, "y": 2}));
    assert_eq!(envelope["id"], json!(goal_id));
    assert_eq!(envelope["session_id"], "sess-1");

    link.message_json(json!({
        "type": "request", "id": goal_id, "session_id": "sess-1", "action": "/arm/move",
    }));
    link.message_json(json!({
        "type": "feedback", "session_id": "sess-1", "feedback": {"progress": 0.5},
    }));
    link.message_json(json!({
        "type": "feedback", "session_id": "sess-1", "feedback": {"progress": 0.9},
    }));
    link.message_json(json!({
        "type": "result", "session_id": "sess-1", "status": 0, "result": {"success": true},
    }));

    let result = handle.completion().await.unwrap();
    assert_eq!(result, json!({"success": true}));
    assert_eq!(feedbacks.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_action_cancel_then_non_success_status() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let goal = ActionGoal::new("/arm/move", "demo/MoveArm", json!({"x": 1}))
        .with_session_id("sess-1");
    let handle = client.send_action_goal(goal).await.unwrap();
    let _goal_envelope = link.recv_json().await;

    let cancel = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .cancel_action_goal(
                    "/arm/move",
                    "demo/MoveArm",
                    CancelOptions::new().with_session_id("sess-1"),
                )
                .await
        })
    };

    let envelope = link.recv_json().await;
    assert_eq!(envelope["op"], "cancel_action_goal");
    assert_eq!(envelope["action"], "/arm/move");
    assert_eq!(envelope["action_type"], "demo/MoveArm");
    assert_eq!(envelope["session_id"], "sess-1");

    link.message_json(json!({
        "op": "cancel_action_result", "action": "/arm/move", "session_id": "sess-1", "result": true,
    }));
    let cancel_result = cancel.await.unwrap().unwrap();
    assert_eq!(cancel_result["op"], "cancel_action_result");
    assert_eq!(cancel_result["result"], true);

    link.message_json(json!({
        "type": "result", "session_id": "sess-1", "status": 2,
    }));
    let error = handle.completion().await.unwrap_err();
    assert!(error.to_string().contains("non-success status 2"));
}

#[tokio::test(start_paused = true)]
async fn test_action_result_error_rejects_completion() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let goal = ActionGoal::new("/arm/teleport", "demo/Teleport", json!({}));
    let handle = client.send_action_goal(goal).await.unwrap();
    let goal_id = handle.id.clone();
    let _goal_envelope = link.recv_json().await;

    link.message_json(json!({
        "op": "action_result", "action": "/arm/teleport", "id": goal_id,
        "error": "unknown_action_type",
    }));

    let error = handle.completion().await.unwrap_err();
    assert!(error.to_string().contains("unknown_action_type"));
}

#[tokio::test(start_paused = true)]
async fn test_sole_pending_action_receives_uncorrelated_events() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let handle = client
        .send_action_goal(ActionGoal::new("/solo", "demo/Solo", json!({})))
        .await
        .unwrap();
    let _goal_envelope = link.recv_json().await;

    // Neither id nor session_id: attributed to the only pending goal.
    link.message_json(json!({"type": "result", "status": 0, "result": {"ok": true}}));
    assert_eq!(handle.completion().await.unwrap(), json!({"ok": true}));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_rejects_pending_actions_not_services() {
    let (client, mut server) = client_with_mock(fast_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let handle = client
        .send_action_goal(ActionGoal::new("/arm/move", "demo/MoveArm", json!({})))
        .await
        .unwrap();
    let _goal_envelope = link.recv_json().await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client.call_service("/demo/sum", "example/AddTwoInts", json!({})).await
        })
    };
    let call_envelope = link.recv_json().await;
    let call_id = call_envelope["id"].as_str().unwrap().to_string();

    link.close();

    // The action fails immediately with the disconnect error.
    let error = handle.completion().await.unwrap_err();
    assert!(matches!(error, ClientError::Disconnected));
    assert!(error.to_string().contains("interrupted by disconnect"));

    // The service call survives the reconnect and resolves on the new socket.
    let link2 = server.accept().await;
    link2.open();
    link2.message_json(json!({
        "op": "service_response", "id": call_id, "result": true, "values": {"late": true},
    }));
    assert_eq!(call.await.unwrap().unwrap(), json!({"late": true}));
}

#[tokio::test(start_paused = true)]
async fn test_publish_and_subscribe_round_trip() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let (callback, mut received) = sink_callback();
    client
        .subscribe("/chatter", "std_msgs/String", callback)
        .await
        .unwrap();
    let envelope = link.recv_json().await;
    assert_eq!(
        envelope,
        json!({"op": "subscribe", "topic": "/chatter", "type": "std_msgs/String"})
    );

    client.publish("/chatter", json!({"data": "hi"})).await.unwrap();
    let envelope = link.recv_json().await;
    assert_eq!(
        envelope,
        json!({"op": "publish", "topic": "/chatter", "msg": {"data": "hi"}})
    );

    link.message_json(json!({"op": "publish", "topic": "/chatter", "msg": {"data": "yo"}}));
    assert_eq!(received.recv().await.unwrap(), json!({"data": "yo"}));

    // Unknown topics are dropped without side effects.
    link.message_json(json!({"op": "publish", "topic": "/other", "msg": {}}));
    client.unsubscribe("/chatter").await.unwrap();
    let envelope = link.recv_json().await;
    assert_eq!(envelope, json!({"op": "unsubscribe", "topic": "/chatter"}));
}

#[tokio::test(start_paused = true)]
async fn test_cbor_raw_publish_decodes_binary_frames() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let (callback, mut received) = sink_callback();
    client
        .subscribe_with_compression("/mock/status", "mock_msgs/Status", "cbor-raw", callback)
        .await
        .unwrap();
    let envelope = link.recv_json().await;
    assert_eq!(envelope["compression"], "cbor-raw");

    let frame = json!({
        "op": "publish",
        "topic": "/mock/status",
        "msg": {"bytes": [1, 2, 3], "secs": 5, "nsecs": 6},
    });
    link.message_binary(cbor::to_vec(&frame).unwrap());

    let msg = received.recv().await.unwrap();
    assert!(msg["bytes"].is_array());
    assert_eq!(msg, json!({"bytes": [1, 2, 3], "secs": 5, "nsecs": 6}));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_before_connect_records_entry_for_replay() {
    let (client, mut server) = client_with_mock(no_reconnect());

    let (callback, _received) = sink_callback();
    let error = client
        .subscribe("/early", "std_msgs/String", callback)
        .await
        .unwrap_err();
    assert!(error.to_string().contains("not connected"));

    let mut link = connect_client(&client, &mut server).await;
    let envelope = link.recv_json().await;
    assert_eq!(
        envelope,
        json!({"op": "subscribe", "topic": "/early", "type": "std_msgs/String"})
    );
}

#[tokio::test(start_paused = true)]
async fn test_replay_after_reconnect_uses_latest_attributes() {
    let (client, mut server) = client_with_mock(fast_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let (callback, _received) = sink_callback();
    client
        .subscribe("/chatter", "std_msgs/String", callback.clone())
        .await
        .unwrap();
    let _subscribe = link.recv_json().await;
    client.advertise("/out", "std_msgs/Empty").await.unwrap();
    let _advertise = link.recv_json().await;

    // A compression change re-sends the subscription and is what replay must
    // carry afterwards.
    client
        .subscribe_with_compression("/chatter", "std_msgs/String", "cbor", callback)
        .await
        .unwrap();
    let resend = link.recv_json().await;
    assert_eq!(resend["compression"], "cbor");

    link.close();
    let mut link2 = server.accept().await;
    link2.open();

    let replayed_subscribe = link2.recv_json().await;
    assert_eq!(
        replayed_subscribe,
        json!({"op": "subscribe", "topic": "/chatter", "type": "std_msgs/String", "compression": "cbor"})
    );
    let replayed_advertise = link2.recv_json().await;
    assert_eq!(
        replayed_advertise,
        json!({"op": "advertise", "topic": "/out", "type": "std_msgs/Empty"})
    );
}

#[tokio::test(start_paused = true)]
async fn test_cli_request_round_trip() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.run_cli_command("ros2 topic list").await })
    };

    let envelope = link.recv_json().await;
    assert_eq!(envelope["op"], "cli_request");
    assert_eq!(envelope["command"], "ros2 topic list");
    let id = envelope["id"].as_str().unwrap().to_string();

    link.message_json(json!({
        "op": "cli_response", "id": id, "result": true, "output": {"stdout": "/chatter\n"},
    }));
    assert_eq!(call.await.unwrap().unwrap(), json!({"stdout": "/chatter\n"}));
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_and_unrecognized_frames_are_dropped() {
    let (client, mut server) = client_with_mock(no_reconnect());
    let mut link = connect_client(&client, &mut server).await;

    let (callback, mut received) = sink_callback();
    client.subscribe("/t", "std_msgs/String", callback).await.unwrap();
    let _subscribe = link.recv_json().await;

    link.message_json(json!({"no_op_or_type": true}));
    link.message_json(json!({"op": "error", "error": "server side problem"}));
    link.message_binary(vec![0x5f]); // undecodable in any codec

    // The connection still works afterwards.
    link.message_json(json!({"op": "publish", "topic": "/t", "msg": {"data": 1}}));
    assert_eq!(received.recv().await.unwrap(), json!({"data": 1}));
}
