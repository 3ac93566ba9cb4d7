//! Unit tests for the connection registry: command dispatch, subscription
//! routing, and watermark-driven flow signals.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use agent_continuity::config::TransportConfig;
use agent_continuity::events::{AgentEvent, EventPublisher};
use agent_continuity::transport::protocol::ServerMessage;
use agent_continuity::transport::registry::{Connection, ConnectionRegistry};

fn transport(capacity: usize) -> TransportConfig {
    TransportConfig {
        queue_capacity: capacity,
        auto_ack: false,
        ..TransportConfig::default()
    }
}

fn open(
    registry: &ConnectionRegistry,
) -> (Arc<Connection>, mpsc::Receiver<ServerMessage>) {
    let (tx, mut rx) = mpsc::channel(64);
    let connection = registry.open(tx);
    let first = rx.try_recv().expect("connected frame");
    assert!(matches!(
        first,
        ServerMessage::Connected { ref connection_id, .. } if connection_id == connection.id()
    ));
    (connection, rx)
}

fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

fn event(agent_id: &str) -> AgentEvent {
    AgentEvent::new(agent_id, "progress", json!({ "step": 1 }))
}

// ── Connection lifecycle ────────────────────────────────────────────────────

/// Connection ids follow `ws_<millis>_<base36>` and are unique.
#[test]
fn open_allocates_unique_ids() {
    let registry = ConnectionRegistry::new(transport(10));
    let (a, _rx_a) = open(&registry);
    let (b, _rx_b) = open(&registry);

    assert_ne!(a.id(), b.id());
    let parts: Vec<&str> = a.id().split('_').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], "ws");
    assert!(parts[1].parse::<i64>().is_ok());
    assert_eq!(parts[2].len(), 9);
    assert!(parts[2].chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));

    assert_eq!(registry.open_count(), 2);
    assert_eq!(registry.total_opened(), 2);
}

/// Closing removes the connection and cancels its token.
#[test]
fn close_removes_and_cancels() {
    let registry = ConnectionRegistry::new(transport(10));
    let (connection, _rx) = open(&registry);

    assert!(registry.close(connection.id()));
    assert!(!registry.close(connection.id()));
    assert!(registry.get(connection.id()).is_none());
    assert!(connection.cancel_token().is_cancelled());
    assert!(connection.flow().is_disposed());
    assert_eq!(registry.total_opened(), 1);
}

/// Shutdown closes every connection.
#[test]
fn shutdown_closes_all() {
    let registry = ConnectionRegistry::new(transport(10));
    let (a, _rx_a) = open(&registry);
    let (b, _rx_b) = open(&registry);

    registry.shutdown();
    assert_eq!(registry.open_count(), 0);
    assert!(a.cancel_token().is_cancelled());
    assert!(b.cancel_token().is_cancelled());
}

// ── Command dispatch ────────────────────────────────────────────────────────

/// Both `agentId` and `agentIds` add to the set; the reply lists it sorted.
#[test]
fn subscribe_accumulates_ids() {
    let registry = ConnectionRegistry::new(transport(10));
    let (connection, _rx) = open(&registry);

    let reply = registry.dispatch(&connection, br#"{"type":"subscribe","agentId":"b"}"#);
    assert_eq!(reply, ServerMessage::Subscribed { agent_ids: vec!["b".into()] });

    let reply = registry.dispatch(
        &connection,
        br#"{"type":"subscribe","agentIds":["c","a","b"]}"#,
    );
    assert_eq!(
        reply,
        ServerMessage::Subscribed {
            agent_ids: vec!["a".into(), "b".into(), "c".into()]
        }
    );
}

/// A subscribe naming no agents keeps the current set.
#[test]
fn empty_subscribe_keeps_set() {
    let registry = ConnectionRegistry::new(transport(10));
    let (connection, _rx) = open(&registry);
    registry.dispatch(&connection, br#"{"type":"subscribe","agentId":"a"}"#);

    let reply = registry.dispatch(&connection, br#"{"type":"subscribe"}"#);
    assert_eq!(reply, ServerMessage::Subscribed { agent_ids: vec!["a".into()] });
}

/// Unsubscribe and subscribe_all update the set.
#[test]
fn unsubscribe_and_subscribe_all() {
    let registry = ConnectionRegistry::new(transport(10));
    let (connection, _rx) = open(&registry);
    registry.dispatch(&connection, br#"{"type":"subscribe","agentIds":["a","b"]}"#);

    let reply = registry.dispatch(&connection, br#"{"type":"unsubscribe","agentId":"a"}"#);
    assert_eq!(reply, ServerMessage::Unsubscribed);
    assert_eq!(connection.subscriptions(), vec!["b".to_owned()]);
    assert!(!connection.is_subscribed_to("a"));

    let reply = registry.dispatch(&connection, br#"{"type":"subscribe_all"}"#);
    assert_eq!(reply, ServerMessage::SubscribedAll);
    assert!(connection.is_broadcast());
    assert!(connection.is_subscribed_to("anyone"));
}

/// Ping replies pong.
#[test]
fn ping_replies_pong() {
    let registry = ConnectionRegistry::new(transport(10));
    let (connection, _rx) = open(&registry);
    assert_eq!(
        registry.dispatch(&connection, br#"{"type":"ping"}"#),
        ServerMessage::Pong
    );
}

/// Malformed frames produce error replies and leave the connection open.
#[test]
fn malformed_frames_reply_with_errors() {
    let registry = ConnectionRegistry::new(transport(10));
    let (connection, _rx) = open(&registry);

    assert_eq!(
        registry.dispatch(&connection, b"not json"),
        ServerMessage::error("Invalid JSON message")
    );
    assert_eq!(
        registry.dispatch(&connection, br#"{"type":"launch"}"#),
        ServerMessage::error("Unknown message type: launch")
    );
    assert_eq!(
        registry.dispatch(&connection, br#"{"agentId":"a"}"#),
        ServerMessage::error("Unknown message type: undefined")
    );
    assert!(registry.get(connection.id()).is_some());
}

/// Every handled frame, including a rejected one, is acknowledged after
/// the reply.
#[test]
fn handle_frame_replies_then_acks() {
    let registry = ConnectionRegistry::new(transport(10));
    let (connection, mut rx) = open(&registry);

    registry.handle_frame(&connection, br#"{"type":"ping"}"#);
    registry.handle_frame(&connection, b"{");

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0], ServerMessage::Pong);
    assert!(matches!(frames[1], ServerMessage::Ack { metadata } if metadata.ack_count == Some(1)));
    assert!(matches!(frames[2], ServerMessage::Error { .. }));
    assert!(matches!(frames[3], ServerMessage::Ack { .. }));
}

/// A zero batched-ack interval still flushes on the timer.
#[tokio::test(start_paused = true)]
async fn zero_ack_interval_still_flushes() {
    let registry = ConnectionRegistry::new(TransportConfig {
        queue_capacity: 10,
        auto_ack: true,
        ack_interval_ms: 0,
        ..TransportConfig::default()
    });
    let (connection, mut rx) = open(&registry);

    registry.handle_frame(&connection, br#"{"type":"ping"}"#);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], ServerMessage::Pong);
    assert!(matches!(frames[1], ServerMessage::Ack { metadata } if metadata.ack_count == Some(1)));
    assert_eq!(connection.flow().pending_ack_count(), 0);
    registry.shutdown();
}

// ── Fan-out ─────────────────────────────────────────────────────────────────

/// Events reach subscribed and broadcast connections only.
#[test]
fn publish_routes_by_subscription() {
    let registry = ConnectionRegistry::new(transport(10));
    let (follower, _rx_f) = open(&registry);
    let (other, _rx_o) = open(&registry);
    let (broadcast, _rx_b) = open(&registry);

    registry.dispatch(&follower, br#"{"type":"subscribe","agentId":"agent-1"}"#);
    registry.dispatch(&other, br#"{"type":"subscribe","agentId":"agent-2"}"#);

    assert_eq!(registry.publish(event("agent-1")), 2);

    let delivered = follower.drain(10);
    assert!(matches!(
        delivered.as_slice(),
        [ServerMessage::AgentEvent { agent_id, event, .. }] if agent_id == "agent-1" && event == "progress"
    ));
    assert!(other.drain(10).is_empty());
    assert_eq!(broadcast.drain(10).len(), 1);
    assert_eq!(registry.stats().queued_messages, 0);
}

/// Reject-mode queues refuse events once full and publish counts only
/// accepted deliveries.
#[test]
fn rejected_enqueue_is_not_counted() {
    let registry = ConnectionRegistry::new(TransportConfig {
        overwrite_oldest: false,
        ..transport(2)
    });
    let (connection, _rx) = open(&registry);

    assert_eq!(registry.publish(event("a")), 1);
    assert_eq!(registry.publish(event("a")), 1);
    assert_eq!(registry.publish(event("a")), 0);
    assert_eq!(connection.queue_stats().total_rejected, 1);
}

// ── Watermarks ──────────────────────────────────────────────────────────────

/// Filling past the slow-down and high marks emits one `SLOW_DOWN` and one
/// `PAUSE`; draining to the low mark emits `RESUME`.
#[test]
fn watermarks_drive_flow_signals() {
    let registry = ConnectionRegistry::new(transport(10));
    let (connection, mut rx) = open(&registry);

    for _ in 0..9 {
        connection.enqueue(ServerMessage::Pong);
    }

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 2, "{frames:?}");
    assert!(matches!(
        frames[0],
        ServerMessage::SlowDown { metadata }
            if metadata.queue_depth == Some(6) && metadata.suggested_rate == Some(10)
    ));
    assert!(matches!(
        frames[1],
        ServerMessage::Pause { metadata } if metadata.queue_depth == Some(8)
    ));
    assert!(connection.flow().is_paused());

    assert_eq!(connection.drain(4).len(), 4);
    assert!(drain(&mut rx).is_empty(), "usage 0.5 is above the low mark");

    assert_eq!(connection.drain(2).len(), 2);
    let frames = drain(&mut rx);
    assert!(matches!(frames.as_slice(), [ServerMessage::Resume { .. }]));
    assert!(!connection.flow().is_paused());
}

/// After draining below the slow-down mark, a new crossing advises again.
#[test]
fn slow_down_rearms_after_drain() {
    let registry = ConnectionRegistry::new(transport(10));
    let (connection, mut rx) = open(&registry);

    for _ in 0..6 {
        connection.enqueue(ServerMessage::Pong);
    }
    connection.drain(6);
    for _ in 0..6 {
        connection.enqueue(ServerMessage::Pong);
    }

    let slow_downs = drain(&mut rx)
        .into_iter()
        .filter(|frame| matches!(frame, ServerMessage::SlowDown { .. }))
        .count();
    assert_eq!(slow_downs, 2);
}

/// Registry stats serialize camelCase.
#[test]
fn stats_report_queued_messages() {
    let registry = ConnectionRegistry::new(transport(10));
    let (_connection, _rx) = open(&registry);
    registry.publish(event("a"));

    let stats = registry.stats();
    assert_eq!(stats.open_connections, 1);
    assert_eq!(stats.queued_messages, 1);
    let json = serde_json::to_value(stats).expect("serialize");
    assert_eq!(json["openConnections"], 1);
    assert_eq!(json["totalOpened"], 1);
}
