//! Unit tests for per-connection flow-control signalling.

use std::time::Duration;

use tokio::sync::mpsc;

use agent_continuity::transport::flow_control::FlowControl;
use agent_continuity::transport::protocol::ServerMessage;

fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

/// `PAUSE` → `RESUME` → `PAUSE` emits exactly three frames in order.
#[test]
fn pause_resume_cycle_emits_each_edge_once() {
    let (tx, mut rx) = mpsc::channel(8);
    let flow = FlowControl::new(Some(tx));

    assert!(flow.pause(Some(8)));
    assert!(!flow.pause(Some(9)));
    assert!(flow.resume());
    assert!(flow.pause(None));

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 3);
    assert!(matches!(frames[0], ServerMessage::Pause { .. }));
    assert!(matches!(frames[1], ServerMessage::Resume { .. }));
    assert!(matches!(frames[2], ServerMessage::Pause { .. }));
    assert!(flow.is_paused());
}

/// A `PAUSE` with no socket still pauses, so the later `RESUME` is the
/// first frame the consumer sees.
#[test]
fn pause_without_socket_still_pauses() {
    let flow = FlowControl::new(None);
    assert!(!flow.pause(Some(3)));
    assert!(flow.is_paused());
    assert!(!flow.pause(Some(4)));

    let (tx, mut rx) = mpsc::channel(8);
    flow.set_socket(Some(tx));
    assert!(flow.resume());
    assert!(!flow.is_paused());

    let frames = drain(&mut rx);
    assert!(matches!(frames.as_slice(), [ServerMessage::Resume { .. }]));
}

/// A zero acknowledgment is ignored.
#[test]
fn zero_ack_is_ignored() {
    let (tx, mut rx) = mpsc::channel(8);
    let flow = FlowControl::new(Some(tx));
    assert!(!flow.acknowledge(0));
    assert!(drain(&mut rx).is_empty());
}

/// Flushing with nothing pending sends nothing.
#[tokio::test]
async fn flush_without_pending_is_silent() {
    let (tx, mut rx) = mpsc::channel(8);
    let flow = FlowControl::with_auto_ack(Some(tx), Duration::from_secs(3600));
    assert!(!flow.flush());
    assert!(drain(&mut rx).is_empty());
    flow.dispose();
}

/// Batched acks accumulate until an explicit flush.
#[tokio::test]
async fn batched_acks_merge_into_one_frame() {
    let (tx, mut rx) = mpsc::channel(8);
    let flow = FlowControl::with_auto_ack(Some(tx), Duration::from_secs(3600));

    assert!(!flow.acknowledge(1));
    assert!(!flow.acknowledge(4));
    assert!(drain(&mut rx).is_empty());

    assert!(flow.flush());
    let frames = drain(&mut rx);
    assert!(matches!(
        frames.as_slice(),
        [ServerMessage::Ack { metadata }] if metadata.ack_count == Some(5)
    ));
    assert_eq!(flow.pending_ack_count(), 0);
    flow.dispose();
}

/// A zero interval is raised to the minimum and the timer keeps flushing.
#[tokio::test(start_paused = true)]
async fn zero_interval_timer_flushes() {
    let (tx, mut rx) = mpsc::channel(8);
    let flow = FlowControl::with_auto_ack(Some(tx), Duration::ZERO);

    assert!(!flow.acknowledge(2));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [ServerMessage::Ack { metadata }] if metadata.ack_count == Some(2)
    ));

    assert!(!flow.acknowledge(1));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(drain(&mut rx).len(), 1);
    flow.dispose();
}

/// After dispose no operation emits, and dispose is idempotent.
#[test]
fn disposed_controller_is_inert() {
    let (tx, mut rx) = mpsc::channel(8);
    let flow = FlowControl::new(Some(tx));
    flow.dispose();
    flow.dispose();

    assert!(flow.is_disposed());
    assert!(!flow.pause(None));
    assert!(!flow.resume());
    assert!(!flow.acknowledge(2));
    assert!(!flow.slow_down(5, 1));
    assert!(!flow.flush());
    assert!(drain(&mut rx).is_empty());
}

/// A full outbound channel drops the signal instead of blocking.
#[test]
fn full_channel_drops_signal() {
    let (tx, mut rx) = mpsc::channel(1);
    let flow = FlowControl::new(Some(tx));

    assert!(flow.acknowledge(1));
    assert!(!flow.acknowledge(1));
    assert_eq!(drain(&mut rx).len(), 1);
}

/// Signals serialize with upper-case wire names and camelCase metadata.
#[test]
fn signals_use_wire_names() {
    let (tx, mut rx) = mpsc::channel(8);
    let flow = FlowControl::new(Some(tx));
    flow.slow_down(10, 600);

    let frame = drain(&mut rx).remove(0);
    let json: serde_json::Value = serde_json::from_str(&frame.to_json()).expect("json");
    assert_eq!(json["type"], "SLOW_DOWN");
    assert_eq!(json["metadata"]["suggestedRate"], 10);
    assert_eq!(json["metadata"]["queueDepth"], 600);
    assert!(json["metadata"].get("ackCount").is_none());
}
