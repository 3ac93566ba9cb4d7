//! Live connections, their subscriptions, and event fan-out.
//!
//! The registry is an explicit value shared through `Arc`; nothing here is
//! global. Each [`Connection`] owns a bounded outbound queue for fanned-out
//! events and a [`FlowControl`] that reports the queue's fill level to the
//! client. Command replies and flow signals bypass the queue and go straight
//! to the connection's direct handle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::flow_control::{FlowControl, OutboundHandle};
use super::protocol::{new_connection_id, ClientCommand, ServerMessage};
use super::ring_queue::{QueueStats, RingQueue};
use crate::config::TransportConfig;
use crate::events::{AgentEvent, EventPublisher};

/// One subscriber connection.
#[derive(Debug)]
pub struct Connection {
    id: String,
    opened_at: DateTime<Utc>,
    subscriptions: Mutex<HashSet<String>>,
    queue: Mutex<RingQueue<ServerMessage>>,
    flow: FlowControl,
    outbound: OutboundHandle,
    notify: Notify,
    cancel: CancellationToken,
    slowed: AtomicBool,
    high_watermark: f64,
    slow_down_watermark: f64,
    low_watermark: f64,
    suggested_rate: u32,
}

impl Connection {
    fn new(id: String, outbound: OutboundHandle, config: &TransportConfig) -> Self {
        let flow = if config.auto_ack {
            FlowControl::with_auto_ack(Some(outbound.clone()), config.ack_interval())
        } else {
            FlowControl::new(Some(outbound.clone()))
        };
        Self {
            id,
            opened_at: Utc::now(),
            subscriptions: Mutex::new(HashSet::new()),
            queue: Mutex::new(RingQueue::new(
                config.queue_capacity,
                config.overwrite_oldest,
            )),
            flow,
            outbound,
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            slowed: AtomicBool::new(false),
            high_watermark: config.high_watermark,
            slow_down_watermark: config.slow_down_watermark,
            low_watermark: config.low_watermark,
            suggested_rate: config.suggested_rate,
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Open time.
    #[must_use]
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Backpressure controller for this connection.
    #[must_use]
    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    /// Token cancelled when the connection closes.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current subscription set, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subs().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether events for `agent_id` are routed here.
    ///
    /// An empty subscription set means broadcast mode: every agent's
    /// events are delivered.
    #[must_use]
    pub fn is_subscribed_to(&self, agent_id: &str) -> bool {
        let subs = self.subs();
        subs.is_empty() || subs.contains(agent_id)
    }

    /// Whether the subscription set is empty.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.subs().is_empty()
    }

    fn subscribe<I>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        self.subs().extend(ids);
        self.subscriptions()
    }

    fn unsubscribe(&self, agent_id: &str) -> bool {
        self.subs().remove(agent_id)
    }

    fn subscribe_all(&self) {
        self.subs().clear();
    }

    /// Queue a fanned-out message and apply the watermark policy.
    ///
    /// Returns `false` when the queue refused the message (reject mode).
    pub fn enqueue(&self, message: ServerMessage) -> bool {
        let (accepted, overwrote, depth, usage) = {
            let mut queue = self.queue();
            let overwritten_before = queue.total_overwritten();
            let accepted = queue.push(message);
            let overwrote = queue.total_overwritten() > overwritten_before;
            (accepted, overwrote, queue.len(), queue.usage_percent() / 100.0)
        };

        if overwrote {
            warn!(
                connection_id = %self.id,
                depth,
                "outbound queue full, oldest message dropped"
            );
        }
        if !accepted {
            warn!(
                connection_id = %self.id,
                depth,
                "outbound queue full, message rejected"
            );
        }

        if usage >= self.high_watermark {
            if self.flow.pause(Some(depth)) {
                debug!(connection_id = %self.id, depth, "paused consumer");
            }
        } else if usage >= self.slow_down_watermark && !self.slowed.swap(true, Ordering::AcqRel) {
            self.flow.slow_down(self.suggested_rate, depth);
        }

        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Take up to `max` queued messages, oldest first, and resume the
    /// consumer once the queue has drained to the low watermark.
    pub fn drain(&self, max: usize) -> Vec<ServerMessage> {
        let (batch, usage) = {
            let mut queue = self.queue();
            let batch = queue.shift_n(max);
            (batch, queue.usage_percent() / 100.0)
        };

        if usage < self.slow_down_watermark {
            self.slowed.store(false, Ordering::Release);
        }
        if self.flow.is_paused() && usage <= self.low_watermark && self.flow.resume() {
            debug!(connection_id = %self.id, "resumed consumer");
        }
        batch
    }

    /// Wait until a message is enqueued.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Send a reply on the direct handle, bypassing the queue.
    ///
    /// Returns `false` when the handle is closed or full.
    pub fn send_direct(&self, message: ServerMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(err) => {
                debug!(connection_id = %self.id, %err, "direct frame dropped");
                false
            }
        }
    }

    /// Counters of the outbound queue.
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue().stats()
    }

    fn close(&self) {
        self.flow.dispose();
        self.queue().clear();
        self.cancel.cancel();
        self.notify.notify_waiters();
    }

    fn subs(&self) -> MutexGuard<'_, HashSet<String>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, RingQueue<ServerMessage>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Aggregate registry counters.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Connections currently open.
    pub open_connections: usize,
    /// Connections ever opened.
    pub total_opened: u64,
    /// Messages waiting across all outbound queues.
    pub queued_messages: usize,
}

/// Registry of open connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    config: TransportConfig,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    total_opened: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            total_opened: AtomicU64::new(0),
        }
    }

    /// Transport settings applied to new connections.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Register a connection writing to `outbound` and greet it with a
    /// `connected` frame.
    pub fn open(&self, outbound: OutboundHandle) -> Arc<Connection> {
        let id = new_connection_id();
        let connection = Arc::new(Connection::new(id.clone(), outbound, &self.config));

        self.lock().insert(id.clone(), Arc::clone(&connection));
        let total = self.total_opened.fetch_add(1, Ordering::Relaxed) + 1;

        connection.send_direct(ServerMessage::Connected {
            connection_id: id.clone(),
            timestamp: connection.opened_at,
        });
        info!(connection_id = %id, total_opened = total, "connection opened");
        connection
    }

    /// Decode and apply one inbound frame, returning the reply.
    ///
    /// Protocol errors produce an `error` reply and never close the
    /// connection.
    pub fn dispatch(&self, connection: &Connection, raw: &[u8]) -> ServerMessage {
        let command = match ClientCommand::parse(raw) {
            Ok(command) => command,
            Err(err) => {
                debug!(connection_id = %connection.id, ?err, "rejected frame");
                return ServerMessage::error(err.reply_message());
            }
        };

        match command {
            ClientCommand::Subscribe {
                agent_id,
                agent_ids,
            } => {
                let ids = agent_id.into_iter().chain(agent_ids.into_iter().flatten());
                let agent_ids = connection.subscribe(ids);
                debug!(connection_id = %connection.id, ?agent_ids, "subscribed");
                ServerMessage::Subscribed { agent_ids }
            }
            ClientCommand::Unsubscribe { agent_id } => {
                connection.unsubscribe(&agent_id);
                debug!(connection_id = %connection.id, agent_id, "unsubscribed");
                ServerMessage::Unsubscribed
            }
            ClientCommand::SubscribeAll => {
                connection.subscribe_all();
                debug!(connection_id = %connection.id, "subscribed to all agents");
                ServerMessage::SubscribedAll
            }
            ClientCommand::Ping => ServerMessage::Pong,
        }
    }

    /// Dispatch `raw`, send the reply, and acknowledge the frame.
    pub fn handle_frame(&self, connection: &Connection, raw: &[u8]) {
        let reply = self.dispatch(connection, raw);
        connection.send_direct(reply);
        connection.flow.acknowledge(1);
    }

    /// Close and forget a connection. Returns whether it was open.
    pub fn close(&self, connection_id: &str) -> bool {
        let removed = self.lock().remove(connection_id);
        match removed {
            Some(connection) => {
                connection.close();
                info!(connection_id, "connection closed");
                true
            }
            None => false,
        }
    }

    /// Look up an open connection.
    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.lock().get(connection_id).cloned()
    }

    /// Connections currently open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    /// Connections ever opened.
    #[must_use]
    pub fn total_opened(&self) -> u64 {
        self.total_opened.load(Ordering::Relaxed)
    }

    /// Ids of open connections, sorted.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let connections = self.snapshot();
        RegistryStats {
            open_connections: connections.len(),
            total_opened: self.total_opened(),
            queued_messages: connections.iter().map(|c| c.queue_stats().size).sum(),
        }
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Connection>> = self.lock().drain().map(|(_, c)| c).collect();
        for connection in &drained {
            connection.close();
        }
        info!(closed = drained.len(), "connection registry shut down");
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventPublisher for ConnectionRegistry {
    fn publish(&self, event: AgentEvent) -> usize {
        let agent_id = event.agent_id.clone();
        let message = ServerMessage::from(event);
        let delivered = self
            .snapshot()
            .iter()
            .filter(|connection| connection.is_subscribed_to(&agent_id))
            .filter(|connection| connection.enqueue(message.clone()))
            .count();
        debug!(agent_id, delivered, "event fanned out");
        delivered
    }
}
