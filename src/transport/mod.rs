//! Flow-controlled duplex transport for agent event subscribers.

pub mod flow_control;
pub mod protocol;
pub mod registry;
pub mod ring_queue;
pub mod ws;

pub use flow_control::FlowControl;
pub use protocol::{ClientCommand, ServerMessage};
pub use registry::{Connection, ConnectionRegistry};
pub use ring_queue::RingQueue;
