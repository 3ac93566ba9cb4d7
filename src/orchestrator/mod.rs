//! Session orchestration modules.
//!
//! Covers context-window rotation, the handoff protocol, and the resource
//! ownership ledger handoffs move entries through.

pub mod handoff;
pub mod ledger;
pub mod rotation;

pub use handoff::{HandoffCoordinator, HandoffOutcome, ResourceTransfer};
pub use ledger::ResourceLedger;
pub use rotation::{AgentHandlers, RotationController, RotationPolicy, RotationStrategy};
