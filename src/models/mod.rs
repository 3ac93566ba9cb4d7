//! Domain model module declarations.

pub mod agent;
pub mod checkpoint;
pub mod handoff;
