//! Pipeline module - stage queues and the coordinator that wires them.

mod coordinator;
mod queue;

pub use coordinator::*;
pub use queue::*;
