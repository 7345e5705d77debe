//! Flow-controlled request batching shared by publishers and subscribers.

pub(crate) mod flow_control;
pub(crate) mod queue;

pub use flow_control::DebouncedFlowControl;
pub use queue::{BatchingQueue, ErrorAction, OperationFuture};
