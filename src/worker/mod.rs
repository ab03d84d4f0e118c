//! Dispatch worker.
//!
//! - `state` — lifecycle (Idle → Connected → Consuming → Closing, or Faulted)
//! - `worker` — consume loop, ack-then-process handling of each delivery

pub mod state;
pub mod worker;

pub use state::WorkerState;
pub use worker::{RunSummary, Worker};
