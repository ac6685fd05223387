//! Mission queue, proposal gate, event log and the orchestration that ties
//! them together, plus the heartbeat and worker loops built on top.
//!
//! Every component borrows a [`MissionStore`] and keeps no state of its own;
//! coordination happens exclusively through guarded store writes.

pub mod events;
pub mod gate;
pub mod heartbeat;
pub mod orchestrator;
pub mod policy;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod flaky;

pub use events::EventLog;
pub use gate::ProposalGate;
pub use heartbeat::{Heartbeat, HeartbeatReport};
pub use orchestrator::{DecisionOutcome, Orchestrator, StepCompletion};
pub use queue::MissionQueue;
pub use worker::{next_delay, PollOutcome, TaskExecutor, Worker, WorkerReport};

pub use mission_control_core::MissionStore;
