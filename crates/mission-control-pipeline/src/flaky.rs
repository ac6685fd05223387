use std::cell::Cell;

use mission_control_core::{
    AgentEvent, BatchOutcome, EventQuery, MemoryMissionStore, MissionStep, MissionStore,
    NewAgentEvent, NewMissionStep, NewProposal, PipelineError, Proposal, ProposalId,
    ProposalPatch, ProposalQuery, ProposalStatus, StepId, StepPatch, StepQuery, StepStatus,
    WriteBatch,
};
use serde_json::Value;

/// In-memory store whose next `n` batch writes fail as if the database were
/// locked. Reads and single-row writes always pass through.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryMissionStore,
    failing_batches: Cell<u32>,
}

impl FlakyStore {
    pub fn fail_next_batches(&self, count: u32) {
        self.failing_batches.set(count);
    }

    pub fn failures_left(&self) -> u32 {
        self.failing_batches.get()
    }
}

impl MissionStore for FlakyStore {
    fn insert_mission_step(&self, step: &NewMissionStep) -> Result<MissionStep, PipelineError> {
        self.inner.insert_mission_step(step)
    }

    fn update_mission_step(
        &self,
        step_id: StepId,
        expected: StepStatus,
        patch: &StepPatch,
    ) -> Result<usize, PipelineError> {
        self.inner.update_mission_step(step_id, expected, patch)
    }

    fn select_mission_step(&self, step_id: StepId) -> Result<Option<MissionStep>, PipelineError> {
        self.inner.select_mission_step(step_id)
    }

    fn select_mission_steps(&self, query: &StepQuery) -> Result<Vec<MissionStep>, PipelineError> {
        self.inner.select_mission_steps(query)
    }

    fn insert_proposal(&self, proposal: &NewProposal) -> Result<Proposal, PipelineError> {
        self.inner.insert_proposal(proposal)
    }

    fn update_proposal(
        &self,
        proposal_id: ProposalId,
        expected: ProposalStatus,
        patch: &ProposalPatch,
    ) -> Result<usize, PipelineError> {
        self.inner.update_proposal(proposal_id, expected, patch)
    }

    fn select_proposal(&self, proposal_id: ProposalId) -> Result<Option<Proposal>, PipelineError> {
        self.inner.select_proposal(proposal_id)
    }

    fn select_proposals(&self, query: &ProposalQuery) -> Result<Vec<Proposal>, PipelineError> {
        self.inner.select_proposals(query)
    }

    fn insert_agent_event(&self, event: &NewAgentEvent) -> Result<AgentEvent, PipelineError> {
        self.inner.insert_agent_event(event)
    }

    fn select_agent_events(&self, query: &EventQuery) -> Result<Vec<AgentEvent>, PipelineError> {
        self.inner.select_agent_events(query)
    }

    fn get_policy(&self, key: &str) -> Result<Option<Value>, PipelineError> {
        self.inner.get_policy(key)
    }

    fn put_policy(&self, key: &str, value: &Value) -> Result<(), PipelineError> {
        self.inner.put_policy(key, value)
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<Option<BatchOutcome>, PipelineError> {
        let remaining = self.failing_batches.get();
        if remaining > 0 {
            self.failing_batches.set(remaining - 1);
            return Err(PipelineError::TransientStore(
                "database is locked".to_string(),
            ));
        }
        self.inner.apply_batch(batch)
    }
}
