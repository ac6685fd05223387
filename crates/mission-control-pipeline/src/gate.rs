use mission_control_core::{
    now_utc, Decision, DecisionSource, GuardedUpdate, MissionStep, MissionStore, NewAgentEvent,
    NewMissionStep, NewProposal, PipelineError, Proposal, ProposalId, ProposalPatch,
    ProposalQuery, ProposalStatus, WriteBatch,
};

/// Holds agent proposals until a human or automated decision arrives.
///
/// `decide` is the only write besides `propose`. It never performs the
/// approved work itself; the orchestrator turns approvals into queued steps.
#[derive(Clone, Copy)]
pub struct ProposalGate<'a> {
    store: &'a dyn MissionStore,
}

impl<'a> ProposalGate<'a> {
    #[must_use]
    pub fn new(store: &'a dyn MissionStore) -> Self {
        Self { store }
    }

    /// Stores a proposal in `pending`.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] for malformed proposals and
    /// store errors unchanged.
    pub fn propose(&self, proposal: &NewProposal) -> Result<Proposal, PipelineError> {
        let stored = self.store.insert_proposal(proposal)?;
        tracing::info!(
            proposal_id = %stored.proposal_id,
            agent_id = %stored.agent_id,
            project = %stored.project,
            "proposal created"
        );
        Ok(stored)
    }

    /// Resolves a pending proposal exactly once and records the decision
    /// event.
    ///
    /// The read only short-circuits obvious conflicts; the guarded write is
    /// what serializes concurrent deciders.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] for unknown ids,
    /// [`PipelineError::AlreadyResolved`] when the proposal is no longer
    /// pending at read or write time, and store errors unchanged.
    pub fn decide(
        &self,
        proposal_id: ProposalId,
        decision: Decision,
        source: DecisionSource,
    ) -> Result<Proposal, PipelineError> {
        self.decide_with(proposal_id, decision, source, |_| Vec::new())
            .map(|(decided, _)| decided)
    }

    /// Same as [`ProposalGate::decide`], enqueuing `follow_ups(&decided)` in
    /// the same store write as the decision and its event. A failed write
    /// leaves the proposal pending, so retrying is safe.
    ///
    /// # Errors
    /// Same as [`ProposalGate::decide`], plus validation errors for the
    /// follow-up steps.
    pub fn decide_with<F>(
        &self,
        proposal_id: ProposalId,
        decision: Decision,
        source: DecisionSource,
        follow_ups: F,
    ) -> Result<(Proposal, Vec<MissionStep>), PipelineError>
    where
        F: FnOnce(&Proposal) -> Vec<NewMissionStep>,
    {
        let proposal = self.get(proposal_id)?;
        if proposal.status != ProposalStatus::Pending {
            return Err(already_resolved(proposal_id, proposal.status));
        }

        let decided_at = now_utc();
        let decided = Proposal {
            status: decision.status(),
            decision_source: Some(source),
            decided_at: Some(decided_at),
            updated_at: decided_at,
            ..proposal
        };
        let batch = WriteBatch::new(GuardedUpdate::Proposal {
            proposal_id,
            expected: ProposalStatus::Pending,
            patch: ProposalPatch {
                decision,
                source,
                decided_at,
            },
        })
        .with_event(decision_event(&decided, decision, source))
        .with_steps(follow_ups(&decided));

        let Some(outcome) = self.store.apply_batch(&batch)? else {
            let current = self.get(proposal_id)?;
            tracing::debug!(proposal_id = %proposal_id, status = %current.status, "decision lost");
            return Err(already_resolved(proposal_id, current.status));
        };

        tracing::info!(
            proposal_id = %proposal_id,
            decision = decision.as_str(),
            source = source.as_str(),
            enqueued = outcome.steps.len(),
            "proposal decided"
        );
        Ok((decided, outcome.steps))
    }

    /// # Errors
    /// Returns [`PipelineError::NotFound`] for an unknown id.
    pub fn get(&self, proposal_id: ProposalId) -> Result<Proposal, PipelineError> {
        self.store
            .select_proposal(proposal_id)?
            .ok_or_else(|| PipelineError::NotFound {
                entity: "proposal",
                id: proposal_id.to_string(),
            })
    }

    /// # Errors
    /// Propagates store errors.
    pub fn list(&self, query: &ProposalQuery) -> Result<Vec<Proposal>, PipelineError> {
        self.store.select_proposals(query)
    }
}

/// Tag linking an event to the proposal it concerns.
#[must_use]
pub fn proposal_tag(proposal_id: ProposalId) -> String {
    format!("proposal:{proposal_id}")
}

fn already_resolved(proposal_id: ProposalId, status: ProposalStatus) -> PipelineError {
    PipelineError::AlreadyResolved {
        id: proposal_id.to_string(),
        status: status.to_string(),
    }
}

fn decision_event(proposal: &Proposal, decision: Decision, source: DecisionSource) -> NewAgentEvent {
    let (title, summary) = match (decision, source) {
        (Decision::Approved, DecisionSource::Human) => (
            format!("Approved: {}", proposal.title),
            "Manually approved by user",
        ),
        (Decision::Approved, DecisionSource::Automated) => (
            format!("Approved: {}", proposal.title),
            "Automatically approved by policy",
        ),
        (Decision::Rejected, DecisionSource::Human) => (
            format!("Rejected: {}", proposal.title),
            "Manually rejected by user",
        ),
        (Decision::Rejected, DecisionSource::Automated) => (
            format!("Rejected: {}", proposal.title),
            "Automatically rejected by policy",
        ),
    };

    NewAgentEvent::new(&proposal.agent_id, decision.event_kind(), title, summary)
        .with_project(&proposal.project)
        .with_tags([
            decision.as_str().to_string(),
            proposal.agent_id.clone(),
            proposal_tag(proposal.proposal_id),
        ])
}
