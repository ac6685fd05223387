use mission_control_core::{
    now_utc, AgentEvent, Decision, DecisionSource, GuardedUpdate, MissionStep, MissionStore,
    NewAgentEvent, NewMissionStep, NewProposal, PipelineConfig, PipelineError, Proposal,
    ProposalId, QueueConfig, Resolution, StepId, StepPatch, StepStatus, WriteBatch,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use crate::events::EventLog;
use crate::gate::ProposalGate;
use crate::queue::MissionQueue;

const REQUIRES_APPROVAL_KEYS: [&str; 2] = ["requiresApproval", "requires_approval"];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepCompletion {
    pub step: MissionStep,
    pub event: AgentEvent,
    pub proposal: Option<Proposal>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DecisionOutcome {
    pub proposal: Proposal,
    pub enqueued: Vec<MissionStep>,
}

/// Wires queue resolutions and gate decisions to their follow-up effects.
#[derive(Clone, Copy)]
pub struct Orchestrator<'a> {
    store: &'a dyn MissionStore,
    queue: MissionQueue<'a>,
    gate: ProposalGate<'a>,
    events: EventLog<'a>,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(store: &'a dyn MissionStore, config: &PipelineConfig) -> Self {
        Self::with_queue_config(store, &config.queue)
    }

    #[must_use]
    pub fn with_queue_config(store: &'a dyn MissionStore, config: &QueueConfig) -> Self {
        Self {
            store,
            queue: MissionQueue::new(store, config),
            gate: ProposalGate::new(store),
            events: EventLog::new(store),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &MissionQueue<'a> {
        &self.queue
    }

    #[must_use]
    pub fn gate(&self) -> &ProposalGate<'a> {
        &self.gate
    }

    #[must_use]
    pub fn events(&self) -> &EventLog<'a> {
        &self.events
    }

    /// Resolves a claimed step and records what happened.
    ///
    /// Success records `<kind>_completed` and, when the result or payload
    /// asks for approval, opens a proposal. Failure records `<kind>_failed`
    /// and never reaches the gate. The resolution, its event and any
    /// proposal are one store write.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] for an unknown id,
    /// [`PipelineError::InvalidTransition`] when the step is not
    /// `processing`, and store errors unchanged. After a store error the
    /// step is still `processing` and the call may be retried.
    pub fn complete_step(
        &self,
        step_id: StepId,
        resolution: Resolution,
    ) -> Result<StepCompletion, PipelineError> {
        self.finish_step(step_id, resolution, &[])
    }

    /// Fails a step that stayed in `processing` past its lease.
    ///
    /// # Errors
    /// Same as [`Orchestrator::complete_step`]; a step resolved concurrently
    /// surfaces as [`PipelineError::InvalidTransition`].
    pub fn reclaim_step(
        &self,
        step_id: StepId,
        reason: String,
    ) -> Result<StepCompletion, PipelineError> {
        self.finish_step(
            step_id,
            Resolution::Failed {
                reason: Some(reason),
            },
            &["recovered"],
        )
    }

    fn finish_step(
        &self,
        step_id: StepId,
        resolution: Resolution,
        extra_tags: &[&str],
    ) -> Result<StepCompletion, PipelineError> {
        let claimed = self.queue.get(step_id)?;
        let target = resolution.target_status();
        if claimed.status != StepStatus::Processing {
            return Err(PipelineError::InvalidTransition {
                id: step_id.to_string(),
                from: claimed.status.to_string(),
                to: target.to_string(),
            });
        }

        let resolved_at = now_utc();
        let step = resolved_view(claimed, &resolution, resolved_at);
        let agent_id = step_agent(&step);
        let proposal = match &step.result {
            Some(result) if requires_approval(&step, result) => {
                Some(recommendation_proposal(&step, result, &agent_id))
            }
            _ => None,
        };
        let batch = WriteBatch::new(GuardedUpdate::Step {
            step_id,
            expected: StepStatus::Processing,
            patch: StepPatch::Resolve {
                resolution,
                resolved_at,
            },
        })
        .with_event(completion_event(&step, &agent_id, extra_tags))
        .with_proposal(proposal);

        let Some(outcome) = self.store.apply_batch(&batch)? else {
            let current = self.queue.get(step_id)?;
            return Err(PipelineError::InvalidTransition {
                id: step_id.to_string(),
                from: current.status.to_string(),
                to: target.to_string(),
            });
        };
        tracing::info!(step_id = %step_id, status = %step.status, "mission step resolved");

        let event = outcome.events.into_iter().next().ok_or_else(|| {
            PipelineError::Store(format!("step {step_id} resolved without its event"))
        })?;
        let proposal = outcome.proposals.into_iter().next();
        if let Some(proposal) = &proposal {
            tracing::info!(
                proposal_id = %proposal.proposal_id,
                step_id = %step_id,
                "proposal created from step result"
            );
        }

        Ok(StepCompletion {
            step,
            event,
            proposal,
        })
    }

    /// Decides a proposal and, on approval, enqueues its proposed steps in
    /// the same store write. Steps inherit the proposer's `agent_id` unless
    /// their payload names one.
    ///
    /// # Errors
    /// Returns the gate's decide errors. On any error nothing was written.
    pub fn decide(
        &self,
        proposal_id: ProposalId,
        decision: Decision,
        source: DecisionSource,
    ) -> Result<DecisionOutcome, PipelineError> {
        let (proposal, enqueued) =
            self.gate
                .decide_with(proposal_id, decision, source, |decided| match decision {
                    Decision::Approved => follow_up_steps(decided),
                    Decision::Rejected => Vec::new(),
                })?;

        for step in &enqueued {
            tracing::info!(
                step_id = %step.step_id,
                kind = %step.kind,
                proposal_id = %proposal_id,
                "mission step enqueued"
            );
        }
        Ok(DecisionOutcome { proposal, enqueued })
    }
}

fn follow_up_steps(proposal: &Proposal) -> Vec<NewMissionStep> {
    proposal
        .proposed_steps()
        .into_iter()
        .map(|proposed| {
            let mut payload = proposed.payload;
            if let Value::Object(fields) = &mut payload {
                fields
                    .entry("agent_id")
                    .or_insert_with(|| Value::String(proposal.agent_id.clone()));
            }
            let mut step = NewMissionStep::new(proposed.kind, &proposal.project, payload);
            step.proposal_id = Some(proposal.proposal_id);
            step
        })
        .collect()
}

/// The step as it reads once `resolution` has been applied.
fn resolved_view(
    claimed: MissionStep,
    resolution: &Resolution,
    resolved_at: OffsetDateTime,
) -> MissionStep {
    let (result, error) = match resolution {
        Resolution::Succeeded { result } => (Some(result.clone()), None),
        Resolution::Failed { reason } => (None, reason.clone()),
    };
    MissionStep {
        status: resolution.target_status(),
        result,
        error,
        updated_at: resolved_at,
        ..claimed
    }
}

fn completion_event(step: &MissionStep, agent_id: &str, extra_tags: &[&str]) -> NewAgentEvent {
    let topic = step_topic(step);
    let event = match step.status {
        StepStatus::Succeeded => {
            let summary = step
                .result
                .as_ref()
                .and_then(|result| result.get("summary"))
                .and_then(Value::as_str)
                .map_or_else(|| format!("Step {} succeeded", step.step_id), ToString::to_string);
            NewAgentEvent::new(
                agent_id,
                format!("{}_completed", step.kind),
                format!("{}: {topic}", title_case(&step.kind)),
                summary,
            )
        }
        _ => NewAgentEvent::new(
            agent_id,
            format!("{}_failed", step.kind),
            format!("Task Failed: {topic}"),
            step.error
                .clone()
                .unwrap_or_else(|| format!("Step {} failed", step.step_id)),
        )
        .with_tag("failed"),
    };
    event
        .with_project(&step.project)
        .with_tags([step.kind.clone(), format!("step:{}", step.step_id)])
        .with_tags(extra_tags.iter().copied())
}

/// True when the result, or failing that the payload, sets an approval flag.
#[must_use]
pub fn requires_approval(step: &MissionStep, result: &Value) -> bool {
    [result, &step.payload].iter().any(|value| {
        REQUIRES_APPROVAL_KEYS
            .iter()
            .any(|key| value.get(key).and_then(Value::as_bool) == Some(true))
    })
}

fn step_agent(step: &MissionStep) -> String {
    step.payload_str("agent_id")
        .map(ToString::to_string)
        .or_else(|| step.claimed_by.clone())
        .unwrap_or_else(|| "system".to_string())
}

fn step_topic(step: &MissionStep) -> String {
    step.payload_str("topic")
        .map_or_else(|| step.step_id.to_string(), ToString::to_string)
}

fn title_case(kind: &str) -> String {
    let words: Vec<String> = kind
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect();
    words.join(" ")
}

fn recommendation_proposal(step: &MissionStep, result: &Value, agent_id: &str) -> NewProposal {
    let topic = step_topic(step);
    let recommendation = result.get("recommendation").cloned();

    let mut body = Map::new();
    body.insert("source_step_id".to_string(), json!(step.step_id));
    body.insert("source_kind".to_string(), json!(step.kind));
    body.insert("topic".to_string(), json!(topic));
    if let Some(recommendation) = &recommendation {
        body.insert("recommendation".to_string(), recommendation.clone());
    }
    if let Some(steps) = result.get("proposed_steps").filter(|steps| steps.is_array()) {
        body.insert("proposed_steps".to_string(), steps.clone());
    }

    let prefix = if recommendation.is_some() {
        "Recommendation"
    } else {
        "Proposal"
    };
    NewProposal {
        agent_id: agent_id.to_string(),
        project: step.project.clone(),
        title: format!("{prefix}: {topic}"),
        body: Value::Object(body),
    }
}
