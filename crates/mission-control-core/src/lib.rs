//! Domain model for the mission control operations pipeline.
//!
//! Three record types make up the pipeline: [`MissionStep`] (queued work),
//! [`Proposal`] (agent-authored actions awaiting a decision) and
//! [`AgentEvent`] (append-only audit entries). All of them are owned by a
//! [`MissionStore`]; every status transition is a guarded write against that
//! store, so the store row is the only lock.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, Time, UtcOffset};
use ulid::Ulid;

pub const APPLY_PROPOSAL_STEP_KIND: &str = "apply_proposal";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PipelineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("proposal {id} already resolved as {status}")]
    AlreadyResolved { id: String, status: String },
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },
    #[error("transient store error: {0}")]
    TransientStore(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Stable machine-readable code used by the CLI and HTTP envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyResolved { .. } => "already_resolved",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::TransientStore(_) => "transient_store_error",
            Self::Store(_) => "store_error",
            Self::Validation(_) => "validation_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses a ULID string into an identifier.
            ///
            /// # Errors
            /// Returns [`PipelineError::Validation`] when the value is not a ULID.
            pub fn parse(value: &str) -> Result<Self, PipelineError> {
                Ulid::from_string(value.trim()).map(Self).map_err(|err| {
                    PipelineError::Validation(format!(
                        "invalid {} ULID {value:?}: {err}",
                        $label
                    ))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(StepId, "step_id");
ulid_id!(ProposalId, "proposal_id");
ulid_id!(EventId, "event_id");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// The only legal edges are `queued -> processing` and
    /// `processing -> succeeded | failed`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Processing) | (Self::Processing, Self::Succeeded | Self::Failed)
        )
    }
}

impl Display for StepStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ProposalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl Display for ProposalStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    #[must_use]
    pub fn status(self) -> ProposalStatus {
        match self {
            Self::Approved => ProposalStatus::Approved,
            Self::Rejected => ProposalStatus::Rejected,
        }
    }

    #[must_use]
    pub fn event_kind(self) -> &'static str {
        match self {
            Self::Approved => "proposal_approved",
            Self::Rejected => "proposal_rejected",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Human,
    Automated,
}

impl DecisionSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Automated => "automated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "human" => Some(Self::Human),
            "automated" => Some(Self::Automated),
            _ => None,
        }
    }
}

/// Terminal outcome handed to the queue by a worker.
///
/// A result only exists on success, which is how `result` is kept present
/// iff the step status is `succeeded`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Succeeded {
        #[serde(default = "empty_object")]
        result: Value,
    },
    Failed {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl Resolution {
    #[must_use]
    pub fn target_status(&self) -> StepStatus {
        match self {
            Self::Succeeded { .. } => StepStatus::Succeeded,
            Self::Failed { .. } => StepStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissionStep {
    pub step_id: StepId,
    pub kind: String,
    pub project: String,
    pub status: StepStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub claimed_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    pub proposal_id: Option<ProposalId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl MissionStep {
    /// Reads a string field out of the payload, e.g. `topic` or `agent_id`.
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMissionStep {
    pub kind: String,
    pub project: String,
    pub payload: Value,
    #[serde(default)]
    pub proposal_id: Option<ProposalId>,
}

impl NewMissionStep {
    #[must_use]
    pub fn new(kind: impl Into<String>, project: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            project: project.into(),
            payload,
            proposal_id: None,
        }
    }

    /// Validates a step before it is enqueued.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when kind or project is blank or
    /// the payload is not a JSON object.
    pub fn validate(&self) -> Result<(), PipelineError> {
        require_non_blank("kind", &self.kind)?;
        require_non_blank("project", &self.project)?;
        if !self.payload.is_object() {
            return Err(PipelineError::Validation(
                "payload MUST be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

/// Patch applied by a guarded step update. The target status is implied by
/// the patch, the expected prior status is supplied separately.
#[derive(Debug, Clone, PartialEq)]
pub enum StepPatch {
    Claim {
        worker_id: String,
        claimed_at: OffsetDateTime,
    },
    Resolve {
        resolution: Resolution,
        resolved_at: OffsetDateTime,
    },
}

impl StepPatch {
    #[must_use]
    pub fn target_status(&self) -> StepStatus {
        match self {
            Self::Claim { .. } => StepStatus::Processing,
            Self::Resolve { resolution, .. } => resolution.target_status(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepQuery {
    pub project: Option<String>,
    pub kinds: Vec<String>,
    pub status: Option<StepStatus>,
    pub claimed_before: Option<OffsetDateTime>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl StepQuery {
    #[must_use]
    pub fn queued(project: Option<&str>, kinds: &[String], limit: usize) -> Self {
        Self {
            project: project.map(ToString::to_string),
            kinds: kinds.to_vec(),
            status: Some(StepStatus::Queued),
            claimed_before: None,
            order: SortOrder::OldestFirst,
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn matches(&self, step: &MissionStep) -> bool {
        if let Some(project) = &self.project {
            if &step.project != project {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.iter().any(|kind| kind == &step.kind) {
            return false;
        }
        if let Some(status) = self.status {
            if step.status != status {
                return false;
            }
        }
        if let Some(cutoff) = self.claimed_before {
            match step.claimed_at {
                Some(claimed_at) if claimed_at < cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub agent_id: String,
    pub project: String,
    pub title: String,
    pub status: ProposalStatus,
    pub body: Value,
    pub decision_source: Option<DecisionSource>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub decided_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Proposal {
    #[must_use]
    pub fn proposed_steps(&self) -> Vec<ProposedStep> {
        proposed_steps(&self.body)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewProposal {
    pub agent_id: String,
    pub project: String,
    pub title: String,
    pub body: Value,
}

impl NewProposal {
    /// Validates a proposal before it enters the gate.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] for blank agent/project/title or
    /// a body that is not a JSON object.
    pub fn validate(&self) -> Result<(), PipelineError> {
        require_non_blank("agent_id", &self.agent_id)?;
        require_non_blank("project", &self.project)?;
        require_non_blank("title", &self.title)?;
        if !self.body.is_object() {
            return Err(PipelineError::Validation(
                "proposal body MUST be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalPatch {
    pub decision: Decision,
    pub source: DecisionSource,
    pub decided_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProposalQuery {
    pub status: Option<ProposalStatus>,
    pub agent_id: Option<String>,
    pub project: Option<String>,
    pub created_since: Option<OffsetDateTime>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl ProposalQuery {
    #[must_use]
    pub fn matches(&self, proposal: &Proposal) -> bool {
        if let Some(status) = self.status {
            if proposal.status != status {
                return false;
            }
        }
        if let Some(agent_id) = &self.agent_id {
            if &proposal.agent_id != agent_id {
                return false;
            }
        }
        if let Some(project) = &self.project {
            if &proposal.project != project {
                return false;
            }
        }
        if let Some(since) = self.created_since {
            if proposal.created_at < since {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedStep {
    pub kind: String,
    pub payload: Value,
}

/// Extracts the executable steps carried by a proposal body.
///
/// `proposed_steps: [{kind, payload}]` wins when it yields at least one step
/// (entries without a kind are skipped). Otherwise a top-level `kind`
/// (+ `payload`) yields one step, and any other body becomes a single
/// `apply_proposal` step. The result is never empty.
#[must_use]
pub fn proposed_steps(body: &Value) -> Vec<ProposedStep> {
    if let Some(entries) = body.get("proposed_steps").and_then(Value::as_array) {
        let listed: Vec<ProposedStep> =
            entries.iter().filter_map(proposed_step_from_entry).collect();
        if !listed.is_empty() {
            return listed;
        }
    }

    if let Some(step) = proposed_step_from_entry(body) {
        return vec![step];
    }

    vec![ProposedStep {
        kind: APPLY_PROPOSAL_STEP_KIND.to_string(),
        payload: if body.is_object() {
            body.clone()
        } else {
            empty_object()
        },
    }]
}

fn proposed_step_from_entry(entry: &Value) -> Option<ProposedStep> {
    let kind = entry
        .get("kind")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|kind| !kind.is_empty())?;
    let payload = entry
        .get("payload")
        .filter(|payload| payload.is_object())
        .cloned()
        .unwrap_or_else(empty_object);
    Some(ProposedStep {
        kind: kind.to_string(),
        payload,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    pub event_seq: i64,
    pub event_id: EventId,
    pub agent_id: String,
    pub project: Option<String>,
    pub kind: String,
    pub title: String,
    pub summary: String,
    pub tags: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAgentEvent {
    pub agent_id: String,
    #[serde(default)]
    pub project: Option<String>,
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl NewAgentEvent {
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        kind: impl Into<String>,
        title: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            project: None,
            kind: kind.into(),
            title: title.into(),
            summary: summary.into(),
            tags: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        let project = project.into();
        if !project.trim().is_empty() {
            self.tags.insert(project.trim().to_string());
            self.project = Some(project);
        }
        self
    }

    /// Adds a tag; blank tags are dropped since tags only serve filtering.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        let trimmed = tag.trim();
        if !trimmed.is_empty() {
            self.tags.insert(trimmed.to_string());
        }
        self
    }

    #[must_use]
    pub fn with_tags<I, T>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        tags.into_iter().fold(self, Self::with_tag)
    }

    /// Validates an event before append.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when agent, kind or title is
    /// blank, or a tag is blank.
    pub fn validate(&self) -> Result<(), PipelineError> {
        require_non_blank("agent_id", &self.agent_id)?;
        require_non_blank("kind", &self.kind)?;
        require_non_blank("title", &self.title)?;
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(PipelineError::Validation(
                "tags MUST NOT contain blank entries".to_string(),
            ));
        }
        Ok(())
    }
}

/// Filter for event reads. Results are always newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub agent_id: Option<String>,
    pub kind: Option<String>,
    pub tag: Option<String>,
    pub since: Option<OffsetDateTime>,
    pub limit: Option<usize>,
}

impl EventQuery {
    #[must_use]
    pub fn matches(&self, event: &AgentEvent) -> bool {
        if let Some(agent_id) = &self.agent_id {
            if &event.agent_id != agent_id {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &event.kind != kind {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !event.tags.contains(tag) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }
}

/// Status change a [`WriteBatch`] hinges on.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardedUpdate {
    Step {
        step_id: StepId,
        expected: StepStatus,
        patch: StepPatch,
    },
    Proposal {
        proposal_id: ProposalId,
        expected: ProposalStatus,
        patch: ProposalPatch,
    },
}

impl GuardedUpdate {
    /// Rejects patches that could never apply from `expected`.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidTransition`] for a backwards edge.
    pub fn check(&self) -> Result<(), PipelineError> {
        match self {
            Self::Step {
                step_id,
                expected,
                patch,
            } => {
                let target = patch.target_status();
                if expected.can_transition_to(target) {
                    Ok(())
                } else {
                    Err(PipelineError::InvalidTransition {
                        id: step_id.to_string(),
                        from: expected.to_string(),
                        to: target.to_string(),
                    })
                }
            }
            Self::Proposal {
                proposal_id,
                expected,
                patch,
            } => {
                if *expected == ProposalStatus::Pending {
                    Ok(())
                } else {
                    Err(PipelineError::InvalidTransition {
                        id: proposal_id.to_string(),
                        from: expected.to_string(),
                        to: patch.decision.status().to_string(),
                    })
                }
            }
        }
    }
}

/// A guarded update together with the rows that must land with it.
///
/// Stores apply the whole batch or nothing: when the guard affects no row,
/// or any insert fails, none of the batch is visible afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    pub guard: GuardedUpdate,
    pub events: Vec<NewAgentEvent>,
    pub steps: Vec<NewMissionStep>,
    pub proposals: Vec<NewProposal>,
}

impl WriteBatch {
    #[must_use]
    pub fn new(guard: GuardedUpdate) -> Self {
        Self {
            guard,
            events: Vec::new(),
            steps: Vec::new(),
            proposals: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_event(mut self, event: NewAgentEvent) -> Self {
        self.events.push(event);
        self
    }

    #[must_use]
    pub fn with_steps(mut self, steps: impl IntoIterator<Item = NewMissionStep>) -> Self {
        self.steps.extend(steps);
        self
    }

    #[must_use]
    pub fn with_proposal(mut self, proposal: Option<NewProposal>) -> Self {
        self.proposals.extend(proposal);
        self
    }

    /// Validates the guard and every row before anything is written.
    ///
    /// # Errors
    /// Returns the first validation or transition error found.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.guard.check()?;
        for event in &self.events {
            event.validate()?;
        }
        for step in &self.steps {
            step.validate()?;
        }
        for proposal in &self.proposals {
            proposal.validate()?;
        }
        Ok(())
    }
}

/// Rows written by an applied [`WriteBatch`], in batch order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub events: Vec<AgentEvent>,
    pub steps: Vec<MissionStep>,
    pub proposals: Vec<Proposal>,
}

/// Persistence gateway over the three pipeline tables plus the policy table.
///
/// Guarded updates return the number of affected rows: `1` when the row was
/// still in the `expected` status and the patch applied, `0` otherwise.
/// Callers treat `0` as a lost race and never write without re-checking the
/// precondition at write time.
pub trait MissionStore {
    #[allow(clippy::missing_errors_doc)]
    fn insert_mission_step(&self, step: &NewMissionStep) -> Result<MissionStep, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn update_mission_step(
        &self,
        step_id: StepId,
        expected: StepStatus,
        patch: &StepPatch,
    ) -> Result<usize, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn select_mission_step(&self, step_id: StepId) -> Result<Option<MissionStep>, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn select_mission_steps(&self, query: &StepQuery) -> Result<Vec<MissionStep>, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_proposal(&self, proposal: &NewProposal) -> Result<Proposal, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn update_proposal(
        &self,
        proposal_id: ProposalId,
        expected: ProposalStatus,
        patch: &ProposalPatch,
    ) -> Result<usize, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn select_proposal(&self, proposal_id: ProposalId) -> Result<Option<Proposal>, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn select_proposals(&self, query: &ProposalQuery) -> Result<Vec<Proposal>, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_agent_event(&self, event: &NewAgentEvent) -> Result<AgentEvent, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn select_agent_events(&self, query: &EventQuery) -> Result<Vec<AgentEvent>, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_policy(&self, key: &str) -> Result<Option<Value>, PipelineError>;

    #[allow(clippy::missing_errors_doc)]
    fn put_policy(&self, key: &str, value: &Value) -> Result<(), PipelineError>;

    /// Applies `batch` atomically. `None` means the guard matched no row and
    /// nothing was written.
    #[allow(clippy::missing_errors_doc)]
    fn apply_batch(&self, batch: &WriteBatch) -> Result<Option<BatchOutcome>, PipelineError>;
}

#[derive(Debug, Default)]
struct MemoryTables {
    steps: Vec<MissionStep>,
    proposals: Vec<Proposal>,
    events: Vec<AgentEvent>,
    policy: BTreeMap<String, Value>,
}

/// In-process [`MissionStore`] for tests and embedded use.
///
/// Each call holds the table mutex for its whole duration, which gives the
/// same single-row serialization a database update provides.
#[derive(Debug, Default)]
pub struct MemoryMissionStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryMissionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, MemoryTables>, PipelineError> {
        self.tables
            .lock()
            .map_err(|_| PipelineError::Store("in-memory store mutex poisoned".to_string()))
    }
}

impl MemoryTables {
    fn push_step(&mut self, step: &NewMissionStep) -> MissionStep {
        let now = now_utc();
        let record = MissionStep {
            step_id: StepId::new(),
            kind: step.kind.trim().to_string(),
            project: step.project.trim().to_string(),
            status: StepStatus::Queued,
            payload: step.payload.clone(),
            result: None,
            error: None,
            claimed_by: None,
            claimed_at: None,
            proposal_id: step.proposal_id,
            created_at: now,
            updated_at: now,
        };
        self.steps.push(record.clone());
        record
    }

    fn push_proposal(&mut self, proposal: &NewProposal) -> Proposal {
        let now = now_utc();
        let record = Proposal {
            proposal_id: ProposalId::new(),
            agent_id: proposal.agent_id.trim().to_string(),
            project: proposal.project.trim().to_string(),
            title: proposal.title.clone(),
            status: ProposalStatus::Pending,
            body: proposal.body.clone(),
            decision_source: None,
            decided_at: None,
            created_at: now,
            updated_at: now,
        };
        self.proposals.push(record.clone());
        record
    }

    fn push_event(&mut self, event: &NewAgentEvent) -> AgentEvent {
        let event_seq = self
            .events
            .last()
            .map_or(1, |last| last.event_seq.saturating_add(1));
        let record = AgentEvent {
            event_seq,
            event_id: EventId::new(),
            agent_id: event.agent_id.trim().to_string(),
            project: event.project.clone(),
            kind: event.kind.trim().to_string(),
            title: event.title.clone(),
            summary: event.summary.clone(),
            tags: event.tags.clone(),
            created_at: now_utc(),
        };
        self.events.push(record.clone());
        record
    }

    /// Applies an already checked guard; returns the affected-row count.
    fn apply_guard(&mut self, guard: &GuardedUpdate) -> usize {
        match guard {
            GuardedUpdate::Step {
                step_id,
                expected,
                patch,
            } => {
                let Some(step) = self
                    .steps
                    .iter_mut()
                    .find(|step| step.step_id == *step_id && step.status == *expected)
                else {
                    return 0;
                };
                step.status = patch.target_status();
                match patch {
                    StepPatch::Claim {
                        worker_id,
                        claimed_at,
                    } => {
                        step.claimed_by = Some(worker_id.clone());
                        step.claimed_at = Some(*claimed_at);
                        step.updated_at = *claimed_at;
                    }
                    StepPatch::Resolve {
                        resolution,
                        resolved_at,
                    } => {
                        match resolution {
                            Resolution::Succeeded { result } => step.result = Some(result.clone()),
                            Resolution::Failed { reason } => step.error.clone_from(reason),
                        }
                        step.updated_at = *resolved_at;
                    }
                }
                1
            }
            GuardedUpdate::Proposal {
                proposal_id,
                expected,
                patch,
            } => {
                let Some(proposal) = self.proposals.iter_mut().find(|proposal| {
                    proposal.proposal_id == *proposal_id && proposal.status == *expected
                }) else {
                    return 0;
                };
                proposal.status = patch.decision.status();
                proposal.decision_source = Some(patch.source);
                proposal.decided_at = Some(patch.decided_at);
                proposal.updated_at = patch.decided_at;
                1
            }
        }
    }
}

impl MissionStore for MemoryMissionStore {
    fn insert_mission_step(&self, step: &NewMissionStep) -> Result<MissionStep, PipelineError> {
        step.validate()?;
        Ok(self.tables()?.push_step(step))
    }

    fn update_mission_step(
        &self,
        step_id: StepId,
        expected: StepStatus,
        patch: &StepPatch,
    ) -> Result<usize, PipelineError> {
        let guard = GuardedUpdate::Step {
            step_id,
            expected,
            patch: patch.clone(),
        };
        guard.check()?;
        Ok(self.tables()?.apply_guard(&guard))
    }

    fn select_mission_step(&self, step_id: StepId) -> Result<Option<MissionStep>, PipelineError> {
        Ok(self
            .tables()?
            .steps
            .iter()
            .find(|step| step.step_id == step_id)
            .cloned())
    }

    fn select_mission_steps(&self, query: &StepQuery) -> Result<Vec<MissionStep>, PipelineError> {
        let tables = self.tables()?;
        let matching = tables.steps.iter().filter(|step| query.matches(step));
        let ordered: Vec<MissionStep> = match query.order {
            SortOrder::OldestFirst => matching.cloned().collect(),
            SortOrder::NewestFirst => matching.rev().cloned().collect(),
        };
        Ok(apply_limit(ordered, query.limit))
    }

    fn insert_proposal(&self, proposal: &NewProposal) -> Result<Proposal, PipelineError> {
        proposal.validate()?;
        Ok(self.tables()?.push_proposal(proposal))
    }

    fn update_proposal(
        &self,
        proposal_id: ProposalId,
        expected: ProposalStatus,
        patch: &ProposalPatch,
    ) -> Result<usize, PipelineError> {
        let guard = GuardedUpdate::Proposal {
            proposal_id,
            expected,
            patch: patch.clone(),
        };
        guard.check()?;
        Ok(self.tables()?.apply_guard(&guard))
    }

    fn select_proposal(&self, proposal_id: ProposalId) -> Result<Option<Proposal>, PipelineError> {
        Ok(self
            .tables()?
            .proposals
            .iter()
            .find(|proposal| proposal.proposal_id == proposal_id)
            .cloned())
    }

    fn select_proposals(&self, query: &ProposalQuery) -> Result<Vec<Proposal>, PipelineError> {
        let tables = self.tables()?;
        let matching = tables
            .proposals
            .iter()
            .filter(|proposal| query.matches(proposal));
        let ordered: Vec<Proposal> = match query.order {
            SortOrder::OldestFirst => matching.cloned().collect(),
            SortOrder::NewestFirst => matching.rev().cloned().collect(),
        };
        Ok(apply_limit(ordered, query.limit))
    }

    fn insert_agent_event(&self, event: &NewAgentEvent) -> Result<AgentEvent, PipelineError> {
        event.validate()?;
        Ok(self.tables()?.push_event(event))
    }

    fn select_agent_events(&self, query: &EventQuery) -> Result<Vec<AgentEvent>, PipelineError> {
        let tables = self.tables()?;
        let newest_first: Vec<AgentEvent> = tables
            .events
            .iter()
            .rev()
            .filter(|event| query.matches(event))
            .cloned()
            .collect();
        Ok(apply_limit(newest_first, query.limit))
    }

    fn get_policy(&self, key: &str) -> Result<Option<Value>, PipelineError> {
        Ok(self.tables()?.policy.get(key).cloned())
    }

    fn put_policy(&self, key: &str, value: &Value) -> Result<(), PipelineError> {
        require_non_blank("policy key", key)?;
        self.tables()?
            .policy
            .insert(key.trim().to_string(), value.clone());
        Ok(())
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<Option<BatchOutcome>, PipelineError> {
        batch.validate()?;
        let mut tables = self.tables()?;
        if tables.apply_guard(&batch.guard) == 0 {
            return Ok(None);
        }
        Ok(Some(BatchOutcome {
            events: batch.events.iter().map(|event| tables.push_event(event)).collect(),
            steps: batch.steps.iter().map(|step| tables.push_step(step)).collect(),
            proposals: batch
                .proposals
                .iter()
                .map(|proposal| tables.push_proposal(proposal))
                .collect(),
        }))
    }
}

fn apply_limit<T>(mut values: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        values.truncate(limit);
    }
    values
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Candidates read per claim attempt before re-reading the queue.
    pub claim_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub jitter_ms: u64,
    /// Consecutive empty polls tolerated at the base interval before backoff.
    pub max_empty_polls: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// A paused worker sleeps this many poll intervals between checks.
    pub disabled_sleep_multiplier: u32,
    /// Tries at recording a finished step before leaving it to the lease
    /// reclaim. Only transient store errors are retried.
    pub resolve_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 15_000,
            jitter_ms: 2_000,
            max_empty_polls: 4,
            backoff_multiplier: 2.0,
            max_backoff_ms: 120_000,
            disabled_sleep_multiplier: 4,
            resolve_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TriggerRule {
    pub name: String,
    pub agent_id: String,
    pub project: String,
    pub title: String,
    pub step_kind: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    /// Event kind whose recency gates the rule, e.g. `research_completed`.
    pub watch_event_kind: String,
    pub cooldown_minutes: u64,
    #[serde(default = "default_fire_probability")]
    pub fire_probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatConfig {
    pub stuck_after_minutes: u64,
    pub daily_proposal_quota: u32,
    pub auto_approve_batch: usize,
    pub auto_approve_agents: Vec<String>,
    pub auto_approve_step_kinds: Vec<String>,
    pub review_required_agents: Vec<String>,
    pub triggers: Vec<TriggerRule>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            stuck_after_minutes: 30,
            daily_proposal_quota: 10,
            auto_approve_batch: 5,
            auto_approve_agents: Vec::new(),
            auto_approve_step_kinds: vec!["research".to_string()],
            review_required_agents: Vec::new(),
            triggers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub bind: String,
    pub operation_timeout_ms: u64,
    /// Bearer token required by `POST /v1/heartbeat`; open when unset.
    pub heartbeat_token: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4020".to_string(),
            operation_timeout_ms: 2_500,
            heartbeat_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub heartbeat: HeartbeatConfig,
    pub service: ServiceConfig,
}

impl PipelineConfig {
    /// Decodes and validates a TOML configuration document.
    ///
    /// # Errors
    /// Returns [`PipelineError::Configuration`] when decoding fails or a
    /// value is out of range.
    pub fn from_toml_str(raw: &str) -> Result<Self, PipelineError> {
        let config: Self = toml::from_str(raw).map_err(|err| {
            PipelineError::Configuration(format!("invalid pipeline config TOML: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates numeric bounds and trigger definitions.
    ///
    /// # Errors
    /// Returns [`PipelineError::Configuration`] naming the first offending
    /// field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.queue.claim_batch_size == 0 {
            return Err(PipelineError::Configuration(
                "queue.claim_batch_size MUST be >= 1".to_string(),
            ));
        }

        let worker = &self.worker;
        if !worker.backoff_multiplier.is_finite() || worker.backoff_multiplier < 1.0 {
            return Err(PipelineError::Configuration(
                "worker.backoff_multiplier MUST be a finite value >= 1.0".to_string(),
            ));
        }
        if worker.max_backoff_ms < worker.poll_interval_ms {
            return Err(PipelineError::Configuration(
                "worker.max_backoff_ms MUST be >= worker.poll_interval_ms".to_string(),
            ));
        }
        if worker.disabled_sleep_multiplier == 0 {
            return Err(PipelineError::Configuration(
                "worker.disabled_sleep_multiplier MUST be >= 1".to_string(),
            ));
        }
        if worker.resolve_attempts == 0 {
            return Err(PipelineError::Configuration(
                "worker.resolve_attempts MUST be >= 1".to_string(),
            ));
        }

        let heartbeat = &self.heartbeat;
        if heartbeat.stuck_after_minutes == 0 {
            return Err(PipelineError::Configuration(
                "heartbeat.stuck_after_minutes MUST be >= 1".to_string(),
            ));
        }
        if heartbeat.auto_approve_batch == 0 {
            return Err(PipelineError::Configuration(
                "heartbeat.auto_approve_batch MUST be >= 1".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        for rule in &heartbeat.triggers {
            for (field, value) in [
                ("name", &rule.name),
                ("agent_id", &rule.agent_id),
                ("project", &rule.project),
                ("title", &rule.title),
                ("step_kind", &rule.step_kind),
                ("watch_event_kind", &rule.watch_event_kind),
            ] {
                if value.trim().is_empty() {
                    return Err(PipelineError::Configuration(format!(
                        "heartbeat.triggers[].{field} MUST be provided"
                    )));
                }
            }
            if !names.insert(rule.name.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate trigger name: {}",
                    rule.name
                )));
            }
            if !(0.0..=1.0).contains(&rule.fire_probability) {
                return Err(PipelineError::Configuration(format!(
                    "trigger {}: fire_probability MUST be in [0.0, 1.0]",
                    rule.name
                )));
            }
            if !rule.payload.is_object() {
                return Err(PipelineError::Configuration(format!(
                    "trigger {}: payload MUST be a table",
                    rule.name
                )));
            }
        }

        if self.service.operation_timeout_ms == 0 {
            return Err(PipelineError::Configuration(
                "service.operation_timeout_ms MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_fire_probability() -> f64 {
    1.0
}

#[must_use]
pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn require_non_blank(field: &str, value: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::Validation(format!(
            "{field} MUST be provided"
        )));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, PipelineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| PipelineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(PipelineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, PipelineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            PipelineError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn start_of_utc_day(value: OffsetDateTime) -> OffsetDateTime {
    value.to_offset(UtcOffset::UTC).replace_time(Time::MIDNIGHT)
}
