//! Periodic housekeeping: proactive triggers, the daily proposal quota,
//! policy-driven auto-approval and reclaiming steps whose worker went away.

use mission_control_core::{
    start_of_utc_day, Decision, DecisionSource, EventQuery, HeartbeatConfig, MissionStore,
    NewAgentEvent, NewProposal, PipelineConfig, PipelineError, Proposal, ProposalId,
    ProposalQuery, ProposalStatus, SortOrder, StepId, StepQuery, StepStatus, TriggerRule,
};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};

use crate::gate::proposal_tag;
use crate::orchestrator::Orchestrator;
use crate::policy;

pub const HEARTBEAT_AGENT: &str = "system";
pub const APPROVAL_NEEDED_KIND: &str = "approval_needed";

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub triggers_evaluated: usize,
    pub triggers_fired: Vec<String>,
    pub proposals_created: Vec<ProposalId>,
    pub quota_limit: u32,
    pub quota_skipped: usize,
    pub auto_approved: Vec<ProposalId>,
    pub steps_enqueued: usize,
    pub approval_requests: Vec<ProposalId>,
    pub recovered: Vec<StepId>,
    pub heartbeat_event_seq: i64,
}

pub struct Heartbeat<'a> {
    store: &'a dyn MissionStore,
    orchestrator: Orchestrator<'a>,
    config: &'a HeartbeatConfig,
}

impl<'a> Heartbeat<'a> {
    #[must_use]
    pub fn new(store: &'a dyn MissionStore, config: &'a PipelineConfig) -> Self {
        Self {
            store,
            orchestrator: Orchestrator::new(store, config),
            config: &config.heartbeat,
        }
    }

    /// Runs one heartbeat using the thread-local RNG for trigger draws.
    ///
    /// # Errors
    /// Stops at the first store error; work done before it stays done.
    pub fn run(&self, now: OffsetDateTime) -> Result<HeartbeatReport, PipelineError> {
        self.run_with_rng(now, &mut rand::thread_rng())
    }

    /// Runs one heartbeat with a caller-supplied RNG.
    ///
    /// # Errors
    /// Stops at the first store error; work done before it stays done.
    pub fn run_with_rng<R: Rng>(
        &self,
        now: OffsetDateTime,
        rng: &mut R,
    ) -> Result<HeartbeatReport, PipelineError> {
        let mut report = HeartbeatReport::default();

        let fired = self.fired_triggers(now, rng, &mut report)?;
        self.create_trigger_proposals(now, &fired, &mut report)?;
        self.auto_approve(&mut report)?;
        self.reclaim_stuck(now, &mut report)?;

        let summary = format!(
            "Triggers: {}, Proposals: {}, Approved: {}, Recovered: {}",
            report.triggers_fired.len(),
            report.proposals_created.len(),
            report.auto_approved.len(),
            report.recovered.len(),
        );
        let event = self.orchestrator.events().record(
            &NewAgentEvent::new(HEARTBEAT_AGENT, "heartbeat", "Heartbeat", summary.clone())
                .with_tag("heartbeat"),
        )?;
        report.heartbeat_event_seq = event.event_seq;

        tracing::info!(%summary, "heartbeat complete");
        Ok(report)
    }

    fn fired_triggers<R: Rng>(
        &self,
        now: OffsetDateTime,
        rng: &mut R,
        report: &mut HeartbeatReport,
    ) -> Result<Vec<&'a TriggerRule>, PipelineError> {
        let mut fired = Vec::new();
        for rule in &self.config.triggers {
            report.triggers_evaluated += 1;
            let window_start = minutes_before(now, rule.cooldown_minutes);

            let recent_activity = self.orchestrator.events().list(&EventQuery {
                agent_id: Some(rule.agent_id.clone()),
                kind: Some(rule.watch_event_kind.clone()),
                since: Some(window_start),
                limit: Some(1),
                ..EventQuery::default()
            })?;
            if !recent_activity.is_empty() {
                tracing::debug!(trigger = %rule.name, "trigger cooling down after activity");
                continue;
            }

            let recent_proposal = self
                .store
                .select_proposals(&ProposalQuery {
                    agent_id: Some(rule.agent_id.clone()),
                    created_since: Some(window_start),
                    ..ProposalQuery::default()
                })?
                .into_iter()
                .any(|proposal| proposal.title == rule.title);
            if recent_proposal {
                tracing::debug!(trigger = %rule.name, "trigger cooling down after proposal");
                continue;
            }

            if rng.gen::<f64>() >= rule.fire_probability {
                tracing::debug!(trigger = %rule.name, "trigger skipped by probability");
                continue;
            }

            report.triggers_fired.push(rule.name.clone());
            fired.push(rule);
        }
        Ok(fired)
    }

    fn create_trigger_proposals(
        &self,
        now: OffsetDateTime,
        fired: &[&TriggerRule],
        report: &mut HeartbeatReport,
    ) -> Result<(), PipelineError> {
        if fired.is_empty() {
            return Ok(());
        }

        let limit = policy::daily_quota(self.store, self.config.daily_proposal_quota)?;
        report.quota_limit = limit;
        let mut created_today = self
            .store
            .select_proposals(&ProposalQuery {
                created_since: Some(start_of_utc_day(now)),
                ..ProposalQuery::default()
            })?
            .len();
        let limit_usize = usize::try_from(limit).unwrap_or(usize::MAX);

        for rule in fired {
            if created_today >= limit_usize {
                tracing::info!(trigger = %rule.name, limit, "daily proposal quota reached");
                report.quota_skipped += 1;
                continue;
            }
            let proposal = self.orchestrator.gate().propose(&trigger_proposal(rule))?;
            created_today += 1;
            report.proposals_created.push(proposal.proposal_id);
        }
        Ok(())
    }

    fn auto_approve(&self, report: &mut HeartbeatReport) -> Result<(), PipelineError> {
        let pending = self.store.select_proposals(&ProposalQuery {
            status: Some(ProposalStatus::Pending),
            order: SortOrder::OldestFirst,
            ..ProposalQuery::default()
        })?;

        for proposal in pending {
            if contains(&self.config.review_required_agents, &proposal.agent_id) {
                self.request_review(&proposal, report)?;
                continue;
            }
            if report.auto_approved.len() >= self.config.auto_approve_batch
                || !self.auto_approvable(&proposal)
            {
                continue;
            }

            match self.orchestrator.decide(
                proposal.proposal_id,
                Decision::Approved,
                DecisionSource::Automated,
            ) {
                Ok(outcome) => {
                    report.auto_approved.push(proposal.proposal_id);
                    report.steps_enqueued += outcome.enqueued.len();
                }
                Err(PipelineError::AlreadyResolved { .. }) => {
                    tracing::debug!(proposal_id = %proposal.proposal_id, "proposal decided elsewhere");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn auto_approvable(&self, proposal: &Proposal) -> bool {
        if !contains(&self.config.auto_approve_agents, &proposal.agent_id) {
            return false;
        }
        let steps = proposal.proposed_steps();
        !steps.is_empty()
            && steps
                .iter()
                .all(|step| contains(&self.config.auto_approve_step_kinds, &step.kind))
    }

    fn request_review(
        &self,
        proposal: &Proposal,
        report: &mut HeartbeatReport,
    ) -> Result<(), PipelineError> {
        let tag = proposal_tag(proposal.proposal_id);
        let already_requested = !self
            .orchestrator
            .events()
            .list(&EventQuery {
                kind: Some(APPROVAL_NEEDED_KIND.to_string()),
                tag: Some(tag.clone()),
                limit: Some(1),
                ..EventQuery::default()
            })?
            .is_empty();
        if already_requested {
            return Ok(());
        }

        self.orchestrator.events().record(
            &NewAgentEvent::new(
                &proposal.agent_id,
                APPROVAL_NEEDED_KIND,
                format!("Approval needed: {}", proposal.title),
                format!("Proposal from {} requires human review", proposal.agent_id),
            )
            .with_project(&proposal.project)
            .with_tags(["review".to_string(), tag]),
        )?;
        report.approval_requests.push(proposal.proposal_id);
        Ok(())
    }

    fn reclaim_stuck(
        &self,
        now: OffsetDateTime,
        report: &mut HeartbeatReport,
    ) -> Result<(), PipelineError> {
        let stuck = self.store.select_mission_steps(&StepQuery {
            status: Some(StepStatus::Processing),
            claimed_before: Some(minutes_before(now, self.config.stuck_after_minutes)),
            ..StepQuery::default()
        })?;

        for step in stuck {
            let reason = format!(
                "Recovered: timed out after {} min",
                self.config.stuck_after_minutes
            );
            match self.orchestrator.reclaim_step(step.step_id, reason) {
                Ok(completion) => {
                    tracing::warn!(
                        step_id = %step.step_id,
                        claimed_by = ?step.claimed_by,
                        "stuck mission step failed"
                    );
                    report.recovered.push(completion.step.step_id);
                }
                Err(PipelineError::InvalidTransition { .. }) => {
                    tracing::debug!(step_id = %step.step_id, "stuck step resolved elsewhere");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

fn trigger_proposal(rule: &TriggerRule) -> NewProposal {
    let mut payload = match &rule.payload {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    payload
        .entry("topic")
        .or_insert_with(|| json!(rule.title));
    payload.insert("agent_id".to_string(), json!(rule.agent_id));

    NewProposal {
        agent_id: rule.agent_id.clone(),
        project: rule.project.clone(),
        title: rule.title.clone(),
        body: json!({
            "trigger": rule.name,
            "proposed_steps": [{"kind": rule.step_kind, "payload": payload}],
        }),
    }
}

fn contains(values: &[String], needle: &str) -> bool {
    values.iter().any(|value| value == needle)
}

fn minutes_before(now: OffsetDateTime, minutes: u64) -> OffsetDateTime {
    i64::try_from(minutes)
        .ok()
        .and_then(|minutes| minutes.checked_mul(60))
        .and_then(|seconds| now.checked_sub(Duration::seconds(seconds)))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use crate::policy::DAILY_QUOTA_KEY;
    use mission_control_core::{now_utc, MemoryMissionStore, NewMissionStep, StepPatch};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn must<T>(result: Result<T, PipelineError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn rule(name: &str, title: &str, probability: f64) -> TriggerRule {
        TriggerRule {
            name: name.to_string(),
            agent_id: "dex".to_string(),
            project: "docstandard".to_string(),
            title: title.to_string(),
            step_kind: "research".to_string(),
            payload: json!({"research_type": "serp"}),
            watch_event_kind: "research_completed".to_string(),
            cooldown_minutes: 240,
            fire_probability: probability,
        }
    }

    fn config_with(triggers: Vec<TriggerRule>) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.heartbeat.triggers = triggers;
        config.heartbeat.auto_approve_agents = vec!["dex".to_string()];
        config.heartbeat.review_required_agents = vec!["nova".to_string()];
        config
    }

    fn run(heartbeat: &Heartbeat<'_>) -> HeartbeatReport {
        must(heartbeat.run_with_rng(now_utc(), &mut StdRng::seed_from_u64(7)))
    }

    #[test]
    fn trigger_fires_once_per_cooldown_and_is_auto_approved() {
        let store = MemoryMissionStore::new();
        let config = config_with(vec![rule("proactive", "Research: EDI trends", 1.0)]);
        let heartbeat = Heartbeat::new(&store, &config);

        let first = run(&heartbeat);
        assert_eq!(first.triggers_fired, vec!["proactive".to_string()]);
        assert_eq!(first.proposals_created.len(), 1);
        assert_eq!(first.auto_approved, first.proposals_created);
        assert_eq!(first.steps_enqueued, 1);

        let steps = must(store.select_mission_steps(&StepQuery::default()));
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, "research");
        assert_eq!(steps[0].payload["topic"], json!("Research: EDI trends"));
        assert_eq!(steps[0].payload["agent_id"], json!("dex"));

        let second = run(&heartbeat);
        assert!(second.triggers_fired.is_empty());
        assert_eq!(second.triggers_evaluated, 1);
    }

    #[test]
    fn recent_watched_event_suppresses_trigger() {
        let store = MemoryMissionStore::new();
        must(store.insert_agent_event(&NewAgentEvent::new(
            "dex",
            "research_completed",
            "Research: earlier",
            "",
        )));
        let config = config_with(vec![rule("proactive", "Research: EDI trends", 1.0)]);
        let report = run(&Heartbeat::new(&store, &config));
        assert!(report.triggers_fired.is_empty());
    }

    #[test]
    fn zero_probability_never_fires() {
        let store = MemoryMissionStore::new();
        let config = config_with(vec![rule("never", "Research: never", 0.0)]);
        let report = run(&Heartbeat::new(&store, &config));
        assert_eq!(report.triggers_evaluated, 1);
        assert!(report.triggers_fired.is_empty());
    }

    #[test]
    fn daily_quota_from_policy_caps_proposals() {
        let store = MemoryMissionStore::new();
        must(store.put_policy(DAILY_QUOTA_KEY, &json!({"limit": 1})));
        let config = config_with(vec![
            rule("first", "Research: A", 1.0),
            rule("second", "Research: B", 1.0),
        ]);
        let report = run(&Heartbeat::new(&store, &config));
        assert_eq!(report.triggers_fired.len(), 2);
        assert_eq!(report.proposals_created.len(), 1);
        assert_eq!(report.quota_limit, 1);
        assert_eq!(report.quota_skipped, 1);
    }

    #[test]
    fn review_required_agents_get_one_approval_request() {
        let store = MemoryMissionStore::new();
        let orchestrator = Orchestrator::new(&store, &PipelineConfig::default());
        let proposal = must(orchestrator.gate().propose(&NewProposal {
            agent_id: "nova".to_string(),
            project: "docstandard".to_string(),
            title: "QA Review: EDI".to_string(),
            body: json!({"kind": "research"}),
        }));

        let config = config_with(Vec::new());
        let heartbeat = Heartbeat::new(&store, &config);
        let first = run(&heartbeat);
        let second = run(&heartbeat);
        assert_eq!(first.approval_requests, vec![proposal.proposal_id]);
        assert!(second.approval_requests.is_empty());
        assert!(first.auto_approved.is_empty());

        let still_pending = must(orchestrator.gate().get(proposal.proposal_id));
        assert_eq!(still_pending.status, ProposalStatus::Pending);
        let requests = must(store.select_agent_events(&EventQuery {
            kind: Some(APPROVAL_NEEDED_KIND.to_string()),
            ..EventQuery::default()
        }));
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn proposals_with_unlisted_step_kinds_stay_pending() {
        let store = MemoryMissionStore::new();
        let orchestrator = Orchestrator::new(&store, &PipelineConfig::default());
        let proposal = must(orchestrator.gate().propose(&NewProposal {
            agent_id: "dex".to_string(),
            project: "docstandard".to_string(),
            title: "Publish pages".to_string(),
            body: json!({"proposed_steps": [
                {"kind": "research", "payload": {}},
                {"kind": "publish", "payload": {}}
            ]}),
        }));

        let config = config_with(Vec::new());
        let report = run(&Heartbeat::new(&store, &config));
        assert!(report.auto_approved.is_empty());
        assert_eq!(
            must(orchestrator.gate().get(proposal.proposal_id)).status,
            ProposalStatus::Pending
        );
    }

    #[test]
    fn stuck_processing_steps_are_failed_not_requeued() {
        let store = MemoryMissionStore::new();
        let orchestrator = Orchestrator::new(&store, &PipelineConfig::default());
        let stale = must(orchestrator.queue().enqueue(&NewMissionStep::new(
            "research",
            "docstandard",
            json!({"topic": "stale"}),
        )));
        let fresh = must(orchestrator.queue().enqueue(&NewMissionStep::new(
            "research",
            "docstandard",
            json!({"topic": "fresh"}),
        )));
        let long_ago = now_utc() - Duration::minutes(45);
        must(store.update_mission_step(
            stale.step_id,
            StepStatus::Queued,
            &StepPatch::Claim {
                worker_id: "crashed".to_string(),
                claimed_at: long_ago,
            },
        ));
        must(orchestrator.queue().claim_next("alive", None, &[]));

        let config = config_with(Vec::new());
        let report = run(&Heartbeat::new(&store, &config));
        assert_eq!(report.recovered, vec![stale.step_id]);

        let failed = must(orchestrator.queue().get(stale.step_id));
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(
            failed.error.as_deref(),
            Some("Recovered: timed out after 30 min")
        );
        assert_eq!(
            must(orchestrator.queue().get(fresh.step_id)).status,
            StepStatus::Processing
        );

        let recovered_event = must_some(must(orchestrator.events().latest(None, "research_failed")));
        assert!(recovered_event.tags.contains("recovered"));
    }

    #[test]
    fn heartbeat_event_summarizes_counts() {
        let store = MemoryMissionStore::new();
        let config = config_with(Vec::new());
        let report = run(&Heartbeat::new(&store, &config));

        let event = must_some(must(
            Orchestrator::new(&store, &config)
                .events()
                .latest(Some(HEARTBEAT_AGENT), "heartbeat"),
        ));
        assert_eq!(event.event_seq, report.heartbeat_event_seq);
        assert_eq!(
            event.summary,
            "Triggers: 0, Proposals: 0, Approved: 0, Recovered: 0"
        );
    }

    #[test]
    fn minutes_before_saturates() {
        let now = now_utc();
        assert_eq!(minutes_before(now, u64::MAX), OffsetDateTime::UNIX_EPOCH);
        assert_eq!(minutes_before(now, 30), now - Duration::minutes(30));
    }
}
