use mission_control_core::{AgentEvent, EventQuery, MissionStore, NewAgentEvent, PipelineError};

/// Append-only recorder of agent activity.
#[derive(Clone, Copy)]
pub struct EventLog<'a> {
    store: &'a dyn MissionStore,
}

impl<'a> EventLog<'a> {
    #[must_use]
    pub fn new(store: &'a dyn MissionStore) -> Self {
        Self { store }
    }

    /// Appends one event.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] for malformed events and store
    /// errors (transient or fatal) unchanged.
    pub fn record(&self, event: &NewAgentEvent) -> Result<AgentEvent, PipelineError> {
        let stored = self.store.insert_agent_event(event)?;
        tracing::debug!(
            event_seq = stored.event_seq,
            agent_id = %stored.agent_id,
            kind = %stored.kind,
            "agent event recorded"
        );
        Ok(stored)
    }

    /// Events matching `query`, newest first.
    ///
    /// # Errors
    /// Propagates store errors.
    pub fn list(&self, query: &EventQuery) -> Result<Vec<AgentEvent>, PipelineError> {
        self.store.select_agent_events(query)
    }

    /// Most recent event of `kind`, optionally restricted to one agent.
    ///
    /// # Errors
    /// Propagates store errors.
    pub fn latest(
        &self,
        agent_id: Option<&str>,
        kind: &str,
    ) -> Result<Option<AgentEvent>, PipelineError> {
        let events = self.store.select_agent_events(&EventQuery {
            agent_id: agent_id.map(ToString::to_string),
            kind: Some(kind.to_string()),
            limit: Some(1),
            ..EventQuery::default()
        })?;
        Ok(events.into_iter().next())
    }
}
