use mission_control_core::{
    now_utc, MissionStep, MissionStore, NewMissionStep, PipelineError, QueueConfig, Resolution,
    StepId, StepPatch, StepQuery, StepStatus,
};

/// Mission step lifecycle: enqueue, claim, resolve.
///
/// Claims and resolutions are single guarded updates; a claim wins only when
/// the store reports exactly one affected row.
#[derive(Clone, Copy)]
pub struct MissionQueue<'a> {
    store: &'a dyn MissionStore,
    claim_batch_size: usize,
}

impl<'a> MissionQueue<'a> {
    #[must_use]
    pub fn new(store: &'a dyn MissionStore, config: &QueueConfig) -> Self {
        Self {
            store,
            claim_batch_size: config.claim_batch_size.max(1),
        }
    }

    /// Inserts a step in `queued`.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] for blank kind/project or a
    /// non-object payload, and store errors unchanged.
    pub fn enqueue(&self, step: &NewMissionStep) -> Result<MissionStep, PipelineError> {
        let stored = self.store.insert_mission_step(step)?;
        tracing::info!(
            step_id = %stored.step_id,
            kind = %stored.kind,
            project = %stored.project,
            "mission step enqueued"
        );
        Ok(stored)
    }

    /// Claims the oldest claimable step for `worker_id`.
    ///
    /// Candidates are read in FIFO order a batch at a time. Every lost
    /// candidate has already left `queued`, so each re-read makes progress and
    /// `None` means the queue had nothing claimable.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] for a blank worker id and store
    /// errors unchanged.
    pub fn claim_next(
        &self,
        worker_id: &str,
        project: Option<&str>,
        kinds: &[String],
    ) -> Result<Option<MissionStep>, PipelineError> {
        let worker_id = worker_id.trim();
        if worker_id.is_empty() {
            return Err(PipelineError::Validation(
                "worker_id MUST be provided".to_string(),
            ));
        }

        let query = StepQuery::queued(project, kinds, self.claim_batch_size);
        loop {
            let candidates = self.store.select_mission_steps(&query)?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in candidates {
                let claimed_at = now_utc();
                let patch = StepPatch::Claim {
                    worker_id: worker_id.to_string(),
                    claimed_at,
                };
                if self
                    .store
                    .update_mission_step(candidate.step_id, StepStatus::Queued, &patch)?
                    == 1
                {
                    tracing::info!(
                        step_id = %candidate.step_id,
                        worker_id,
                        kind = %candidate.kind,
                        "mission step claimed"
                    );
                    return Ok(Some(MissionStep {
                        status: StepStatus::Processing,
                        claimed_by: Some(worker_id.to_string()),
                        claimed_at: Some(claimed_at),
                        updated_at: claimed_at,
                        ..candidate
                    }));
                }
                tracing::debug!(step_id = %candidate.step_id, worker_id, "claim lost");
            }
        }
    }

    /// Moves a `processing` step to its terminal status.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] for an unknown id and
    /// [`PipelineError::InvalidTransition`] when the step is not
    /// `processing` at write time.
    pub fn resolve(
        &self,
        step_id: StepId,
        resolution: Resolution,
    ) -> Result<MissionStep, PipelineError> {
        let target = resolution.target_status();
        let patch = StepPatch::Resolve {
            resolution,
            resolved_at: now_utc(),
        };

        if self
            .store
            .update_mission_step(step_id, StepStatus::Processing, &patch)?
            == 0
        {
            let current = self.get(step_id)?;
            return Err(PipelineError::InvalidTransition {
                id: step_id.to_string(),
                from: current.status.to_string(),
                to: target.to_string(),
            });
        }

        let resolved = self.get(step_id)?;
        tracing::info!(step_id = %step_id, status = %resolved.status, "mission step resolved");
        Ok(resolved)
    }

    /// # Errors
    /// Returns [`PipelineError::NotFound`] for an unknown id.
    pub fn get(&self, step_id: StepId) -> Result<MissionStep, PipelineError> {
        self.store
            .select_mission_step(step_id)?
            .ok_or_else(|| PipelineError::NotFound {
                entity: "mission_step",
                id: step_id.to_string(),
            })
    }

    /// # Errors
    /// Propagates store errors.
    pub fn list(&self, query: &StepQuery) -> Result<Vec<MissionStep>, PipelineError> {
        self.store.select_mission_steps(query)
    }
}
