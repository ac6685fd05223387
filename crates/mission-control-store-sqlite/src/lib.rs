#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use mission_control_core::{
    format_rfc3339, now_utc, AgentEvent, BatchOutcome, DecisionSource, EventId, EventQuery,
    GuardedUpdate, MissionStep, MissionStore, NewAgentEvent, NewMissionStep, NewProposal,
    PipelineError, Proposal, ProposalId, ProposalPatch, ProposalQuery, ProposalStatus,
    Resolution, SortOrder, StepId, StepPatch, StepQuery, StepStatus, WriteBatch,
};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction,
    TransactionBehavior,
};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

pub const MISSION_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS proposals (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  proposal_id TEXT NOT NULL UNIQUE,
  agent_id TEXT NOT NULL,
  project TEXT NOT NULL,
  title TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','approved','rejected')),
  body_json TEXT NOT NULL,
  decision_source TEXT CHECK (decision_source IS NULL OR decision_source IN ('human','automated')),
  decided_at TEXT,
  created_at TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mission_steps (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  step_id TEXT NOT NULL UNIQUE,
  kind TEXT NOT NULL,
  project TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('queued','processing','succeeded','failed')),
  payload_json TEXT NOT NULL,
  result_json TEXT,
  error TEXT,
  claimed_by TEXT,
  claimed_at TEXT,
  claimed_at_ms INTEGER,
  proposal_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK ((status = 'succeeded') = (result_json IS NOT NULL)),
  FOREIGN KEY (proposal_id) REFERENCES proposals(proposal_id)
);

CREATE TABLE IF NOT EXISTS agent_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  agent_id TEXT NOT NULL,
  project TEXT,
  kind TEXT NOT NULL,
  title TEXT NOT NULL,
  summary TEXT NOT NULL,
  tags_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ops_policy (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mission_steps_status ON mission_steps(status, project, kind, seq);
CREATE INDEX IF NOT EXISTS idx_mission_steps_claimed ON mission_steps(status, claimed_at_ms);
CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status, seq);
CREATE INDEX IF NOT EXISTS idx_agent_events_kind ON agent_events(kind, event_seq);
CREATE INDEX IF NOT EXISTS idx_agent_events_agent ON agent_events(agent_id, event_seq);

CREATE TRIGGER IF NOT EXISTS trg_mission_steps_forward_only
BEFORE UPDATE OF status ON mission_steps
WHEN NOT (
  (OLD.status = 'queued' AND NEW.status = 'processing')
  OR (OLD.status = 'processing' AND NEW.status IN ('succeeded','failed'))
)
BEGIN
  SELECT RAISE(FAIL, 'mission_steps status may only move forward');
END;
CREATE TRIGGER IF NOT EXISTS trg_mission_steps_no_delete
BEFORE DELETE ON mission_steps
BEGIN
  SELECT RAISE(FAIL, 'mission_steps rows are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_proposals_decide_once
BEFORE UPDATE OF status ON proposals
WHEN OLD.status <> 'pending' OR NEW.status = 'pending'
BEGIN
  SELECT RAISE(FAIL, 'proposal decisions are final');
END;

CREATE TRIGGER IF NOT EXISTS trg_agent_events_no_update
BEFORE UPDATE ON agent_events
BEGIN
  SELECT RAISE(FAIL, 'agent_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_agent_events_no_delete
BEFORE DELETE ON agent_events
BEGIN
  SELECT RAISE(FAIL, 'agent_events is append-only');
END;
";

const STEP_COLUMNS: &str = "step_id, kind, project, status, payload_json, result_json, error, \
     claimed_by, claimed_at, proposal_id, created_at, updated_at";

const PROPOSAL_COLUMNS: &str = "proposal_id, agent_id, project, title, status, body_json, \
     decision_source, decided_at, created_at, updated_at";

const EVENT_COLUMNS: &str =
    "event_seq, event_id, agent_id, project, kind, title, summary, tags_json, created_at";

/// `SQLite`-backed [`MissionStore`]. One instance wraps one connection; open
/// one store per thread or request and let the database serialize writers.
pub struct SqliteMissionStore {
    conn: Connection,
}

impl SqliteMissionStore {
    /// Open or create a mission database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
    }

    /// Same as [`SqliteMissionStore::open`] with an explicit lock wait.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(busy_timeout)
            .context("failed to configure sqlite busy timeout")?;

        Ok(Self { conn })
    }

    /// Apply the mission schema. Safe to run repeatedly.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied or recorded.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply mission schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![MISSION_SCHEMA_VERSION, now],
            )
            .context("failed to record mission migration")?;

        tracing::debug!(version = MISSION_SCHEMA_VERSION, "mission schema migrated");
        Ok(())
    }

    /// Highest applied schema version, `None` on an unmigrated database.
    ///
    /// # Errors
    /// Returns an error if the migrations table cannot be read.
    pub fn schema_version(&self) -> Result<Option<i64>> {
        let has_table: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to inspect sqlite_master")?;
        if has_table.is_none() {
            return Ok(None);
        }

        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .context("failed to read schema version")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl MissionStore for SqliteMissionStore {
    fn insert_mission_step(&self, step: &NewMissionStep) -> Result<MissionStep, PipelineError> {
        step.validate()?;
        insert_step_row(&self.conn, step)
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
        apply_guard(&self.conn, &guard)
    }

    fn select_mission_step(&self, step_id: StepId) -> Result<Option<MissionStep>, PipelineError> {
        self.conn
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM mission_steps WHERE step_id = ?1"),
                params![step_id.to_string()],
                parse_step_row,
            )
            .optional()
            .store_context("failed to read mission step")
    }

    fn select_mission_steps(&self, query: &StepQuery) -> Result<Vec<MissionStep>, PipelineError> {
        let mut filter = Filter::default();
        if let Some(project) = &query.project {
            filter.eq("project", project.clone());
        }
        if !query.kinds.is_empty() {
            filter.any_of("kind", &query.kinds);
        }
        if let Some(status) = query.status {
            filter.eq("status", status.as_str().to_string());
        }
        if let Some(cutoff) = query.claimed_before {
            filter.push("claimed_at_ms < ?", SqlValue::Integer(unix_ms(cutoff)));
        }

        let where_sql = filter.where_sql();
        let limit_sql = filter.limit_sql(query.limit);
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM mission_steps{} ORDER BY seq {}{}",
            where_sql,
            order_sql(query.order),
            limit_sql,
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .store_context("failed to prepare mission step query")?;
        let rows = stmt
            .query_map(params_from_iter(filter.args.iter()), parse_step_row)
            .store_context("failed to query mission steps")?;
        collect_rows(rows)
    }

    fn insert_proposal(&self, proposal: &NewProposal) -> Result<Proposal, PipelineError> {
        proposal.validate()?;
        insert_proposal_row(&self.conn, proposal)
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
        apply_guard(&self.conn, &guard)
    }

    fn select_proposal(&self, proposal_id: ProposalId) -> Result<Option<Proposal>, PipelineError> {
        self.conn
            .query_row(
                &format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE proposal_id = ?1"),
                params![proposal_id.to_string()],
                parse_proposal_row,
            )
            .optional()
            .store_context("failed to read proposal")
    }

    fn select_proposals(&self, query: &ProposalQuery) -> Result<Vec<Proposal>, PipelineError> {
        let mut filter = Filter::default();
        if let Some(status) = query.status {
            filter.eq("status", status.as_str().to_string());
        }
        if let Some(agent_id) = &query.agent_id {
            filter.eq("agent_id", agent_id.clone());
        }
        if let Some(project) = &query.project {
            filter.eq("project", project.clone());
        }
        if let Some(since) = query.created_since {
            filter.push("created_at_ms >= ?", SqlValue::Integer(unix_ms(since)));
        }

        let where_sql = filter.where_sql();
        let limit_sql = filter.limit_sql(query.limit);
        let sql = format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals{} ORDER BY seq {}{}",
            where_sql,
            order_sql(query.order),
            limit_sql,
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .store_context("failed to prepare proposal query")?;
        let rows = stmt
            .query_map(params_from_iter(filter.args.iter()), parse_proposal_row)
            .store_context("failed to query proposals")?;
        collect_rows(rows)
    }

    fn insert_agent_event(&self, event: &NewAgentEvent) -> Result<AgentEvent, PipelineError> {
        event.validate()?;
        insert_event_row(&self.conn, event)
    }

    fn select_agent_events(&self, query: &EventQuery) -> Result<Vec<AgentEvent>, PipelineError> {
        let mut filter = Filter::default();
        if let Some(agent_id) = &query.agent_id {
            filter.eq("agent_id", agent_id.clone());
        }
        if let Some(kind) = &query.kind {
            filter.eq("kind", kind.clone());
        }
        if let Some(tag) = &query.tag {
            filter.push(
                "EXISTS (SELECT 1 FROM json_each(agent_events.tags_json) WHERE json_each.value = ?)",
                SqlValue::Text(tag.clone()),
            );
        }
        if let Some(since) = query.since {
            filter.push("created_at_ms >= ?", SqlValue::Integer(unix_ms(since)));
        }

        let where_sql = filter.where_sql();
        let limit_sql = filter.limit_sql(query.limit);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM agent_events{} ORDER BY event_seq DESC{}",
            where_sql,
            limit_sql,
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .store_context("failed to prepare agent event query")?;
        let rows = stmt
            .query_map(params_from_iter(filter.args.iter()), parse_event_row)
            .store_context("failed to query agent events")?;
        collect_rows(rows)
    }

    fn get_policy(&self, key: &str) -> Result<Option<Value>, PipelineError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value_json FROM ops_policy WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .store_context("failed to read ops policy")?;

        raw.map(|value| {
            serde_json::from_str(&value).map_err(|err| {
                PipelineError::Store(format!("invalid ops_policy value for {key}: {err}"))
            })
        })
        .transpose()
    }

    fn put_policy(&self, key: &str, value: &Value) -> Result<(), PipelineError> {
        if key.trim().is_empty() {
            return Err(PipelineError::Validation(
                "policy key MUST be provided".to_string(),
            ));
        }
        self.conn
            .execute(
                "INSERT INTO ops_policy(key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
                params![key.trim(), to_json(value)?, format_rfc3339(now_utc())?],
            )
            .store_context("failed to write ops policy")?;
        Ok(())
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<Option<BatchOutcome>, PipelineError> {
        batch.validate()?;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .store_context("failed to begin write batch")?;

        if apply_guard(&tx, &batch.guard)? == 0 {
            return Ok(None);
        }

        let mut outcome = BatchOutcome::default();
        for event in &batch.events {
            outcome.events.push(insert_event_row(&tx, event)?);
        }
        for step in &batch.steps {
            outcome.steps.push(insert_step_row(&tx, step)?);
        }
        for proposal in &batch.proposals {
            outcome.proposals.push(insert_proposal_row(&tx, proposal)?);
        }

        tx.commit().store_context("failed to commit write batch")?;
        Ok(Some(outcome))
    }
}

fn insert_step_row(conn: &Connection, step: &NewMissionStep) -> Result<MissionStep, PipelineError> {
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

    conn.execute(
        "INSERT INTO mission_steps(
            step_id, kind, project, status, payload_json, proposal_id, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            record.step_id.to_string(),
            record.kind,
            record.project,
            record.status.as_str(),
            to_json(&record.payload)?,
            record.proposal_id.map(|id| id.to_string()),
            format_rfc3339(now)?,
        ],
    )
    .store_context("failed to insert mission step")?;

    Ok(record)
}

fn insert_proposal_row(conn: &Connection, proposal: &NewProposal) -> Result<Proposal, PipelineError> {
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

    conn.execute(
        "INSERT INTO proposals(
            proposal_id, agent_id, project, title, status, body_json,
            created_at, created_at_ms, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?7)",
        params![
            record.proposal_id.to_string(),
            record.agent_id,
            record.project,
            record.title,
            record.status.as_str(),
            to_json(&record.body)?,
            format_rfc3339(now)?,
            unix_ms(now),
        ],
    )
    .store_context("failed to insert proposal")?;

    Ok(record)
}

fn insert_event_row(conn: &Connection, event: &NewAgentEvent) -> Result<AgentEvent, PipelineError> {
    let now = now_utc();
    let event_id = EventId::new();
    let tags_json = serde_json::to_string(&event.tags)
        .map_err(|err| PipelineError::Store(format!("failed to encode event tags: {err}")))?;

    conn.execute(
        "INSERT INTO agent_events(
            event_id, agent_id, project, kind, title, summary, tags_json,
            created_at, created_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event_id.to_string(),
            event.agent_id.trim(),
            event.project,
            event.kind.trim(),
            event.title,
            event.summary,
            tags_json,
            format_rfc3339(now)?,
            unix_ms(now),
        ],
    )
    .store_context("failed to append agent event")?;

    Ok(AgentEvent {
        event_seq: conn.last_insert_rowid(),
        event_id,
        agent_id: event.agent_id.trim().to_string(),
        project: event.project.clone(),
        kind: event.kind.trim().to_string(),
        title: event.title.clone(),
        summary: event.summary.clone(),
        tags: event.tags.clone(),
        created_at: now,
    })
}

/// Single `UPDATE .. WHERE id = ? AND status = ?`; the affected-row count is
/// the outcome of the race.
fn apply_guard(conn: &Connection, guard: &GuardedUpdate) -> Result<usize, PipelineError> {
    match guard {
        GuardedUpdate::Step {
            step_id,
            expected,
            patch: StepPatch::Claim {
                worker_id,
                claimed_at,
            },
        } => conn
            .execute(
                "UPDATE mission_steps
                 SET status = ?3, claimed_by = ?4, claimed_at = ?5, claimed_at_ms = ?6, updated_at = ?5
                 WHERE step_id = ?1 AND status = ?2",
                params![
                    step_id.to_string(),
                    expected.as_str(),
                    StepStatus::Processing.as_str(),
                    worker_id,
                    format_rfc3339(*claimed_at)?,
                    unix_ms(*claimed_at),
                ],
            )
            .store_context("failed to claim mission step"),
        GuardedUpdate::Step {
            step_id,
            expected,
            patch: StepPatch::Resolve {
                resolution,
                resolved_at,
            },
        } => {
            let (result_json, error) = match resolution {
                Resolution::Succeeded { result } => (Some(to_json(result)?), None),
                Resolution::Failed { reason } => (None, reason.clone()),
            };
            conn.execute(
                "UPDATE mission_steps
                 SET status = ?3, result_json = ?4, error = ?5, updated_at = ?6
                 WHERE step_id = ?1 AND status = ?2",
                params![
                    step_id.to_string(),
                    expected.as_str(),
                    resolution.target_status().as_str(),
                    result_json,
                    error,
                    format_rfc3339(*resolved_at)?,
                ],
            )
            .store_context("failed to resolve mission step")
        }
        GuardedUpdate::Proposal {
            proposal_id,
            expected,
            patch,
        } => {
            let decided_at = format_rfc3339(patch.decided_at)?;
            conn.execute(
                "UPDATE proposals
                 SET status = ?3, decision_source = ?4, decided_at = ?5, updated_at = ?5
                 WHERE proposal_id = ?1 AND status = ?2",
                params![
                    proposal_id.to_string(),
                    expected.as_str(),
                    patch.decision.status().as_str(),
                    patch.source.as_str(),
                    decided_at,
                ],
            )
            .store_context("failed to decide proposal")
        }
    }
}

/// Maps a driver error onto the pipeline taxonomy. Lock contention that
/// outlived the busy timeout is transient, everything else is fatal.
#[must_use]
pub fn classify_sqlite_error(context: &str, err: &rusqlite::Error) -> PipelineError {
    let transient = matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    );
    if transient {
        PipelineError::TransientStore(format!("{context}: {err}"))
    } else {
        PipelineError::Store(format!("{context}: {err}"))
    }
}

trait StoreContext<T> {
    fn store_context(self, context: &str) -> Result<T, PipelineError>;
}

impl<T> StoreContext<T> for rusqlite::Result<T> {
    fn store_context(self, context: &str) -> Result<T, PipelineError> {
        self.map_err(|err| classify_sqlite_error(context, &err))
    }
}

#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    args: Vec<SqlValue>,
}

impl Filter {
    fn push(&mut self, clause: &str, value: SqlValue) {
        self.clauses.push(clause.to_string());
        self.args.push(value);
    }

    fn eq(&mut self, column: &str, value: String) {
        self.push(&format!("{column} = ?"), SqlValue::Text(value));
    }

    fn any_of(&mut self, column: &str, values: &[String]) {
        let placeholders = vec!["?"; values.len()].join(", ");
        self.clauses.push(format!("{column} IN ({placeholders})"));
        self.args
            .extend(values.iter().cloned().map(SqlValue::Text));
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn limit_sql(&mut self, limit: Option<usize>) -> &'static str {
        match limit {
            Some(limit) => {
                self.args
                    .push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
                " LIMIT ?"
            }
            None => "",
        }
    }
}

fn order_sql(order: SortOrder) -> &'static str {
    match order {
        SortOrder::OldestFirst => "ASC",
        SortOrder::NewestFirst => "DESC",
    }
}

fn parse_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MissionStep> {
    let step_id_raw: String = row.get(0)?;
    let status_raw: String = row.get(3)?;
    let payload_raw: String = row.get(4)?;
    let result_raw: Option<String> = row.get(5)?;
    let claimed_at_raw: Option<String> = row.get(8)?;
    let proposal_id_raw: Option<String> = row.get(9)?;
    let created_at_raw: String = row.get(10)?;
    let updated_at_raw: String = row.get(11)?;

    Ok(MissionStep {
        step_id: StepId(parse_ulid(0, &step_id_raw)?),
        kind: row.get(1)?,
        project: row.get(2)?,
        status: StepStatus::parse(&status_raw).ok_or_else(|| {
            invalid_column(3, Type::Text, format!("invalid step status: {status_raw}"))
        })?,
        payload: parse_json(4, &payload_raw)?,
        result: result_raw.map(|raw| parse_json(5, &raw)).transpose()?,
        error: row.get(6)?,
        claimed_by: row.get(7)?,
        claimed_at: claimed_at_raw
            .map(|raw| parse_timestamp(8, &raw))
            .transpose()?,
        proposal_id: proposal_id_raw
            .map(|raw| parse_ulid(9, &raw).map(ProposalId))
            .transpose()?,
        created_at: parse_timestamp(10, &created_at_raw)?,
        updated_at: parse_timestamp(11, &updated_at_raw)?,
    })
}

fn parse_proposal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Proposal> {
    let proposal_id_raw: String = row.get(0)?;
    let status_raw: String = row.get(4)?;
    let body_raw: String = row.get(5)?;
    let source_raw: Option<String> = row.get(6)?;
    let decided_at_raw: Option<String> = row.get(7)?;
    let created_at_raw: String = row.get(8)?;
    let updated_at_raw: String = row.get(9)?;

    Ok(Proposal {
        proposal_id: ProposalId(parse_ulid(0, &proposal_id_raw)?),
        agent_id: row.get(1)?,
        project: row.get(2)?,
        title: row.get(3)?,
        status: ProposalStatus::parse(&status_raw).ok_or_else(|| {
            invalid_column(
                4,
                Type::Text,
                format!("invalid proposal status: {status_raw}"),
            )
        })?,
        body: parse_json(5, &body_raw)?,
        decision_source: source_raw
            .map(|raw| {
                DecisionSource::parse(&raw).ok_or_else(|| {
                    invalid_column(6, Type::Text, format!("invalid decision source: {raw}"))
                })
            })
            .transpose()?,
        decided_at: decided_at_raw
            .map(|raw| parse_timestamp(7, &raw))
            .transpose()?,
        created_at: parse_timestamp(8, &created_at_raw)?,
        updated_at: parse_timestamp(9, &updated_at_raw)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentEvent> {
    let event_id_raw: String = row.get(1)?;
    let tags_raw: String = row.get(7)?;
    let created_at_raw: String = row.get(8)?;

    let tags = serde_json::from_str(&tags_raw).map_err(|err| {
        invalid_column(7, Type::Text, format!("invalid tags_json: {err}"))
    })?;

    Ok(AgentEvent {
        event_seq: row.get(0)?,
        event_id: EventId(parse_ulid(1, &event_id_raw)?),
        agent_id: row.get(2)?,
        project: row.get(3)?,
        kind: row.get(4)?,
        title: row.get(5)?,
        summary: row.get(6)?,
        tags,
        created_at: parse_timestamp(8, &created_at_raw)?,
    })
}

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_ulid(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw)
        .map_err(|err| invalid_column(index, Type::Text, format!("invalid ULID {raw}: {err}")))
}

fn parse_json(index: usize, raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw)
        .map_err(|err| invalid_column(index, Type::Text, format!("invalid JSON column: {err}")))
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    mission_control_core::parse_rfc3339_utc(raw)
        .map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn to_json(value: &Value) -> Result<String, PipelineError> {
    serde_json::to_string(value)
        .map_err(|err| PipelineError::Store(format!("failed to encode JSON column: {err}")))
}

fn unix_ms(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, PipelineError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.store_context("failed to decode row")?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use mission_control_core::Decision;
    use proptest::prelude::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
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

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "mission-control-sqlite-test-{}-{}.sqlite3",
            name,
            Ulid::new()
        ))
    }

    fn fixture_store() -> SqliteMissionStore {
        let store = must(SqliteMissionStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn claim(worker_id: &str) -> StepPatch {
        StepPatch::Claim {
            worker_id: worker_id.to_string(),
            claimed_at: now_utc(),
        }
    }

    fn succeed(result: Value) -> StepPatch {
        StepPatch::Resolve {
            resolution: Resolution::Succeeded { result },
            resolved_at: now_utc(),
        }
    }

    fn enqueue(store: &SqliteMissionStore, kind: &str, project: &str) -> MissionStep {
        must(store.insert_mission_step(&NewMissionStep::new(
            kind,
            project,
            json!({"topic": kind}),
        )))
    }

    #[test]
    fn migrate_is_idempotent_and_records_version() {
        let store = fixture_store();
        must(store.migrate());
        assert_eq!(must(store.schema_version()), Some(MISSION_SCHEMA_VERSION));

        let unmigrated = must(SqliteMissionStore::open(Path::new(":memory:")));
        assert_eq!(must(unmigrated.schema_version()), None);
    }

    #[test]
    fn step_round_trip_preserves_fields() {
        let store = fixture_store();
        let inserted = enqueue(&store, "research", "docs");
        let loaded = must_some(must(store.select_mission_step(inserted.step_id)));
        assert_eq!(loaded, inserted);
        assert!(must(store.select_mission_step(StepId::new())).is_none());
    }

    #[test]
    fn guarded_claim_applies_once_and_resolve_sets_result() {
        let store = fixture_store();
        let step = enqueue(&store, "research", "docs");

        assert_eq!(
            must(store.update_mission_step(step.step_id, StepStatus::Queued, &claim("w1"))),
            1
        );
        assert_eq!(
            must(store.update_mission_step(step.step_id, StepStatus::Queued, &claim("w2"))),
            0
        );

        assert_eq!(
            must(store.update_mission_step(
                step.step_id,
                StepStatus::Processing,
                &succeed(json!({"ok": true})),
            )),
            1
        );
        let loaded = must_some(must(store.select_mission_step(step.step_id)));
        assert_eq!(loaded.status, StepStatus::Succeeded);
        assert_eq!(loaded.claimed_by.as_deref(), Some("w1"));
        assert_eq!(loaded.result, Some(json!({"ok": true})));
        assert!(loaded.claimed_at.is_some());
    }

    #[test]
    fn triggers_forbid_status_regression_and_deletes() {
        let store = fixture_store();
        let step = enqueue(&store, "research", "docs");
        must(store.update_mission_step(step.step_id, StepStatus::Queued, &claim("w1")));
        must(store.update_mission_step(
            step.step_id,
            StepStatus::Processing,
            &succeed(json!({})),
        ));

        let regressed = store.connection().execute(
            "UPDATE mission_steps SET status = 'queued', result_json = NULL WHERE step_id = ?1",
            params![step.step_id.to_string()],
        );
        assert!(regressed.is_err());

        let deleted = store.connection().execute(
            "DELETE FROM mission_steps WHERE step_id = ?1",
            params![step.step_id.to_string()],
        );
        assert!(deleted.is_err());
    }

    #[test]
    fn succeeded_rows_require_result() {
        let store = fixture_store();
        let step = enqueue(&store, "research", "docs");
        must(store.update_mission_step(step.step_id, StepStatus::Queued, &claim("w1")));

        let missing_result = store.connection().execute(
            "UPDATE mission_steps SET status = 'succeeded' WHERE step_id = ?1",
            params![step.step_id.to_string()],
        );
        assert!(missing_result.is_err());
    }

    #[test]
    fn illegal_patch_is_rejected_before_sql() {
        let store = fixture_store();
        let step = enqueue(&store, "research", "docs");
        let result =
            store.update_mission_step(step.step_id, StepStatus::Succeeded, &claim("w1"));
        assert!(matches!(
            result,
            Err(PipelineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn queued_selection_is_fifo_and_filtered() {
        let store = fixture_store();
        let first = enqueue(&store, "research", "docs");
        let _other_project = enqueue(&store, "research", "web");
        let second = enqueue(&store, "analyze", "docs");
        let _other_kind = enqueue(&store, "publish", "docs");

        let selected = must(store.select_mission_steps(&StepQuery::queued(
            Some("docs"),
            &["research".to_string(), "analyze".to_string()],
            10,
        )));
        let ids: Vec<StepId> = selected.iter().map(|step| step.step_id).collect();
        assert_eq!(ids, vec![first.step_id, second.step_id]);

        let newest = must(store.select_mission_steps(&StepQuery {
            order: SortOrder::NewestFirst,
            limit: Some(1),
            ..StepQuery::default()
        }));
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].kind, "publish");
    }

    #[test]
    fn claimed_before_filters_on_claim_time() {
        let store = fixture_store();
        let old = enqueue(&store, "research", "docs");
        let fresh = enqueue(&store, "research", "docs");
        let long_ago = now_utc() - time::Duration::hours(2);
        must(store.update_mission_step(
            old.step_id,
            StepStatus::Queued,
            &StepPatch::Claim {
                worker_id: "w1".to_string(),
                claimed_at: long_ago,
            },
        ));
        must(store.update_mission_step(fresh.step_id, StepStatus::Queued, &claim("w2")));

        let stuck = must(store.select_mission_steps(&StepQuery {
            status: Some(StepStatus::Processing),
            claimed_before: Some(now_utc() - time::Duration::minutes(30)),
            ..StepQuery::default()
        }));
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].step_id, old.step_id);
    }

    #[test]
    fn proposal_decision_is_final() {
        let store = fixture_store();
        let proposal = must(store.insert_proposal(&NewProposal {
            agent_id: "dex".to_string(),
            project: "docs".to_string(),
            title: "Research X".to_string(),
            body: json!({"kind": "research"}),
        }));
        let patch = ProposalPatch {
            decision: Decision::Approved,
            source: DecisionSource::Human,
            decided_at: now_utc(),
        };

        assert_eq!(
            must(store.update_proposal(proposal.proposal_id, ProposalStatus::Pending, &patch)),
            1
        );
        assert_eq!(
            must(store.update_proposal(proposal.proposal_id, ProposalStatus::Pending, &patch)),
            0
        );

        let loaded = must_some(must(store.select_proposal(proposal.proposal_id)));
        assert_eq!(loaded.status, ProposalStatus::Approved);
        assert_eq!(loaded.decision_source, Some(DecisionSource::Human));
        assert!(loaded.decided_at.is_some());

        let reopened = store.connection().execute(
            "UPDATE proposals SET status = 'rejected' WHERE proposal_id = ?1",
            params![proposal.proposal_id.to_string()],
        );
        assert!(reopened.is_err());
    }

    #[test]
    fn decision_batch_rolls_back_when_an_insert_fails() {
        let store = fixture_store();
        let proposal = must(store.insert_proposal(&NewProposal {
            agent_id: "dex".to_string(),
            project: "docs".to_string(),
            title: "Research X".to_string(),
            body: json!({"kind": "research"}),
        }));
        let batch = WriteBatch::new(GuardedUpdate::Proposal {
            proposal_id: proposal.proposal_id,
            expected: ProposalStatus::Pending,
            patch: ProposalPatch {
                decision: Decision::Approved,
                source: DecisionSource::Human,
                decided_at: now_utc(),
            },
        })
        .with_event(NewAgentEvent::new("dex", "proposal_approved", "Approved: Research X", ""))
        .with_steps([NewMissionStep {
            proposal_id: Some(proposal.proposal_id),
            ..NewMissionStep::new("research", "docs", json!({"topic": "X"}))
        }]);

        must(store.connection().execute_batch(
            "CREATE TRIGGER trg_test_refuse_events BEFORE INSERT ON agent_events
             BEGIN SELECT RAISE(ABORT, 'event insert refused'); END;",
        ));
        assert!(matches!(store.apply_batch(&batch), Err(PipelineError::Store(_))));

        let untouched = must_some(must(store.select_proposal(proposal.proposal_id)));
        assert_eq!(untouched.status, ProposalStatus::Pending);
        assert!(must(store.select_mission_steps(&StepQuery::default())).is_empty());

        must(store.connection().execute_batch("DROP TRIGGER trg_test_refuse_events;"));
        let applied = must_some(must(store.apply_batch(&batch)));
        assert_eq!(applied.events.len(), 1);
        assert_eq!(applied.steps.len(), 1);
        assert_eq!(applied.steps[0].proposal_id, Some(proposal.proposal_id));

        let decided = must_some(must(store.select_proposal(proposal.proposal_id)));
        assert_eq!(decided.status, ProposalStatus::Approved);
        let events = must(store.select_agent_events(&EventQuery::default()));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_seq, applied.events[0].event_seq);

        assert_eq!(must(store.apply_batch(&batch)), None);
        assert_eq!(must(store.select_agent_events(&EventQuery::default())).len(), 1);
    }

    #[test]
    fn proposals_filter_by_status_and_creation_window() {
        let store = fixture_store();
        for agent in ["dex", "nova", "dex"] {
            must(store.insert_proposal(&NewProposal {
                agent_id: agent.to_string(),
                project: "docs".to_string(),
                title: format!("{agent} idea"),
                body: json!({}),
            }));
        }

        let dex = must(store.select_proposals(&ProposalQuery {
            agent_id: Some("dex".to_string()),
            status: Some(ProposalStatus::Pending),
            ..ProposalQuery::default()
        }));
        assert_eq!(dex.len(), 2);

        let today = must(store.select_proposals(&ProposalQuery {
            created_since: Some(mission_control_core::start_of_utc_day(now_utc())),
            ..ProposalQuery::default()
        }));
        assert_eq!(today.len(), 3);
    }

    #[test]
    fn agent_events_are_append_only() {
        let store = fixture_store();
        let event = must(store.insert_agent_event(
            &NewAgentEvent::new("dex", "research_completed", "Research: X", "done")
                .with_project("docs"),
        ));
        assert_eq!(event.event_seq, 1);

        let mutated = store.connection().execute(
            "UPDATE agent_events SET title = 'mutated' WHERE event_seq = 1",
            [],
        );
        assert!(mutated.is_err());
        let deleted = store
            .connection()
            .execute("DELETE FROM agent_events WHERE event_seq = 1", []);
        assert!(deleted.is_err());
    }

    #[test]
    fn agent_events_filter_by_tag_newest_first() {
        let store = fixture_store();
        must(store.insert_agent_event(
            &NewAgentEvent::new("dex", "research_completed", "A", "").with_tag("docs"),
        ));
        must(store.insert_agent_event(
            &NewAgentEvent::new("nova", "analysis_completed", "B", "").with_tag("web"),
        ));
        must(store.insert_agent_event(
            &NewAgentEvent::new("dex", "research_completed", "C", "").with_tag("docs"),
        ));

        let tagged = must(store.select_agent_events(&EventQuery {
            tag: Some("docs".to_string()),
            ..EventQuery::default()
        }));
        let titles: Vec<&str> = tagged.iter().map(|event| event.title.as_str()).collect();
        assert_eq!(titles, vec!["C", "A"]);

        let limited = must(store.select_agent_events(&EventQuery {
            limit: Some(1),
            ..EventQuery::default()
        }));
        assert_eq!(limited[0].title, "C");
    }

    #[test]
    fn policy_upsert_replaces_value() {
        let store = fixture_store();
        assert!(must(store.get_policy("worker_enabled")).is_none());
        must(store.put_policy("worker_enabled", &json!(false)));
        must(store.put_policy("worker_enabled", &json!(true)));
        assert_eq!(must(store.get_policy("worker_enabled")), Some(json!(true)));
        assert!(matches!(
            store.put_policy("  ", &json!(1)),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn held_write_lock_surfaces_as_transient_error() {
        let db_path = temp_db_path("transient");
        let setup = must(SqliteMissionStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let lock_conn = must(Connection::open(&db_path));
        must(lock_conn.execute_batch("BEGIN IMMEDIATE;"));

        let store = must(SqliteMissionStore::open_with_busy_timeout(
            &db_path,
            Duration::from_millis(50),
        ));
        let result = store.insert_mission_step(&NewMissionStep::new("research", "docs", json!({})));
        assert!(
            matches!(result, Err(PipelineError::TransientStore(_))),
            "expected transient error, got {result:?}"
        );

        must(lock_conn.execute_batch("ROLLBACK;"));
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn busy_timeout_allows_write_after_lock_release() {
        let db_path = temp_db_path("busy");
        let setup = must(SqliteMissionStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let lock_conn = must(Connection::open(&db_path));
        must(lock_conn.execute_batch("BEGIN IMMEDIATE;"));

        let write_path = db_path.clone();
        let handle = std::thread::spawn(move || {
            let store = match SqliteMissionStore::open(&write_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open write store: {err}"),
            };
            store.insert_mission_step(&NewMissionStep::new("research", "docs", json!({})))
        });

        std::thread::sleep(Duration::from_millis(150));
        must(lock_conn.execute_batch("COMMIT;"));

        let result = match handle.join() {
            Ok(result) => result,
            Err(err) => panic!("write thread join failed: {err:?}"),
        };
        assert!(result.is_ok(), "write should succeed: {:?}", result.err());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn concurrent_guarded_claims_never_double_claim() {
        let db_path = temp_db_path("concurrent");
        let setup = must(SqliteMissionStore::open(&db_path));
        must(setup.migrate());
        let ids: Vec<StepId> = (0..20)
            .map(|_| enqueue(&setup, "research", "docs").step_id)
            .collect();
        drop(setup);

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let path = db_path.clone();
                let ids = ids.clone();
                std::thread::spawn(move || {
                    let store = match SqliteMissionStore::open(&path) {
                        Ok(value) => value,
                        Err(err) => panic!("failed to open worker store: {err}"),
                    };
                    let worker_id = format!("w{worker}");
                    let mut won = 0_usize;
                    for id in ids {
                        match store.update_mission_step(id, StepStatus::Queued, &claim(&worker_id))
                        {
                            Ok(affected) => won += affected,
                            Err(err) => panic!("claim failed: {err}"),
                        }
                    }
                    won
                })
            })
            .collect();

        let total: usize = handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(won) => won,
                Err(err) => panic!("worker join failed: {err:?}"),
            })
            .sum();
        assert_eq!(total, ids.len());

        let _ = std::fs::remove_file(&db_path);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Claim,
        Succeed,
        Fail,
    }

    fn status_rank(status: StepStatus) -> u8 {
        match status {
            StepStatus::Queued => 0,
            StepStatus::Processing => 1,
            StepStatus::Succeeded | StepStatus::Failed => 2,
        }
    }

    proptest! {
        #[test]
        fn step_status_never_regresses(ops in proptest::collection::vec(
            prop_oneof![Just(Op::Claim), Just(Op::Succeed), Just(Op::Fail)],
            1..12,
        )) {
            let store = fixture_store();
            let step = enqueue(&store, "research", "docs");
            let mut rank = 0_u8;

            for op in ops {
                let (expected, patch) = match op {
                    Op::Claim => (StepStatus::Queued, claim("w1")),
                    Op::Succeed => (StepStatus::Processing, succeed(json!({}))),
                    Op::Fail => (StepStatus::Processing, StepPatch::Resolve {
                        resolution: Resolution::Failed { reason: Some("boom".to_string()) },
                        resolved_at: now_utc(),
                    }),
                };
                let before = must_some(must(store.select_mission_step(step.step_id)));
                let affected = must(store.update_mission_step(step.step_id, expected, &patch));
                let after = must_some(must(store.select_mission_step(step.step_id)));

                prop_assert!(status_rank(after.status) >= rank);
                prop_assert_eq!(affected == 1, before.status == expected);
                prop_assert_eq!(after.result.is_some(), after.status == StepStatus::Succeeded);
                rank = status_rank(after.status);
            }
        }
    }
}
