//! `mc`: operator command surface for the mission pipeline.
//!
//! Every command prints pretty JSON on stdout. Logs go to stderr, and a
//! failed command writes a single `{code, message}` envelope as the last
//! stderr line before exiting non-zero.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, Stdio};
use std::sync::atomic::AtomicBool;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mission_control_core::{
    now_utc, parse_rfc3339_utc, Decision, DecisionSource, EventQuery, MissionStep,
    MissionStore, NewMissionStep, NewProposal, PipelineConfig, PipelineError, ProposalId,
    ProposalQuery, ProposalStatus, Resolution, SortOrder, StepId, StepQuery, StepStatus,
};
use mission_control_pipeline::{Heartbeat, Orchestrator, TaskExecutor, Worker};
use mission_control_store_sqlite::{SqliteMissionStore, MISSION_SCHEMA_VERSION};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mc")]
#[command(about = "Mission Control operations pipeline CLI")]
pub struct Cli {
    #[arg(long, default_value = "./mission_control.sqlite3")]
    db: PathBuf,

    /// TOML pipeline configuration; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Step {
        #[command(subcommand)]
        command: Box<StepCommand>,
    },
    Proposal {
        #[command(subcommand)]
        command: Box<ProposalCommand>,
    },
    Events {
        #[command(subcommand)]
        command: Box<EventsCommand>,
    },
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// Run one heartbeat pass: triggers, auto-approval, stuck-step recovery.
    Heartbeat,
    Worker {
        #[command(subcommand)]
        command: Box<WorkerCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
}

#[derive(Debug, Subcommand)]
pub enum StepCommand {
    Enqueue(StepEnqueueArgs),
    Claim(StepClaimArgs),
    Resolve(StepResolveArgs),
    Show(StepShowArgs),
    List(StepListArgs),
}

#[derive(Debug, Args)]
pub struct StepEnqueueArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    project: String,
    #[arg(long, default_value = "{}")]
    payload_json: String,
    #[arg(long)]
    proposal_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct StepClaimArgs {
    #[arg(long)]
    worker_id: String,
    #[arg(long)]
    project: Option<String>,
    #[arg(long = "kind")]
    kinds: Vec<String>,
}

#[derive(Debug, Args)]
pub struct StepResolveArgs {
    #[arg(long)]
    step_id: String,
    #[arg(long)]
    outcome: OutcomeArg,
    #[arg(long, default_value = "{}")]
    result_json: String,
    #[arg(long)]
    reason: Option<String>,
}

#[derive(Debug, Args)]
pub struct StepShowArgs {
    #[arg(long)]
    step_id: String,
}

#[derive(Debug, Args)]
pub struct StepListArgs {
    #[arg(long)]
    project: Option<String>,
    #[arg(long = "kind")]
    kinds: Vec<String>,
    #[arg(long)]
    status: Option<StepStatusArg>,
    #[arg(long)]
    newest_first: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum ProposalCommand {
    Create(ProposalCreateArgs),
    Approve(ProposalDecideArgs),
    Reject(ProposalDecideArgs),
    Show(ProposalShowArgs),
    List(ProposalListArgs),
}

#[derive(Debug, Args)]
pub struct ProposalCreateArgs {
    #[arg(long)]
    agent_id: String,
    #[arg(long)]
    project: String,
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "{}")]
    body_json: String,
}

#[derive(Debug, Args)]
pub struct ProposalDecideArgs {
    #[arg(long)]
    proposal_id: String,
    /// Record the decision as made by policy rather than a person.
    #[arg(long)]
    automated: bool,
}

#[derive(Debug, Args)]
pub struct ProposalShowArgs {
    #[arg(long)]
    proposal_id: String,
}

#[derive(Debug, Args)]
pub struct ProposalListArgs {
    #[arg(long)]
    status: Option<ProposalStatusArg>,
    #[arg(long)]
    agent_id: Option<String>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    newest_first: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long)]
    agent_id: Option<String>,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    tag: Option<String>,
    /// RFC3339 lower bound on `created_at`.
    #[arg(long)]
    since: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Set(PolicySetArgs),
    Show(PolicyShowArgs),
}

#[derive(Debug, Args)]
pub struct PolicySetArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    value_json: String,
}

#[derive(Debug, Args)]
pub struct PolicyShowArgs {
    #[arg(long)]
    key: String,
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Poll, execute and resolve steps with an external program.
    ///
    /// The program receives the step payload as JSON on stdin and must print
    /// a JSON result on stdout. A non-zero exit fails the step.
    Run(WorkerRunArgs),
}

#[derive(Debug, Args)]
pub struct WorkerRunArgs {
    #[arg(long)]
    worker_id: String,
    #[arg(long)]
    project: Option<String>,
    #[arg(long = "kind")]
    kinds: Vec<String>,
    #[arg(long)]
    max_iterations: Option<u64>,
    #[arg(required = true, last = true)]
    program: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutcomeArg {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StepStatusArg {
    Queued,
    Processing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProposalStatusArg {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Serialize)]
struct MigrateReport {
    db: String,
    schema_version: i64,
}

#[derive(Debug, Serialize)]
struct PolicyEntry {
    key: String,
    value: Option<Value>,
}

/// Runs one parsed `mc` invocation.
///
/// # Errors
/// Returns an error when configuration loading, store open/migrate, or the
/// requested command fails. Pipeline failures keep their
/// [`PipelineError`] so [`error_envelope`] can report a stable code.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(cli.log_json);
    let config = load_config(cli.config.as_deref())?;

    let store = SqliteMissionStore::open(&cli.db)?;
    store.migrate()?;

    match cli.command {
        Command::Db {
            command: DbCommand::Migrate,
        } => print_json(&MigrateReport {
            db: cli.db.display().to_string(),
            schema_version: store.schema_version()?.unwrap_or(MISSION_SCHEMA_VERSION),
        }),
        Command::Step { command } => run_step(*command, &store, &config),
        Command::Proposal { command } => run_proposal(*command, &store, &config),
        Command::Events { command } => run_events(*command, &store, &config),
        Command::Policy { command } => run_policy(command, &store),
        Command::Heartbeat => {
            let report = Heartbeat::new(&store, &config).run(now_utc())?;
            print_json(&report)
        }
        Command::Worker { command } => match *command {
            WorkerCommand::Run(args) => run_worker(args, &store, &config),
        },
    }
}

fn run_step(command: StepCommand, store: &dyn MissionStore, config: &PipelineConfig) -> Result<()> {
    let orchestrator = Orchestrator::new(store, config);
    match command {
        StepCommand::Enqueue(args) => {
            let mut step =
                NewMissionStep::new(args.kind, args.project, parse_json_arg(&args.payload_json)?);
            step.proposal_id = args
                .proposal_id
                .as_deref()
                .map(ProposalId::parse)
                .transpose()?;
            print_json(&orchestrator.queue().enqueue(&step)?)
        }
        StepCommand::Claim(args) => {
            let claimed = orchestrator.queue().claim_next(
                &args.worker_id,
                args.project.as_deref(),
                &args.kinds,
            )?;
            print_json(&claimed)
        }
        StepCommand::Resolve(args) => {
            let resolution = match args.outcome {
                OutcomeArg::Succeeded => Resolution::Succeeded {
                    result: parse_json_arg(&args.result_json)?,
                },
                OutcomeArg::Failed => Resolution::Failed {
                    reason: args.reason,
                },
            };
            let completion = orchestrator.complete_step(StepId::parse(&args.step_id)?, resolution)?;
            print_json(&completion)
        }
        StepCommand::Show(args) => {
            print_json(&orchestrator.queue().get(StepId::parse(&args.step_id)?)?)
        }
        StepCommand::List(args) => {
            let query = StepQuery {
                project: args.project,
                kinds: args.kinds,
                status: args.status.map(map_step_status),
                claimed_before: None,
                order: sort_order(args.newest_first),
                limit: args.limit,
            };
            print_json(&orchestrator.queue().list(&query)?)
        }
    }
}

fn run_proposal(
    command: ProposalCommand,
    store: &dyn MissionStore,
    config: &PipelineConfig,
) -> Result<()> {
    let orchestrator = Orchestrator::new(store, config);
    match command {
        ProposalCommand::Create(args) => {
            let proposal = NewProposal {
                agent_id: args.agent_id,
                project: args.project,
                title: args.title,
                body: parse_json_arg(&args.body_json)?,
            };
            print_json(&orchestrator.gate().propose(&proposal)?)
        }
        ProposalCommand::Approve(args) => decide(&orchestrator, &args, Decision::Approved),
        ProposalCommand::Reject(args) => decide(&orchestrator, &args, Decision::Rejected),
        ProposalCommand::Show(args) => print_json(
            &orchestrator
                .gate()
                .get(ProposalId::parse(&args.proposal_id)?)?,
        ),
        ProposalCommand::List(args) => {
            let query = ProposalQuery {
                status: args.status.map(map_proposal_status),
                agent_id: args.agent_id,
                project: args.project,
                created_since: None,
                order: sort_order(args.newest_first),
                limit: args.limit,
            };
            print_json(&orchestrator.gate().list(&query)?)
        }
    }
}

fn decide(orchestrator: &Orchestrator<'_>, args: &ProposalDecideArgs, decision: Decision) -> Result<()> {
    let source = if args.automated {
        DecisionSource::Automated
    } else {
        DecisionSource::Human
    };
    let outcome = orchestrator.decide(ProposalId::parse(&args.proposal_id)?, decision, source)?;
    print_json(&outcome)
}

fn run_events(
    command: EventsCommand,
    store: &dyn MissionStore,
    config: &PipelineConfig,
) -> Result<()> {
    let orchestrator = Orchestrator::new(store, config);
    match command {
        EventsCommand::List(args) => {
            let query = EventQuery {
                agent_id: args.agent_id,
                kind: args.kind,
                tag: args.tag,
                since: args.since.as_deref().map(parse_rfc3339_utc).transpose()?,
                limit: Some(args.limit),
            };
            print_json(&orchestrator.events().list(&query)?)
        }
    }
}

fn run_policy(command: PolicyCommand, store: &dyn MissionStore) -> Result<()> {
    match command {
        PolicyCommand::Set(args) => {
            let value: Value = serde_json::from_str(&args.value_json)
                .with_context(|| format!("--value-json for {} is not valid JSON", args.key))?;
            store.put_policy(&args.key, &value)?;
            tracing::info!(key = %args.key, "policy updated");
            print_json(&PolicyEntry {
                key: args.key,
                value: Some(value),
            })
        }
        PolicyCommand::Show(args) => {
            let value = store.get_policy(&args.key)?;
            print_json(&PolicyEntry {
                key: args.key,
                value,
            })
        }
    }
}

fn run_worker(args: WorkerRunArgs, store: &dyn MissionStore, config: &PipelineConfig) -> Result<()> {
    let executor = CommandExecutor::from_argv(args.program)?;
    let worker = Worker::new(store, config, args.worker_id, executor)
        .with_project(args.project)
        .with_kinds(args.kinds);

    let stop = AtomicBool::new(false);
    let report = worker.run(&stop, args.max_iterations)?;
    print_json(&report)
}

/// Runs an external program per step: payload JSON on stdin, result JSON on
/// stdout. Empty stdout counts as an empty result object.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    /// # Errors
    /// Returns an error when `argv` is empty.
    pub fn from_argv(argv: Vec<String>) -> Result<Self> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .ok_or_else(|| anyhow!("worker program MUST be provided after `--`"))?;
        Ok(Self {
            program,
            args: argv.collect(),
        })
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute(&self, step: &MissionStep) -> Result<Value> {
        let payload = serde_json::to_vec(&step.payload)?;
        let mut child = std::process::Command::new(&self.program)
            .args(&self.args)
            .env("MC_STEP_ID", step.step_id.to_string())
            .env("MC_STEP_KIND", &step.kind)
            .env("MC_PROJECT", &step.project)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        // stdin is fed while stdout/stderr drain, so neither side can stall
        // on a full pipe. The child is always reaped before returning.
        let stdin = child.stdin.take();
        let (written, output) = std::thread::scope(|scope| {
            let writer = scope.spawn(|| write_payload(stdin, &payload));
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            (written, output)
        });

        let output = output.with_context(|| format!("failed waiting for {}", self.program))?;
        written.context("failed to write step payload to executor stdin")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("executor stdout is not UTF-8")?;
        if stdout.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(stdout.trim()).context("executor stdout is not valid JSON")
    }
}

/// Writes the payload and closes stdin. A program that ignores stdin may exit
/// before reading it, which is not an error.
fn write_payload(stdin: Option<ChildStdin>, payload: &[u8]) -> std::io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    match stdin.write_all(payload) {
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

/// Installs the stderr subscriber once; later calls are no-ops.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let text_layer = (!json).then(|| fmt::layer().with_target(true).with_writer(std::io::stderr));
    let json_layer = json.then(|| fmt::layer().json().with_target(true).with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .try_init();
}

/// Loads the pipeline config from `path`, or the defaults when absent.
///
/// # Errors
/// Returns an error when the file cannot be read or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let mut raw = String::new();
    std::fs::File::open(path)
        .and_then(|mut file| file.read_to_string(&mut raw))
        .with_context(|| format!("failed to read config {}", path.display()))?;
    Ok(PipelineConfig::from_toml_str(&raw)?)
}

/// Machine-readable failure envelope: `{code, message}`.
///
/// Errors that carry a [`PipelineError`] anywhere in their chain report its
/// code; anything else is `internal_error`.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> Value {
    let code = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map_or("internal_error", PipelineError::code);
    serde_json::json!({
        "code": code,
        "message": format!("{err:#}"),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_json_arg(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|err| {
        anyhow::Error::new(PipelineError::Validation(format!(
            "argument is not valid JSON: {err}"
        )))
    })
}

fn sort_order(newest_first: bool) -> SortOrder {
    if newest_first {
        SortOrder::NewestFirst
    } else {
        SortOrder::OldestFirst
    }
}

fn map_step_status(value: StepStatusArg) -> StepStatus {
    match value {
        StepStatusArg::Queued => StepStatus::Queued,
        StepStatusArg::Processing => StepStatus::Processing,
        StepStatusArg::Succeeded => StepStatus::Succeeded,
        StepStatusArg::Failed => StepStatus::Failed,
    }
}

fn map_proposal_status(value: ProposalStatusArg) -> ProposalStatus {
    match value {
        ProposalStatusArg::Pending => ProposalStatus::Pending,
        ProposalStatusArg::Approved => ProposalStatus::Approved,
        ProposalStatusArg::Rejected => ProposalStatus::Rejected,
    }
}
