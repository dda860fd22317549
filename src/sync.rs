use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use comfy_table::Cell;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::args::BaseArgs;
use crate::client::GremlinHttpClient;
use crate::config::{self, EngineConfig, Overrides, SyncMode};
use crate::delta::{compute_delta, DeltaItem};
use crate::existence::ExistenceSet;
use crate::loader::{CursorLoader, LoadOutcome, Paging};
use crate::progress::{format_usize_commas, BarProgress, ProgressSink, SilentProgress};
use crate::record::{read_records, EntityKind, KeyProjection};
use crate::remote::Remote;
use crate::throttle::{RequestUnitThrottler, Throttle, Unthrottled};
use crate::ui::{header, print_command_status, styled_table, truncate, CommandStatus};
use crate::uploader::{BatchUploader, DropOp, Failure, InsertOp, UploadOutcome, WriteOp};

#[derive(Debug, Clone, Args)]
pub struct TuningArgs {
    /// Parallel upload workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Records per upload batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Rows per loader page (the minimum page size is clamped to it)
    #[arg(long)]
    pub page_size: Option<usize>,

    /// How the loader pages through the store
    #[arg(long, value_enum)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Clone, Args)]
pub struct LoadArgs {
    /// Which entities to sweep
    #[arg(long, short = 'k', value_enum)]
    pub kind: EntityKind,

    /// Write the existence set here as a JSON array
    #[arg(long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(Debug, Clone, Args)]
pub struct PushArgs {
    /// Which entities the input holds
    #[arg(long, short = 'k', value_enum)]
    pub kind: EntityKind,

    /// Input records (.csv, otherwise JSON Lines)
    #[arg(long = "in", value_name = "FILE")]
    pub input: PathBuf,

    /// Use this existence set instead of sweeping or resuming
    #[arg(long, value_name = "FILE")]
    pub existing: Option<PathBuf>,

    /// Ignore any persisted state and sweep the remote store
    #[arg(long)]
    pub resync: bool,

    /// Where the existence set is persisted between runs
    #[arg(long, value_name = "FILE")]
    pub state: Option<PathBuf>,

    /// Full sweep every run, or resume from the state file
    #[arg(long, value_enum)]
    pub mode: Option<SyncMode>,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(Debug, Clone, Args)]
pub struct DeltaArgs {
    /// Which entities the input holds
    #[arg(long, short = 'k', value_enum)]
    pub kind: EntityKind,

    /// Input records (.csv, otherwise JSON Lines)
    #[arg(long = "in", value_name = "FILE")]
    pub input: PathBuf,

    /// Existence set previously written by `load` or `push`
    #[arg(long, value_name = "FILE")]
    pub existing: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct DeleteArgs {
    /// Which entities the input lists
    #[arg(long, short = 'k', value_enum)]
    pub kind: EntityKind,

    /// Records to drop (.csv, otherwise JSON Lines)
    #[arg(
        long = "in",
        value_name = "FILE",
        required_unless_present = "all",
        conflicts_with = "all"
    )]
    pub input: Option<PathBuf>,

    /// Sweep the store and drop everything it holds of this kind
    #[arg(long)]
    pub all: bool,

    /// Skip the confirmation prompt for --all
    #[arg(long, short = 'f')]
    pub force: bool,

    /// Existence set to remove dropped keys from
    #[arg(long, value_name = "FILE")]
    pub state: Option<PathBuf>,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

fn resolve_config(
    base: &BaseArgs,
    tuning: Option<&TuningArgs>,
    sync_mode: Option<SyncMode>,
    state_path: Option<PathBuf>,
) -> Result<EngineConfig> {
    let overrides = Overrides {
        endpoint: base.endpoint.clone().filter(|e| !e.trim().is_empty()),
        budget: base.budget,
        workers: tuning.and_then(|t| t.workers),
        batch_size: tuning.and_then(|t| t.batch_size),
        page_size: tuning.and_then(|t| t.page_size),
        paging: tuning.and_then(|t| t.paging),
        sync_mode,
        state_path,
    };
    config::resolve(base.config.as_deref(), overrides)
}

fn cancel_on_ctrl_c() -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    let task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight records");
            signal.cancel();
        }
    });
    (cancel, task)
}

struct Engine {
    remote: Remote,
    config: EngineConfig,
    cancel: CancellationToken,
    show_progress: bool,
}

impl Engine {
    fn connect(
        base: &BaseArgs,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("no endpoint configured; pass --endpoint or set GSYNC_ENDPOINT"))?;
        let client = GremlinHttpClient::new(
            endpoint,
            base.api_key.as_deref(),
            config.request_timeout(),
            config.default_cost,
        )
        .context("failed to initialize query client")?;
        let throttle: Arc<dyn Throttle> = if config.budget_per_second > 0.0 {
            Arc::new(RequestUnitThrottler::per_second(config.budget_per_second))
        } else {
            Arc::new(Unthrottled)
        };
        let remote = Remote::new(Arc::new(client), throttle, config.retry_policy())
            .with_failed_attempt_cost(config.default_cost);
        Ok(Self {
            remote,
            config,
            cancel,
            show_progress: !base.json,
        })
    }

    fn progress(&self, prefix: String, unit: &'static str, total: Option<usize>) -> Arc<dyn ProgressSink> {
        if self.show_progress {
            Arc::new(BarProgress::new(&prefix, unit, total))
        } else {
            Arc::new(SilentProgress)
        }
    }

    async fn sweep(&self, kind: EntityKind) -> LoadOutcome {
        let progress = self.progress(format!("Loading {}", kind.plural()), "rows", None);
        CursorLoader::new(
            self.remote.clone(),
            self.config.projection(kind),
            self.config.loader_settings(),
        )
        .with_progress(progress)
        .with_cancellation(self.cancel.clone())
        .load_existing()
        .await
    }

    async fn upload(
        &self,
        op: Arc<dyn WriteOp>,
        prefix: String,
        delta: Vec<DeltaItem>,
        existing: ExistenceSet,
    ) -> UploadOutcome {
        let progress = self.progress(prefix, "records", Some(delta.len()));
        BatchUploader::new(self.remote.clone(), op, self.config.upload_settings())
            .with_progress(progress)
            .with_cancellation(self.cancel.clone())
            .upload(delta, existing)
            .await
    }
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    command: &'static str,
    kind: EntityKind,
    input: Option<&'a Path>,
    records: usize,
    existing_source: &'static str,
    existing_before: usize,
    pending: usize,
    written: usize,
    failed: usize,
    skipped: usize,
    cancelled: bool,
    retries: usize,
    existing_after: usize,
    state_path: Option<&'a Path>,
    failures: &'a [Failure],
}

pub async fn run_load(base: BaseArgs, args: LoadArgs) -> Result<()> {
    let config = resolve_config(&base, Some(&args.tuning), None, None)?;
    let (cancel, ctrlc_task) = cancel_on_ctrl_c();
    let engine = Engine::connect(&base, config, cancel)?;

    let outcome = engine.sweep(args.kind).await;
    ctrlc_task.abort();

    // A partial sweep only goes where it was explicitly asked for.
    let out = match args.out {
        Some(path) => Some(path),
        None if outcome.complete => engine.config.state_path.clone(),
        None => None,
    };
    if let Some(path) = &out {
        outcome.existing.save(path)?;
    }

    let tracker = &engine.remote.tracker;
    if base.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "command": "load",
                "kind": args.kind,
                "keys": outcome.existing.len(),
                "rows": outcome.rows,
                "pages": outcome.pages,
                "page_size": outcome.page_size,
                "complete": outcome.complete,
                "cancelled": outcome.cancelled,
                "retries": tracker.total(),
                "out": out,
            }))?
        );
        return Ok(());
    }

    let status = if outcome.complete {
        CommandStatus::Success
    } else {
        CommandStatus::Warning
    };
    print_command_status(
        status,
        &format!(
            "Loaded {} {} keys from {} rows in {} pages{}",
            format_usize_commas(outcome.existing.len()),
            args.kind.plural(),
            format_usize_commas(outcome.rows),
            format_usize_commas(outcome.pages),
            if outcome.cancelled {
                " (interrupted)"
            } else if !outcome.complete {
                " (sweep ended early; set is partial)"
            } else {
                ""
            }
        ),
    );
    if let Some(line) = tracker.summary_line() {
        println!("  {line}");
    }
    if let Some(path) = &out {
        println!("  Existence set: {}", path.display());
    }
    Ok(())
}

/// The existence set a run starts from.
struct Baseline {
    existing: ExistenceSet,
    source: &'static str,
    /// False when the set came from a sweep that ended early.
    complete: bool,
}

impl Baseline {
    fn from_sweep(outcome: LoadOutcome) -> Self {
        if !outcome.complete && !outcome.cancelled {
            warn!(
                keys = outcome.existing.len(),
                "existence sweep ended early; records missed by it may be written again"
            );
        }
        Self {
            existing: outcome.existing,
            source: "sweep",
            complete: outcome.complete,
        }
    }
}

/// Resolves the existence set a push deduplicates against.
async fn resolve_existing(
    engine: &Engine,
    kind: EntityKind,
    explicit: Option<&Path>,
) -> Result<Baseline> {
    if let Some(path) = explicit {
        let existing = ExistenceSet::load(path)?
            .ok_or_else(|| anyhow!("existence set {} not found", path.display()))?;
        return Ok(Baseline {
            existing,
            source: "file",
            complete: true,
        });
    }

    if engine.config.sync_mode == SyncMode::Incremental {
        match &engine.config.state_path {
            Some(path) => {
                if let Some(existing) = ExistenceSet::load(path)? {
                    info!(keys = existing.len(), path = %path.display(), "resuming from persisted state");
                    return Ok(Baseline {
                        existing,
                        source: "state",
                        complete: true,
                    });
                }
                info!(path = %path.display(), "no persisted state yet; running a full sweep");
            }
            None => warn!("incremental mode without a state path; running a full sweep"),
        }
    }

    Ok(Baseline::from_sweep(engine.sweep(kind).await))
}

/// Saves the existence set after a run. A baseline from a partial sweep is
/// never saved as is: only the confirmed changes are applied to the state
/// already on disk, and no state file is created from it.
fn persist_state(
    path: &Path,
    op: &dyn WriteOp,
    baseline_complete: bool,
    outcome: &UploadOutcome,
) -> Result<bool> {
    if baseline_complete {
        outcome.existing.save(path)?;
        return Ok(true);
    }
    match ExistenceSet::load(path)? {
        Some(mut state) => {
            op.settle(&mut state, &outcome.confirmed);
            state.save(path)?;
            Ok(true)
        }
        None => {
            warn!(path = %path.display(), "no complete baseline; not creating state from it");
            Ok(false)
        }
    }
}

pub async fn run_push(base: BaseArgs, args: PushArgs) -> Result<()> {
    let mode = if args.resync {
        Some(SyncMode::Full)
    } else {
        args.mode
    };
    let config = resolve_config(&base, Some(&args.tuning), mode, args.state.clone())?;
    let records = read_records(&args.input, args.kind)?;
    let record_count = records.len();
    let projection = config.projection(args.kind);

    let (cancel, ctrlc_task) = cancel_on_ctrl_c();
    let engine = Engine::connect(&base, config, cancel.clone())?;
    let baseline = resolve_existing(&engine, args.kind, args.existing.as_deref()).await?;
    let existing_before = baseline.existing.len();

    let delta = compute_delta(records, &projection, &baseline.existing);
    let pending = delta.len();
    let op: Arc<dyn WriteOp> = Arc::new(InsertOp::new(
        projection,
        engine.config.sort_key.clone(),
        engine.config.dispatcher(),
    ));
    let outcome = engine
        .upload(
            Arc::clone(&op),
            format!("Writing {}", args.kind.plural()),
            delta,
            baseline.existing,
        )
        .await;
    ctrlc_task.abort();

    let state_path = match &engine.config.state_path {
        Some(path) => persist_state(path, op.as_ref(), baseline.complete, &outcome)?
            .then(|| path.clone()),
        None => None,
    };

    let summary = RunSummary {
        command: "push",
        kind: args.kind,
        input: Some(args.input.as_path()),
        records: record_count,
        existing_source: baseline.source,
        existing_before,
        pending,
        written: outcome.written,
        failed: outcome.failures.len(),
        skipped: outcome.skipped,
        cancelled: outcome.cancelled || cancel.is_cancelled(),
        retries: engine.remote.tracker.total(),
        existing_after: outcome.existing.len(),
        state_path: state_path.as_deref(),
        failures: &outcome.failures,
    };
    report(base.json, &summary, engine.remote.tracker.summary_line())
}

/// Turns swept keys back into droppable items.
fn swept_items(projection: &KeyProjection, existing: &ExistenceSet) -> Vec<DeltaItem> {
    let mut unsplit = 0usize;
    let items = existing
        .iter()
        .filter_map(|key| match projection.record_from_key(key) {
            Some(record) => Some(DeltaItem {
                key: key.clone(),
                record,
            }),
            None => {
                unsplit += 1;
                None
            }
        })
        .collect();
    if unsplit > 0 {
        warn!(unsplit, "keys whose values contain the delimiter are left in place");
    }
    items
}

fn confirm_drop_all(kind: EntityKind, force: bool) -> Result<bool> {
    if force {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        bail!("refusing to drop every {} without --force", kind.singular());
    }
    Ok(Confirm::new()
        .with_prompt(format!("Drop every {} in the store?", kind.singular()))
        .default(false)
        .interact()?)
}

pub async fn run_delete(base: BaseArgs, args: DeleteArgs) -> Result<()> {
    let config = resolve_config(&base, Some(&args.tuning), None, args.state.clone())?;
    let projection = config.projection(args.kind);
    let listed = match &args.input {
        Some(path) => Some(read_records(path, args.kind)?),
        None => None,
    };
    if listed.is_none() && !confirm_drop_all(args.kind, args.force)? {
        return Ok(());
    }

    let (cancel, ctrlc_task) = cancel_on_ctrl_c();
    let engine = Engine::connect(&base, config, cancel.clone())?;
    let (record_count, delta, baseline) = match listed {
        Some(records) => {
            let record_count = records.len();
            let delta = compute_delta(records, &projection, &ExistenceSet::new());
            let stored = match &engine.config.state_path {
                Some(path) => ExistenceSet::load(path)?,
                None => None,
            };
            let baseline = match stored {
                Some(existing) => Baseline {
                    existing,
                    source: "state",
                    complete: true,
                },
                None => Baseline {
                    existing: ExistenceSet::new(),
                    source: "none",
                    complete: false,
                },
            };
            (record_count, delta, baseline)
        }
        None => {
            let baseline = Baseline::from_sweep(engine.sweep(args.kind).await);
            let delta = swept_items(&projection, &baseline.existing);
            (delta.len(), delta, baseline)
        }
    };
    let existing_before = baseline.existing.len();
    let pending = delta.len();

    let op: Arc<dyn WriteOp> = Arc::new(DropOp::new(projection, engine.config.sort_key.clone()));
    let outcome = engine
        .upload(
            Arc::clone(&op),
            format!("Dropping {}", args.kind.plural()),
            delta,
            baseline.existing,
        )
        .await;
    ctrlc_task.abort();

    let state_path = match &engine.config.state_path {
        Some(path) => persist_state(path, op.as_ref(), baseline.complete, &outcome)?
            .then(|| path.clone()),
        None => None,
    };

    let summary = RunSummary {
        command: "delete",
        kind: args.kind,
        input: args.input.as_deref(),
        records: record_count,
        existing_source: baseline.source,
        existing_before,
        pending,
        written: outcome.written,
        failed: outcome.failures.len(),
        skipped: outcome.skipped,
        cancelled: outcome.cancelled || cancel.is_cancelled(),
        retries: engine.remote.tracker.total(),
        existing_after: outcome.existing.len(),
        state_path: state_path.as_deref(),
        failures: &outcome.failures,
    };
    report(base.json, &summary, engine.remote.tracker.summary_line())
}

/// Prints the delta without touching the remote store.
pub fn run_delta(base: BaseArgs, args: DeltaArgs) -> Result<()> {
    let config = resolve_config(&base, None, None, None)?;
    let records = read_records(&args.input, args.kind)?;
    let record_count = records.len();
    let existing = ExistenceSet::load(&args.existing)?
        .ok_or_else(|| anyhow!("existence set {} not found", args.existing.display()))?;
    let delta = compute_delta(records, &config.projection(args.kind), &existing);

    if base.json {
        for item in &delta {
            println!(
                "{}",
                serde_json::to_string(item).context("failed to serialize delta item")?
            );
        }
        return Ok(());
    }

    print_command_status(
        CommandStatus::Success,
        &format!(
            "{} of {} {} pending ({} keys already present)",
            format_usize_commas(delta.len()),
            format_usize_commas(record_count),
            args.kind.plural(),
            format_usize_commas(existing.len()),
        ),
    );
    for item in &delta {
        println!("{}", item.key);
    }
    Ok(())
}

fn report(json_output: bool, summary: &RunSummary<'_>, retry_line: Option<String>) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print_human_summary(summary, retry_line);
    }

    if summary.failed > 0 {
        bail!(
            "{} {} could not be {}",
            format_usize_commas(summary.failed),
            summary.kind.plural(),
            if summary.command == "delete" {
                "dropped"
            } else {
                "written"
            }
        );
    }
    Ok(())
}

fn print_human_summary(summary: &RunSummary<'_>, retry_line: Option<String>) {
    let verb = if summary.command == "delete" {
        "Dropped"
    } else {
        "Wrote"
    };
    let status = if summary.cancelled || summary.failed > 0 {
        CommandStatus::Warning
    } else {
        CommandStatus::Success
    };
    print_command_status(
        status,
        &format!(
            "{verb} {} of {} pending {}{}",
            format_usize_commas(summary.written),
            format_usize_commas(summary.pending),
            summary.kind.plural(),
            if summary.cancelled { " (interrupted)" } else { "" }
        ),
    );
    match summary.input {
        Some(path) => println!(
            "  Input: {} ({} records)",
            path.display(),
            format_usize_commas(summary.records)
        ),
        None => println!("  Input: remote sweep ({} keys)", format_usize_commas(summary.records)),
    }
    println!(
        "  Existence set: {} keys before ({}), {} after",
        format_usize_commas(summary.existing_before),
        summary.existing_source,
        format_usize_commas(summary.existing_after)
    );
    if summary.skipped > 0 {
        println!("  Not attempted: {}", format_usize_commas(summary.skipped));
    }
    if let Some(line) = retry_line {
        println!("  {line}");
    }
    if let Some(path) = summary.state_path {
        println!("  State: {}", path.display());
    }

    if summary.failures.is_empty() {
        return;
    }
    let mut table = styled_table();
    table.set_header(vec![header("Key"), header("Reason"), header("Message")]);
    for failure in summary.failures {
        table.add_row(vec![
            Cell::new(&failure.key),
            Cell::new(failure.reason.as_str()),
            Cell::new(truncate(&failure.message, 80)),
        ]);
    }
    println!();
    println!("{table}");
}
