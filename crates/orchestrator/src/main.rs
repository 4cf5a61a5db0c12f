#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bf_core::events::{ArtifactNotification, ComputeCompletionSignal, InboxMessage};
use bf_core::{JobId, JobStatus, OutOfOrderPolicy};
use bf_orchestrator::{BackendKind, OrchestratorConfig, Runtime, inbox, status};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "bf_orchestrator",
    version,
    about = "Job orchestration control plane for the binder design pipeline",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

/// Settings that override the YAML config file.
#[derive(Args, Debug)]
struct ConfigOverrides {
    /// YAML config file; every field is optional
    #[arg(long, env = "BF_CONFIG", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Directory holding the job ledger
    #[arg(long, env = "BF_STORAGE_DIR", value_name = "DIR", global = true)]
    storage_dir: Option<PathBuf>,

    /// Root directory of the local object store
    #[arg(long, env = "BF_OBJECT_STORE_ROOT", value_name = "DIR", global = true)]
    object_store_root: Option<PathBuf>,

    /// Container image submitted to the compute backend
    #[arg(long, env = "BF_CONTAINER_REFERENCE", value_name = "REF", global = true)]
    container_reference: Option<String>,

    #[arg(long, env = "BF_BACKEND", value_enum, global = true)]
    backend: Option<BackendArg>,

    /// Submit program for the command backend
    #[arg(long, env = "BF_BACKEND_PROGRAM", value_name = "PATH", global = true)]
    backend_program: Option<String>,

    #[arg(long, env = "BF_STAGE_COUNT", global = true)]
    stage_count: Option<u8>,

    #[arg(long, env = "BF_OUT_OF_ORDER_POLICY", value_enum, global = true)]
    out_of_order_policy: Option<PolicyArg>,

    #[arg(long, env = "BF_MAX_JOB_DURATION_S", global = true)]
    max_job_duration_s: Option<u64>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    DryRun,
    Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    InOrder,
    SkipAhead,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Handle one artifact notification (JSON) from a file or stdin
    Dispatch(InputArgs),
    /// Handle one compute completion signal (JSON) from a file or stdin
    Reconcile(InputArgs),
    /// Time out jobs that stopped making progress
    Watchdog(WatchdogArgs),
    /// Query the job ledger
    #[command(subcommand)]
    Status(StatusCommand),
    /// Process line-delimited inbox messages until end of input
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct InputArgs {
    /// JSON input file (default: stdin)
    #[arg(long, value_name = "PATH")]
    input: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct WatchdogArgs {
    /// Keep sweeping every N seconds instead of once
    #[arg(long, value_name = "S")]
    interval_s: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum StatusCommand {
    Get {
        job_id: String,
        /// Include the audit trail
        #[arg(long)]
        events: bool,
    },
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    Counts,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Line-delimited JSON inbox (default: stdin)
    #[arg(long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Concurrent handler threads, each with its own ledger connection
    #[arg(long, env = "BF_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Do not run the periodic watchdog alongside the inbox
    #[arg(long)]
    no_watchdog: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.overrides)?;
    let runtime = Runtime::from_config(config).context("invalid configuration")?;

    match cli.command {
        Command::Dispatch(args) => {
            let event: ArtifactNotification = read_json(args.input.as_deref())?;
            run_single(&runtime, &InboxMessage::ArtifactCreated(event))
        }
        Command::Reconcile(args) => {
            let signal: ComputeCompletionSignal = read_json(args.input.as_deref())?;
            run_single(&runtime, &InboxMessage::ComputeCompleted(signal))
        }
        Command::Watchdog(args) => run_watchdog(&runtime, args.interval_s),
        Command::Status(command) => run_status(&runtime, command),
        Command::Serve(args) => run_serve(&runtime, args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(overrides: &ConfigOverrides) -> Result<OrchestratorConfig> {
    let mut config = match overrides.config.as_deref() {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };
    if let Some(dir) = &overrides.storage_dir {
        config.storage_dir = dir.clone();
    }
    if let Some(root) = &overrides.object_store_root {
        config.object_store_root = root.clone();
    }
    if let Some(reference) = &overrides.container_reference {
        config.container_reference = reference.clone();
    }
    if let Some(backend) = overrides.backend {
        config.backend.kind = match backend {
            BackendArg::DryRun => BackendKind::DryRun,
            BackendArg::Command => BackendKind::Command,
        };
    }
    if let Some(program) = &overrides.backend_program {
        config.backend.program = Some(program.clone());
    }
    if let Some(stage_count) = overrides.stage_count {
        config.stage_count = stage_count;
    }
    if let Some(policy) = overrides.out_of_order_policy {
        config.out_of_order_policy = match policy {
            PolicyArg::InOrder => OutOfOrderPolicy::InOrder,
            PolicyArg::SkipAhead => OutOfOrderPolicy::SkipAhead,
        };
    }
    if let Some(max) = overrides.max_job_duration_s {
        config.max_job_duration_s = max;
    }
    Ok(config)
}

fn read_json<T: DeserializeOwned>(path: Option<&Path>) -> Result<T> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            buf
        }
    };
    serde_json::from_str(&raw).context("malformed input message")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_single(runtime: &Runtime, message: &InboxMessage) -> Result<()> {
    let mut store = runtime.open_ledger()?;
    let summary = runtime.handle_message(&mut store, message)?;
    print_json(&summary)
}

fn run_watchdog(runtime: &Runtime, interval_s: Option<u64>) -> Result<()> {
    let Some(interval_s) = interval_s.filter(|s| *s > 0) else {
        let mut store = runtime.open_ledger()?;
        let report = runtime
            .watchdog()
            .sweep(&mut store, runtime.clock.now_ms())?;
        return print_json(&report);
    };
    tracing::info!(interval_s, "watchdog running");
    loop {
        let mut store = runtime.open_ledger()?;
        match runtime.watchdog().sweep(&mut store, runtime.clock.now_ms()) {
            Ok(report) => print_json(&report)?,
            Err(err) => tracing::error!(error = %err, "watchdog sweep failed"),
        }
        drop(store);
        std::thread::sleep(Duration::from_secs(interval_s));
    }
}

fn run_status(runtime: &Runtime, command: StatusCommand) -> Result<()> {
    let store = runtime.open_ledger()?;
    match command {
        StatusCommand::Get { job_id, events } => {
            let job_id = JobId::try_new(job_id.trim())
                .map_err(|err| anyhow::anyhow!("invalid job id: {err}"))?;
            match status::get(&store, &job_id, events)? {
                Some(view) => print_json(&view),
                None => bail!("job not found: {job_id}"),
            }
        }
        StatusCommand::List {
            status: filter,
            limit,
            offset,
        } => {
            let filter = filter
                .as_deref()
                .map(JobStatus::parse)
                .transpose()
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            print_json(&status::list(&store, filter, limit, offset)?)
        }
        StatusCommand::Counts => print_json(&status::counts(&store)?),
    }
}

fn run_serve(runtime: &Runtime, args: ServeArgs) -> Result<()> {
    let interval = Duration::from_secs(runtime.config.watchdog_interval_s);
    let run_watchdog = !args.no_watchdog && !interval.is_zero();
    let stop = AtomicBool::new(false);

    let stats = std::thread::scope(|scope| -> Result<inbox::InboxStats> {
        if run_watchdog {
            scope.spawn(|| periodic_watchdog(runtime, interval, &stop));
        }
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let result = match args.input.as_deref() {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("open {}", path.display()));
                file.and_then(|file| {
                    Ok(inbox::run(runtime, BufReader::new(file), &mut out, args.workers)?)
                })
            }
            None => {
                let stdin = std::io::stdin();
                Ok(inbox::run(runtime, stdin.lock(), &mut out, args.workers)?)
            }
        };
        stop.store(true, Ordering::SeqCst);
        result
    })?;

    tracing::info!(
        lines = stats.lines,
        ok = stats.ok,
        failed = stats.failed,
        "inbox drained"
    );
    Ok(())
}

fn periodic_watchdog(runtime: &Runtime, interval: Duration, stop: &AtomicBool) {
    let tick = Duration::from_millis(200).min(interval);
    let mut next = Instant::now() + interval;
    while !stop.load(Ordering::SeqCst) {
        if Instant::now() < next {
            std::thread::sleep(tick);
            continue;
        }
        next = Instant::now() + interval;
        let swept = runtime.open_ledger().and_then(|mut store| {
            runtime
                .watchdog()
                .sweep(&mut store, runtime.clock.now_ms())
        });
        if let Err(err) = swept {
            tracing::error!(error = %err, "watchdog sweep failed");
        }
    }
}
