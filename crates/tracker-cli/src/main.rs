use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tracker_core::{pid_alive, Run, TrackerContext, OUTPUT_FILE};
use tracker_runner::{
    load_experiment, Operation, OperationError, ProcError, ProjectConfig, RemoteRegistry,
};

#[derive(Parser)]
#[command(name = "tracker", version, about = "Experiment execution tracker")]
struct Cli {
    /// Working directory override.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,
    /// Tracker home override (default: $TRACKER_HOME or ~/.tracker).
    #[arg(long = "tracker-home", global = true)]
    tracker_home: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment operation.
    Run {
        experiment: String,
        /// Operation to run within the experiment.
        #[arg(default_value = "train")]
        operation: String,
        /// Use an alternative run directory.
        #[arg(long)]
        run_dir: Option<PathBuf>,
        /// Limit available GPUs to a comma separated device list.
        #[arg(long, conflicts_with = "no_gpus")]
        gpus: Option<String>,
        /// Disable GPUs for the run.
        #[arg(long)]
        no_gpus: bool,
        /// Run the operation on a configured remote.
        #[arg(short, long)]
        remote: Option<String>,
    },
    /// List runs.
    Runs {
        #[arg(long)]
        json: bool,
    },
    /// Show a run's attributes.
    Info {
        /// Run id or short-id prefix.
        run: String,
        #[arg(long)]
        json: bool,
    },
    /// Watch the output of a running operation.
    Watch {
        /// Process id, or a path to a file containing one.
        #[arg(short, long)]
        pid: String,
    },
    /// List configured remotes.
    Remotes,
}

static INTERRUPT: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_sigint(_sig: libc::c_int) {
    if let Some(flag) = INTERRUPT.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

fn install_interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::clone(INTERRUPT.get_or_init(|| Arc::new(AtomicBool::new(false))));
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
    }
    flag
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let ctx = build_context(cli.cwd, cli.tracker_home)?;
    match cli.command {
        Commands::Run {
            experiment,
            operation,
            run_dir,
            gpus,
            no_gpus,
            remote,
        } => cmd_run(ctx, experiment, operation, run_dir, gpus, no_gpus, remote),
        Commands::Runs { json } => cmd_runs(ctx, json),
        Commands::Info { run, json } => cmd_info(ctx, &run, json),
        Commands::Watch { pid } => cmd_watch(ctx, &pid),
        Commands::Remotes => cmd_remotes(ctx),
    }
}

fn build_context(cwd: Option<PathBuf>, tracker_home: Option<PathBuf>) -> Result<TrackerContext> {
    let cwd = match cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("resolving working directory")?,
    };
    let tracker_home = tracker_home
        .or_else(|| std::env::var_os("TRACKER_HOME").map(PathBuf::from))
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".tracker")))
        .ok_or_else(|| anyhow!("cannot determine tracker home; set TRACKER_HOME"))?;
    Ok(TrackerContext::new(cwd, tracker_home))
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    ctx: TrackerContext,
    experiment: String,
    operation: String,
    run_dir: Option<PathBuf>,
    gpus: Option<String>,
    no_gpus: bool,
    remote: Option<String>,
) -> Result<()> {
    let project = ProjectConfig::load(&ctx)?;
    let file = ctx.cwd().join(project.experiment_file(&experiment)?);
    let def = load_experiment(&file, &experiment)?;
    let opdef = def.operation(&operation)?.clone();

    let remote_name = remote.or_else(|| opdef.remote.clone());
    let mut op = Operation::new(ctx.clone(), &experiment, &operation, opdef)
        .with_resources(def.resources.clone())
        .with_interrupt_flag(install_interrupt_flag());
    if let Some(dir) = run_dir {
        let dir = if dir.is_absolute() {
            dir
        } else {
            ctx.cwd().join(dir)
        };
        println!(
            "Run directory is '{}' (results will not be visible to tracker)",
            dir.display()
        );
        op = op.with_run_dir(dir);
    }
    if no_gpus {
        op = op.with_gpus("");
    } else if let Some(gpus) = gpus {
        op = op.with_gpus(&gpus);
    }
    if let Some(name) = &remote_name {
        let registry = RemoteRegistry::default();
        op = op.with_remote(registry.for_name(name, &project)?);
        println!("Conducting experiment: {} on {}", experiment, name);
    } else {
        println!("Conducting experiment: {}", experiment);
    }

    match op.run() {
        Ok(exit_status) => {
            println!("Exited with return code {}", exit_status);
            if exit_status != 0 {
                std::process::exit(exit_status & 0xff);
            }
            Ok(())
        }
        Err(err @ OperationError::Process(ProcError::Spawn { .. })) => {
            eprintln!("Run failed: {}", err);
            std::process::exit(2);
        }
        Err(
            err @ (OperationError::ResourceResolution(_) | OperationError::UnknownResource(_)),
        ) => {
            eprintln!("Run failed as a dependency was not met: {}", err);
            std::process::exit(3);
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_runs(ctx: TrackerContext, json: bool) -> Result<()> {
    let runs = all_runs(&ctx);
    if json {
        let payload: Vec<_> = runs
            .iter()
            .map(|run| {
                json!({
                    "id": run.id(),
                    "short_id": run.short_id(),
                    "status": run.status().to_string(),
                    "timestamp": run.timestamp(),
                    "path": run.path().display().to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<10}  {}",
            run.short_id(),
            run.status().to_string(),
            run.timestamp().unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_info(ctx: TrackerContext, prefix: &str, json: bool) -> Result<()> {
    let run = run_for_prefix(&ctx, prefix)?;
    if json {
        let mut attrs = serde_json::Map::new();
        for name in run.attr_names() {
            if let Some(value) = run.get_attr(&name) {
                attrs.insert(name, yaml_to_json(value));
            }
        }
        let payload = json!({
            "id": run.id(),
            "status": run.status().to_string(),
            "attrs": attrs,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    println!("id: {}", run.id());
    println!("status: {}", run.status());
    for name in run.attr_names() {
        if let Some(value) = run.get_attr(&name) {
            let rendered = serde_yaml::to_string(&value).unwrap_or_default();
            println!("{}: {}", name, rendered.trim_end());
        }
    }
    Ok(())
}

fn cmd_watch(ctx: TrackerContext, pid_arg: &str) -> Result<()> {
    let pid = resolve_pid_arg(pid_arg)?;
    let run = run_for_pid(&ctx, pid)
        .ok_or_else(|| anyhow!("cannot find run for pid {}", pid))?;
    eprintln!("Watching run {} (pid: {})", run.id(), pid);
    tail_output(&run)?;
    eprintln!("Run {} stopped with a status of '{}'", run.short_id(), run.status());
    Ok(())
}

fn cmd_remotes(ctx: TrackerContext) -> Result<()> {
    let project = ProjectConfig::load(&ctx)?;
    if project.remotes.is_empty() {
        return Err(anyhow!(
            "no remotes specified in {}",
            ctx.config_path().display()
        ));
    }
    for (name, spec) in &project.remotes {
        println!(
            "{}  {:<6}  {:<24}  {}",
            name,
            spec.remote_type,
            spec.host.as_deref().unwrap_or(""),
            spec.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Every run directory under the runs area and the per-experiment
/// areas, newest-path-name last.
fn all_runs(ctx: &TrackerContext) -> Vec<Run> {
    let mut run_dirs: Vec<PathBuf> = Vec::new();
    run_dirs.extend(list_dirs(&ctx.runs_dir()));
    for experiment_dir in list_dirs(&ctx.experiments_dir()) {
        run_dirs.extend(list_dirs(&experiment_dir));
    }
    run_dirs.sort();
    run_dirs.into_iter().map(Run::from_dir).collect()
}

fn list_dirs(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn run_for_prefix(ctx: &TrackerContext, prefix: &str) -> Result<Run> {
    let matches: Vec<Run> = all_runs(ctx)
        .into_iter()
        .filter(|run| run.id().starts_with(prefix))
        .collect();
    match matches.len() {
        0 => Err(anyhow!("no run matching '{}'", prefix)),
        1 => Ok(matches.into_iter().next().unwrap()),
        n => Err(anyhow!("'{}' matches {} runs; use more characters", prefix, n)),
    }
}

/// A pid argument is either a literal pid or a pidfile path.
fn resolve_pid_arg(arg: &str) -> Result<u32> {
    if let Ok(pid) = arg.parse() {
        return Ok(pid);
    }
    let raw = std::fs::read_to_string(arg)
        .with_context(|| format!("{} does not exist", arg))?;
    raw.trim()
        .parse()
        .map_err(|_| anyhow!("pidfile {} does not contain a valid pid", arg))
}

fn run_for_pid(ctx: &TrackerContext, pid: u32) -> Option<Run> {
    all_runs(ctx).into_iter().find(|run| match run.pid() {
        Some(run_pid) => {
            run_pid == pid || tracker_runner::parent_pid(run_pid) == Some(pid)
        }
        None => false,
    })
}

/// Follows the run's output file while its process is alive, then
/// drains whatever is left.
fn tail_output(run: &Run) -> Result<()> {
    let path = run.tracker_path(OUTPUT_FILE);
    let mut reader: Option<BufReader<File>> = None;
    loop {
        let live = run.pid().map(pid_alive).unwrap_or(false);
        if reader.is_none() {
            reader = File::open(&path).ok().map(BufReader::new);
        }
        if let Some(r) = reader.as_mut() {
            let mut line = String::new();
            while r.read_line(&mut line)? > 0 {
                print!("{}", line);
                line.clear();
            }
        }
        if !live {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn yaml_to_json(value: serde_yaml::Value) -> serde_json::Value {
    serde_json::to_value(&value).unwrap_or(serde_json::Value::Null)
}
