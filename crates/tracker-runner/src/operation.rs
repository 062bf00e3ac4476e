use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;

use tracker_capture::{base_sourcecode_rules, copytree, files_digest, CaptureError, FileSelect};
use tracker_core::{
    atomic_write_bytes, mkid, timestamp, AttrError, AttrValue, Run, TrackerContext,
    PENDING_FILE, REMOTE_LOCK_FILE, SOURCECODE_DIR,
};

use crate::config::{OpDef, ResourceConfig};
use crate::proc::{ProcError, ProcessSupervisor};
use crate::remote::{Remote, RemoteError};
use crate::resource::{self, ResourceError};

#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Attr(#[from] AttrError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("resolving resources: {0}")]
    ResourceResolution(#[from] ResourceError),
    #[error("no resource config for requirement {0:?}")]
    UnknownResource(String),
    #[error(transparent)]
    Process(#[from] ProcError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("run bookkeeping: {0}")]
    Io(#[from] io::Error),
}

/// Binds one operation definition to a run and drives it to
/// completion, locally or via a remote.
pub struct Operation {
    ctx: TrackerContext,
    experiment: String,
    op_name: String,
    opdef: OpDef,
    resources: BTreeMap<String, ResourceConfig>,
    run_dir: Option<PathBuf>,
    gpus: Option<String>,
    remote: Option<Box<dyn Remote>>,
    interrupted: Arc<AtomicBool>,
}

impl Operation {
    pub fn new(ctx: TrackerContext, experiment: &str, op_name: &str, opdef: OpDef) -> Self {
        Self {
            ctx,
            experiment: experiment.to_string(),
            op_name: op_name.to_string(),
            opdef,
            resources: BTreeMap::new(),
            run_dir: None,
            gpus: None,
            remote: None,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_resources(mut self, resources: BTreeMap<String, ResourceConfig>) -> Self {
        self.resources = resources;
        self
    }

    /// Caller-chosen run directory instead of a synthesized one under
    /// the experiment's runs area.
    pub fn with_run_dir(mut self, run_dir: PathBuf) -> Self {
        self.run_dir = Some(run_dir);
        self
    }

    /// GPU device list for the child; an empty string disables GPUs.
    pub fn with_gpus(mut self, gpus: &str) -> Self {
        self.gpus = Some(gpus.to_string());
        self
    }

    pub fn with_remote(mut self, remote: Box<dyn Remote>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    /// Executes the operation and returns the child's exit status
    /// verbatim; the caller decides what to do with a nonzero one.
    pub fn run(self) -> Result<i32, OperationError> {
        let run = self.init_run()?;
        self.write_initial_attrs(&run)?;
        self.capture_sourcecode(&run)?;
        self.resolve_resources(&run)?;

        let env = self.child_env();
        match &self.remote {
            Some(remote) => self.remote_proc(&run, remote.as_ref(), env),
            None => self.local_proc(&run, env),
        }
    }

    fn init_run(&self) -> Result<Run, OperationError> {
        let run = match &self.run_dir {
            Some(dir) => Run::from_dir(dir.clone()),
            None => {
                let id = mkid();
                let dir = self.ctx.experiment_runs_dir(&self.experiment).join(&id);
                Run::new(id, dir)
            }
        };
        tracing::debug!(run = %run.short_id(), path = %run.path().display(), "initializing run");
        run.init_skeleton()?;
        // Staged but not yet started.
        atomic_write_bytes(&run.tracker_path(PENDING_FILE), b"")?;
        Ok(run)
    }

    fn write_initial_attrs(&self, run: &Run) -> Result<(), OperationError> {
        run.write_attr(
            "opdef",
            &AttrValue::String(format!("{}:{}", self.experiment, self.op_name)),
        )?;
        let parameters = serde_yaml::to_value(&self.opdef.parameters)
            .unwrap_or(AttrValue::Null);
        run.write_attr("parameters", &parameters)?;
        let cmd = serde_yaml::to_value(self.resolved_cmd()).unwrap_or(AttrValue::Null);
        run.write_attr("cmd", &cmd)?;
        run.write_attr("started", &AttrValue::String(timestamp()))?;
        Ok(())
    }

    /// Snapshots the sources next to the executable into the run and
    /// records their digest.
    fn capture_sourcecode(&self, run: &Run) -> Result<(), OperationError> {
        let src_root = self.source_root();
        let dest = run.tracker_path(SOURCECODE_DIR);
        let mut select = FileSelect::new(base_sourcecode_rules());
        let copied = copytree(&src_root, &dest, &mut select)?;
        tracing::debug!(
            run = %run.short_id(),
            files = copied.len(),
            from = %src_root.display(),
            "captured sourcecode"
        );
        if let Some(digest) = files_digest(&dest)? {
            run.write_attr("sourcecode_digest", &AttrValue::String(digest))?;
        }
        Ok(())
    }

    /// Command actually supervised: tokens naming project files are
    /// rewritten to their captured copies under the run's sourcecode
    /// area, so the run executes the snapshot, not the originals. The
    /// run directory is the child's working directory, so the
    /// rewritten paths are relative.
    fn resolved_cmd(&self) -> Vec<String> {
        let src_root = self.source_root();
        self.opdef
            .cmd()
            .into_iter()
            .map(|token| {
                let candidate = self.ctx.cwd().join(&token);
                if candidate.is_file() {
                    if let Ok(rel) = candidate.strip_prefix(&src_root) {
                        return PathBuf::from(tracker_core::TRACKER_DIR)
                            .join(SOURCECODE_DIR)
                            .join(rel)
                            .display()
                            .to_string();
                    }
                }
                token
            })
            .collect()
    }

    /// Directory containing the configured executable: the first
    /// command token naming an existing file, resolved against the
    /// working directory. Falls back to the working directory itself.
    fn source_root(&self) -> PathBuf {
        for token in self.opdef.cmd() {
            let candidate = self.ctx.cwd().join(&token);
            if candidate.is_file() {
                if let Some(parent) = candidate.parent() {
                    return parent.to_path_buf();
                }
            }
        }
        self.ctx.cwd().to_path_buf()
    }

    fn resolve_resources(&self, run: &Run) -> Result<(), OperationError> {
        if self.opdef.requires.is_empty() {
            return Ok(());
        }
        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for requirement in &self.opdef.requires {
            let config = self
                .resources
                .get(requirement)
                .ok_or_else(|| OperationError::UnknownResource(requirement.clone()))?;
            let resolved = resource::resolve(requirement, config, run.path())?;
            for (name, paths) in resolved {
                deps.entry(name)
                    .or_default()
                    .extend(paths.iter().map(|p| p.display().to_string()));
            }
        }
        let value = serde_yaml::to_value(&deps).unwrap_or(AttrValue::Null);
        run.write_attr("deps", &value)?;
        Ok(())
    }

    /// Extra child environment: declared env entries, parameters as
    /// TRACKER_PARAM_* variables, and the GPU constraint.
    fn child_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .opdef
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &self.opdef.parameters {
            env.push((param_env_name(key), param_env_value(value)));
        }
        if let Some(gpus) = &self.gpus {
            env.push(("CUDA_VISIBLE_DEVICES".to_string(), gpus.clone()));
        }
        env
    }

    fn local_proc(&self, run: &Run, env: Vec<(String, String)>) -> Result<i32, OperationError> {
        run.clear_pending();
        let mut supervisor = ProcessSupervisor::new(
            run,
            self.resolved_cmd(),
            Arc::clone(&self.interrupted),
        )
        .with_env(env);
        Ok(supervisor.run()?)
    }

    /// Remote dispatch: the command is wrapped in the remote's
    /// invocation form and the wrapper process is waited on directly.
    /// A remote lock marker stands in for the local PID lock.
    fn remote_proc(
        &self,
        run: &Run,
        remote: &dyn Remote,
        env: Vec<(String, String)>,
    ) -> Result<i32, OperationError> {
        let wrapped = remote.create_cmd(&self.resolved_cmd());
        run.clear_pending();
        atomic_write_bytes(
            &run.tracker_path(REMOTE_LOCK_FILE),
            remote.name().as_bytes(),
        )?;
        tracing::info!(run = %run.short_id(), remote = remote.name(), "dispatching remotely");

        let result = Command::new(&wrapped[0])
            .args(&wrapped[1..])
            .current_dir(run.path())
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .status();
        let _ = std::fs::remove_file(run.tracker_path(REMOTE_LOCK_FILE));
        let status = result
            .map_err(|e| RemoteError::Operation(format!("dispatch failed: {}", e)))?;
        let exit_status = status.code().unwrap_or(1);
        run.write_attr(
            "exit_status.remote",
            &AttrValue::Number(exit_status.into()),
        )?;
        run.write_attr("stopped", &AttrValue::String(timestamp()))?;
        Ok(exit_status)
    }
}

fn param_env_name(key: &str) -> String {
    let upper: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("TRACKER_PARAM_{}", upper)
}

fn param_env_value(value: &AttrValue) -> String {
    match value {
        AttrValue::String(s) => s.clone(),
        AttrValue::Number(n) => n.to_string(),
        AttrValue::Bool(b) => b.to_string(),
        AttrValue::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}
