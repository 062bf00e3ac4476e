use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use tracker_core::{atomic_write_bytes, pid_alive, timestamp, AttrError, AttrValue, Run};
use tracker_core::{LOCK_FILE, OUTPUT_FILE};

/// Exit status recorded when the child survived the grace window and
/// its process tree was killed. Distinct from anything a child can
/// report on its own.
pub const FORCED_EXIT_STATUS: i32 = -15;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

const WAIT_POLL: Duration = Duration::from_millis(100);
const KILL_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("empty command")]
    EmptyCommand,
    #[error("could not start {cmd:?}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },
    #[error("opening run output file: {0}")]
    Output(#[source] io::Error),
    #[error("writing lock file: {0}")]
    Lock(#[source] io::Error),
    #[error("waiting on child: {0}")]
    Wait(#[source] io::Error),
    #[error(transparent)]
    Attr(#[from] AttrError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Running,
    Exited,
    Interrupted,
    Finalized,
}

/// Spawns and babysits exactly one child process for a run.
///
/// The lock file is written with the child PID before the wait begins,
/// so a concurrent reader sees either no lock or a lock naming a real
/// process. Interruption never drops the child: it gets the full grace
/// window to exit on its own, after which its whole process tree is
/// signalled and the forced-termination sentinel is recorded.
pub struct ProcessSupervisor<'a> {
    run: &'a Run,
    cmd: Vec<String>,
    env: Vec<(String, String)>,
    grace: Duration,
    interrupted: Arc<AtomicBool>,
    state: SupervisorState,
}

impl<'a> ProcessSupervisor<'a> {
    pub fn new(run: &'a Run, cmd: Vec<String>, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            run,
            cmd,
            env: Vec::new(),
            grace: DEFAULT_GRACE,
            interrupted,
            state: SupervisorState::NotStarted,
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Runs the child to completion and returns its exit status.
    ///
    /// A nonzero status is data, not an error; only failing to start
    /// or to bookkeep is.
    pub fn run(&mut self) -> Result<i32, ProcError> {
        self.state = SupervisorState::Starting;
        let mut child = self.spawn()?;
        let pid = child.id();
        atomic_write_bytes(
            &self.run.tracker_path(LOCK_FILE),
            pid.to_string().as_bytes(),
        )
        .map_err(ProcError::Lock)?;
        self.state = SupervisorState::Running;
        tracing::info!(run = %self.run.short_id(), pid, "child started");

        let exit_status = self.wait(&mut child)?;
        self.finalize(exit_status)?;
        Ok(exit_status)
    }

    fn spawn(&self) -> Result<Child, ProcError> {
        let program = self.cmd.first().ok_or(ProcError::EmptyCommand)?;
        let output = File::create(self.run.tracker_path(OUTPUT_FILE)).map_err(ProcError::Output)?;
        let output_err = output.try_clone().map_err(ProcError::Output)?;
        Command::new(program)
            .args(&self.cmd[1..])
            .current_dir(self.run.path())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(output_err))
            .spawn()
            .map_err(|source| ProcError::Spawn {
                cmd: program.clone(),
                source,
            })
    }

    fn wait(&mut self, child: &mut Child) -> Result<i32, ProcError> {
        loop {
            if let Some(status) = child.try_wait().map_err(ProcError::Wait)? {
                self.state = SupervisorState::Exited;
                return Ok(exit_code(status));
            }
            if self.interrupted.load(Ordering::SeqCst) {
                self.state = SupervisorState::Interrupted;
                return self.interrupt(child);
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Grace-window wait, then tree-wide escalation.
    fn interrupt(&mut self, child: &mut Child) -> Result<i32, ProcError> {
        tracing::info!(
            run = %self.run.short_id(),
            grace_secs = self.grace.as_secs(),
            "interrupted; waiting for child to exit"
        );
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait().map_err(ProcError::Wait)? {
                return Ok(exit_code(status));
            }
            std::thread::sleep(WAIT_POLL);
        }
        tracing::warn!(
            run = %self.run.short_id(),
            pid = child.id(),
            "grace window elapsed; killing process tree"
        );
        kill_process_tree(child.id());
        let _ = child.wait().map_err(ProcError::Wait)?;
        Ok(FORCED_EXIT_STATUS)
    }

    /// Removes the lock and records the outcome. An externally deleted
    /// run directory degrades this to a log line; it never fails the
    /// operation that far in.
    fn finalize(&mut self, exit_status: i32) -> Result<(), ProcError> {
        let _ = fs::remove_file(self.run.tracker_path(LOCK_FILE));
        if !self.run.path().is_dir() || !self.run.tracker_dir().is_dir() {
            tracing::warn!(
                run = %self.run.short_id(),
                "run directory removed during execution; skipping finalize"
            );
            self.state = SupervisorState::Finalized;
            return Ok(());
        }
        self.run
            .write_attr("exit_status", &AttrValue::Number(exit_status.into()))?;
        self.run
            .write_attr("stopped", &AttrValue::String(timestamp()))?;
        self.state = SupervisorState::Finalized;
        Ok(())
    }
}

/// Exit code for a wait status: the real code when there is one, the
/// negated signal number when the child died to a signal.
fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(0),
    }
}

/// Signals the whole tree rooted at `root`: SIGTERM to every
/// descendant and the root, a short settle, then SIGKILL to survivors.
pub fn kill_process_tree(root: u32) {
    let mut targets = descendants(root);
    targets.push(root);
    for &pid in &targets {
        signal(pid, libc::SIGTERM);
    }
    std::thread::sleep(KILL_SETTLE);
    for &pid in &targets {
        if pid_alive(pid) {
            tracing::debug!(pid, "escalating to SIGKILL");
            signal(pid, libc::SIGKILL);
        }
    }
}

fn signal(pid: u32, sig: i32) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

/// All live descendant PIDs of `root`, found by walking the parent
/// links in /proc.
fn descendants(root: u32) -> Vec<u32> {
    let mut by_parent: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    if let Ok(entries) = fs::read_dir("/proc") {
        for entry in entries.filter_map(|e| e.ok()) {
            let pid: u32 = match entry.file_name().to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue,
            };
            if let Some(ppid) = stat_ppid(&entry.path()) {
                by_parent.entry(ppid).or_default().push(pid);
            }
        }
    }
    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        if let Some(children) = by_parent.get(&pid) {
            for &child in children {
                found.push(child);
                frontier.push(child);
            }
        }
    }
    found
}

/// Parent of a live process, from /proc.
pub fn parent_pid(pid: u32) -> Option<u32> {
    stat_ppid(Path::new(&format!("/proc/{}", pid)))
}

/// Parent PID from /proc/<pid>/stat. The comm field may contain
/// spaces and parentheses, so fields are taken after the last ')'.
fn stat_ppid(proc_dir: &Path) -> Option<u32> {
    let stat = fs::read_to_string(proc_dir.join("stat")).ok()?;
    let after_comm = stat.rsplit(')').next()?;
    let mut fields = after_comm.split_whitespace();
    fields.next();
    fields.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;
    use tracker_core::{mkid, RunStatus};

    fn temp_run(tag: &str) -> (PathBuf, Run) {
        let root = std::env::temp_dir().join(format!(
            "tracker_proc_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let id = mkid();
        let run = Run::new(id.clone(), root.join(&id));
        fs::create_dir_all(run.path()).expect("run dir");
        run.init_skeleton().expect("skeleton");
        (root, run)
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn flag(raised: bool) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(raised))
    }

    #[test]
    fn clean_exit_records_status_and_clears_lock() {
        let (root, run) = temp_run("clean");
        let mut sup = ProcessSupervisor::new(&run, sh("exit 0"), flag(false));
        let exit_status = sup.run().expect("run");
        assert_eq!(exit_status, 0);
        assert_eq!(sup.state(), SupervisorState::Finalized);
        assert!(!run.tracker_path(LOCK_FILE).exists());
        assert_eq!(run.status(), RunStatus::Completed);
        assert!(run.has_attr("stopped"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn nonzero_exit_is_data_not_an_error() {
        let (root, run) = temp_run("nonzero");
        let mut sup = ProcessSupervisor::new(&run, sh("exit 7"), flag(false));
        assert_eq!(sup.run().expect("run"), 7);
        assert!(!run.tracker_path(LOCK_FILE).exists());
        assert_eq!(run.status(), RunStatus::Error);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn child_output_lands_in_the_output_file() {
        let (root, run) = temp_run("output");
        let mut sup =
            ProcessSupervisor::new(&run, sh("echo out; echo err >&2"), flag(false));
        sup.run().expect("run");
        let output = fs::read_to_string(run.tracker_path(OUTPUT_FILE)).expect("output");
        assert!(output.contains("out"));
        assert!(output.contains("err"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn spawn_failure_is_fatal_and_leaves_no_lock() {
        let (root, run) = temp_run("nospawn");
        let cmd = vec!["/definitely/not/a/binary".to_string()];
        let mut sup = ProcessSupervisor::new(&run, cmd, flag(false));
        match sup.run() {
            Err(ProcError::Spawn { cmd, .. }) => {
                assert_eq!(cmd, "/definitely/not/a/binary")
            }
            other => panic!("expected Spawn error, got {:?}", other),
        }
        assert!(!run.tracker_path(LOCK_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn interrupt_uses_real_code_when_child_exits_in_grace() {
        let (root, run) = temp_run("graceful");
        let mut sup = ProcessSupervisor::new(&run, sh("sleep 0.3"), flag(true))
            .with_grace(Duration::from_secs(5));
        assert_eq!(sup.run().expect("run"), 0);
        assert_eq!(run.status(), RunStatus::Completed);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn interrupt_escalates_after_grace_and_records_sentinel() {
        let (root, run) = temp_run("forced");
        let mut sup = ProcessSupervisor::new(&run, sh("sleep 30"), flag(true))
            .with_grace(Duration::from_millis(200));
        assert_eq!(sup.run().expect("run"), FORCED_EXIT_STATUS);
        assert!(!run.tracker_path(LOCK_FILE).exists());
        assert_eq!(run.status(), RunStatus::Terminated);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn deleted_run_directory_degrades_finalize() {
        let (root, run) = temp_run("degraded");
        // The child removes its own metadata directory.
        let mut sup = ProcessSupervisor::new(&run, sh("rm -rf .tracker"), flag(false));
        assert_eq!(sup.run().expect("run"), 0);
        assert!(!run.has_attr("exit_status"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn exit_code_negates_fatal_signals() {
        let (root, run) = temp_run("signal");
        let mut sup = ProcessSupervisor::new(&run, sh("kill -9 $$"), flag(false));
        assert_eq!(sup.run().expect("run"), -9);
        assert_eq!(run.status(), RunStatus::Terminated);
        let _ = fs::remove_dir_all(root);
    }
}
