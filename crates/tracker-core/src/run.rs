use crate::attr::{AttrError, AttrStore, AttrValue};
use crate::fsutil::{ensure_dir, timestamp, try_read_to_string};
use crate::pid::pid_alive;
use rand::RngCore;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const TRACKER_DIR: &str = ".tracker";
pub const LOCK_FILE: &str = "LOCK";
pub const REMOTE_LOCK_FILE: &str = "LOCK.remote";
pub const PENDING_FILE: &str = "PENDING";
pub const OUTPUT_FILE: &str = "output";
pub const SOURCECODE_DIR: &str = "sourcecode";

/// Generates a fresh run identifier: 128 random bits, hex-encoded
/// (32 characters).
pub fn mkid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Run status, derived from disk on every query, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Terminated,
    Error,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Terminated => "terminated",
            RunStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One tracked execution: an identifier plus the directory backing it.
///
/// Everything about a run is reconstructable from that directory; a
/// `Run` value holds no state a crash could lose.
#[derive(Debug, Clone)]
pub struct Run {
    id: String,
    path: PathBuf,
}

impl Run {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// Addresses an existing run directory, taking the directory name
    /// as the run id.
    pub fn from_dir(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        Self { id, path }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tracker_dir(&self) -> PathBuf {
        self.path.join(TRACKER_DIR)
    }

    pub fn tracker_path(&self, subpath: &str) -> PathBuf {
        self.tracker_dir().join(subpath)
    }

    pub fn attrs(&self) -> AttrStore {
        AttrStore::new(self.tracker_path("attrs"))
    }

    /// PID recorded in the lock file, if one is present and parses.
    pub fn pid(&self) -> Option<u32> {
        let raw = try_read_to_string(&self.tracker_path(LOCK_FILE))?;
        raw.trim().parse().ok()
    }

    /// Name of the remote holding this run, from the remote lock
    /// marker.
    pub fn remote(&self) -> Option<String> {
        try_read_to_string(&self.tracker_path(REMOTE_LOCK_FILE)).map(|s| s.trim().to_string())
    }

    /// Derives status from the lock files, the pending marker, the
    /// exit-status attributes, and OS process liveness. Remote markers
    /// win over the pending marker, which wins over local state.
    pub fn status(&self) -> RunStatus {
        if self.tracker_path(REMOTE_LOCK_FILE).exists() {
            return RunStatus::Running;
        }
        if self.tracker_path(PENDING_FILE).exists() {
            return RunStatus::Pending;
        }
        if self.has_attr("exit_status.remote") {
            return self.remote_exit_status();
        }
        self.local_status()
    }

    fn remote_exit_status(&self) -> RunStatus {
        match self.exit_status_attr("exit_status.remote") {
            Some(0) => RunStatus::Completed,
            Some(2) => RunStatus::Terminated,
            _ => RunStatus::Error,
        }
    }

    fn local_status(&self) -> RunStatus {
        match self.pid() {
            None => match self.exit_status_attr("exit_status") {
                None => RunStatus::Error,
                Some(0) => RunStatus::Completed,
                Some(code) if code < 0 => RunStatus::Terminated,
                Some(_) => RunStatus::Error,
            },
            Some(pid) if pid_alive(pid) => RunStatus::Running,
            Some(_) => RunStatus::Terminated,
        }
    }

    fn exit_status_attr(&self, name: &str) -> Option<i64> {
        self.get_attr(name)?.as_i64()
    }

    /// Timestamp for display: `started`, falling back to
    /// `initialized`.
    pub fn timestamp(&self) -> Option<String> {
        for name in ["started", "initialized"] {
            if let Some(value) = self.get_attr(name) {
                if let Some(s) = value.as_str() {
                    return Some(s.to_string());
                }
            }
        }
        None
    }

    /// Creates the on-disk skeleton. Idempotent: `id` and
    /// `initialized` are stamped only on first initialization so a
    /// retried operation cannot re-stamp a run that already started.
    pub fn init_skeleton(&self) -> Result<(), AttrError> {
        ensure_dir(&self.tracker_path("attrs")).map_err(|source| AttrError::Io {
            name: "attrs".to_string(),
            source,
        })?;
        if !self.has_attr("initialized") {
            self.write_attr("id", &AttrValue::String(self.id.clone()))?;
            self.write_attr("initialized", &AttrValue::String(timestamp()))?;
        }
        Ok(())
    }

    pub fn write_attr(&self, name: &str, value: &AttrValue) -> Result<(), AttrError> {
        self.attrs().write(name, value)
    }

    pub fn get_attr(&self, name: &str) -> Option<AttrValue> {
        self.attrs().read(name).ok()
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs().exists(name)
    }

    pub fn del_attr(&self, name: &str) {
        self.attrs().delete(name)
    }

    pub fn attr_names(&self) -> Vec<String> {
        self.attrs().names()
    }

    /// Paths under the run directory, skipping the metadata directory
    /// unless asked for. Used by diff/compare tooling, not by the
    /// operation itself.
    pub fn iter_files(&self, include_metadata: bool) -> Vec<PathBuf> {
        WalkDir::new(&self.path)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                include_metadata
                    || e.depth() != 1
                    || e.file_name().to_str() != Some(TRACKER_DIR)
            })
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .collect()
    }

    /// Paths relative to a metadata subdirectory, e.g. `sourcecode`.
    pub fn iter_tracker_files(&self, subpath: &str) -> Vec<PathBuf> {
        let root = self.tracker_path(subpath);
        if !root.exists() {
            return Vec::new();
        }
        WalkDir::new(&root)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.path().strip_prefix(&root).ok().map(Path::to_path_buf))
            .collect()
    }

    /// Best-effort removal of the pending marker.
    pub fn clear_pending(&self) {
        let _ = fs::remove_file(self.tracker_path(PENDING_FILE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_run(tag: &str) -> (PathBuf, Run) {
        let root = std::env::temp_dir().join(format!(
            "tracker_run_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        let id = mkid();
        let run = Run::new(id.clone(), root.join(&id));
        (root, run)
    }

    fn write_exit_status(run: &Run, code: i64) {
        run.write_attr("exit_status", &AttrValue::Number(code.into()))
            .expect("exit_status");
    }

    #[test]
    fn mkid_is_32_hex_chars() {
        let id = mkid();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, mkid());
    }

    #[test]
    fn short_id_is_first_eight() {
        let run = Run::new("0123456789abcdef0123456789abcdef", "/tmp/x");
        assert_eq!(run.short_id(), "01234567");
    }

    #[test]
    fn init_skeleton_is_idempotent() {
        let (root, run) = temp_run("skel");
        run.init_skeleton().expect("first init");
        let first = run
            .get_attr("initialized")
            .expect("initialized attr")
            .as_str()
            .unwrap()
            .to_string();
        run.init_skeleton().expect("second init");
        let second = run.get_attr("initialized").unwrap();
        assert_eq!(second.as_str().unwrap(), first);
        assert_eq!(run.get_attr("id").unwrap().as_str().unwrap(), run.id());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn status_with_nothing_on_disk_is_error() {
        let (root, run) = temp_run("bare");
        run.init_skeleton().expect("init");
        assert_eq!(run.status(), RunStatus::Error);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn status_from_exit_status_attribute() {
        let (root, run) = temp_run("exit");
        run.init_skeleton().expect("init");
        write_exit_status(&run, 0);
        assert_eq!(run.status(), RunStatus::Completed);
        write_exit_status(&run, -15);
        assert_eq!(run.status(), RunStatus::Terminated);
        write_exit_status(&run, 3);
        assert_eq!(run.status(), RunStatus::Error);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn pending_marker_wins_over_exit_status() {
        let (root, run) = temp_run("pending");
        run.init_skeleton().expect("init");
        write_exit_status(&run, 0);
        fs::write(run.tracker_path(PENDING_FILE), b"").expect("pending");
        assert_eq!(run.status(), RunStatus::Pending);
        run.clear_pending();
        assert_eq!(run.status(), RunStatus::Completed);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn live_lock_pid_means_running() {
        let (root, run) = temp_run("lock");
        run.init_skeleton().expect("init");
        fs::write(
            run.tracker_path(LOCK_FILE),
            std::process::id().to_string(),
        )
        .expect("lock");
        assert_eq!(run.pid(), Some(std::process::id()));
        assert_eq!(run.status(), RunStatus::Running);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn stale_lock_pid_means_terminated() {
        let (root, run) = temp_run("stale");
        run.init_skeleton().expect("init");
        // PIDs near the u32 max are not valid on Linux.
        fs::write(run.tracker_path(LOCK_FILE), "4294967294").expect("lock");
        assert_eq!(run.status(), RunStatus::Terminated);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remote_lock_forces_running() {
        let (root, run) = temp_run("remote");
        run.init_skeleton().expect("init");
        write_exit_status(&run, 1);
        fs::write(run.tracker_path(REMOTE_LOCK_FILE), "dtu-cluster\n").expect("remote lock");
        assert_eq!(run.status(), RunStatus::Running);
        assert_eq!(run.remote().as_deref(), Some("dtu-cluster"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remote_exit_status_classification() {
        let (root, run) = temp_run("remote_exit");
        run.init_skeleton().expect("init");
        run.write_attr("exit_status.remote", &AttrValue::Number(2.into()))
            .expect("remote exit");
        assert_eq!(run.status(), RunStatus::Terminated);
        run.write_attr("exit_status.remote", &AttrValue::Number(0.into()))
            .expect("remote exit");
        assert_eq!(run.status(), RunStatus::Completed);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn timestamp_prefers_started() {
        let (root, run) = temp_run("ts");
        run.init_skeleton().expect("init");
        assert_eq!(
            run.timestamp(),
            run.get_attr("initialized")
                .and_then(|v| v.as_str().map(String::from))
        );
        run.write_attr("started", &AttrValue::String("2026-01-01T00:00:00Z".into()))
            .expect("started");
        assert_eq!(run.timestamp().as_deref(), Some("2026-01-01T00:00:00Z"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn iter_files_skips_metadata_by_default() {
        let (root, run) = temp_run("iter");
        run.init_skeleton().expect("init");
        fs::write(run.path().join("result.txt"), b"42").expect("result");
        let visible = run.iter_files(false);
        assert!(visible.iter().all(|p| !p.ends_with(TRACKER_DIR)
            && !p.components().any(|c| c.as_os_str() == TRACKER_DIR)));
        assert!(visible.iter().any(|p| p.ends_with("result.txt")));
        let all = run.iter_files(true);
        assert!(all
            .iter()
            .any(|p| p.components().any(|c| c.as_os_str() == TRACKER_DIR)));
        let _ = fs::remove_dir_all(root);
    }
}
