use std::path::{Path, PathBuf};

/// Explicit execution context threaded into Operation and Run
/// construction. Built once at the CLI boundary; the core never reads
/// the process environment or the current directory on its own.
#[derive(Debug, Clone)]
pub struct TrackerContext {
    cwd: PathBuf,
    tracker_home: PathBuf,
}

impl TrackerContext {
    pub fn new(cwd: PathBuf, tracker_home: PathBuf) -> Self {
        Self { cwd, tracker_home }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn tracker_home(&self) -> &Path {
        &self.tracker_home
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.tracker_home.join("runs")
    }

    pub fn experiments_dir(&self) -> PathBuf {
        self.tracker_home.join("experiments")
    }

    pub fn experiment_runs_dir(&self, experiment: &str) -> PathBuf {
        self.experiments_dir().join(experiment)
    }

    /// Project config path: `tracker.yaml` in the working directory if
    /// present, otherwise the user-level file under the tracker home.
    pub fn config_path(&self) -> PathBuf {
        let local = self.cwd.join("tracker.yaml");
        if local.is_file() {
            local
        } else {
            self.tracker_home.join("tracker.yaml")
        }
    }
}
