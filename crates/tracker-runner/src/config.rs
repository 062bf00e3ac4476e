use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracker_core::TrackerContext;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no project config found at {0}")]
    NotFound(PathBuf),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no experiment named {0:?} in project config")]
    NoSuchExperiment(String),
    #[error("no operation named {op:?} in experiment {experiment:?}")]
    NoSuchOperation { experiment: String, op: String },
}

/// Project-level `tracker.yaml`: experiment names mapped to their
/// definition files, plus the remote host declarations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub experiments: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteSpec>,
}

/// One configured remote host.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSpec {
    #[serde(rename = "type")]
    pub remote_type: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, rename = "private-key")]
    pub private_key: Option<PathBuf>,
    #[serde(default, rename = "connect-timeout")]
    pub connect_timeout: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// An experiment definition file: a list of experiments, each naming
/// its operations and optional shared resource declarations.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentDef {
    pub experiment: String,
    #[serde(default)]
    pub operations: BTreeMap<String, OpDef>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceConfig>,
}

/// One runnable operation: the command to supervise plus its declared
/// parameters, resource requirements, and environment.
#[derive(Debug, Clone, Deserialize)]
pub struct OpDef {
    pub exec: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub remote: Option<String>,
}

impl OpDef {
    /// Argument vector for the supervisor. The command is split on
    /// whitespace; no shell interpretation happens downstream.
    pub fn cmd(&self) -> Vec<String> {
        self.exec.split_whitespace().map(str::to_string).collect()
    }
}

/// Resource requirement body: downloadable sources resolved before
/// the process starts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceConfig {
    #[serde(default)]
    pub sources: Vec<ResourceSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSource {
    pub url: String,
    pub select: String,
    pub output: PathBuf,
}

impl ProjectConfig {
    /// Loads the project config resolved by the context, treating a
    /// missing file as an error (every command here needs one).
    pub fn load(ctx: &TrackerContext) -> Result<Self, ConfigError> {
        let path = ctx.config_path();
        if !path.is_file() {
            return Err(ConfigError::NotFound(path));
        }
        parse_yaml_file(&path)
    }

    pub fn experiment_file(&self, name: &str) -> Result<&Path, ConfigError> {
        self.experiments
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| ConfigError::NoSuchExperiment(name.to_string()))
    }
}

/// Loads an experiment file and picks out one experiment's entry.
pub fn load_experiment(path: &Path, name: &str) -> Result<ExperimentDef, ConfigError> {
    let defs: Vec<ExperimentDef> = parse_yaml_file(path)?;
    defs.into_iter()
        .find(|d| d.experiment == name)
        .ok_or_else(|| ConfigError::NoSuchExperiment(name.to_string()))
}

impl ExperimentDef {
    pub fn operation(&self, name: &str) -> Result<&OpDef, ConfigError> {
        self.operations
            .get(name)
            .ok_or_else(|| ConfigError::NoSuchOperation {
                experiment: self.experiment.clone(),
                op: name.to_string(),
            })
    }
}

fn parse_yaml_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
