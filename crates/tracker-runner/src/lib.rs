//! Operation orchestration: configuration loading, resource
//! resolution, remote dispatch, and the process supervisor.

pub mod config;
pub mod operation;
pub mod proc;
pub mod remote;
pub mod resource;

pub use config::{
    ConfigError, ExperimentDef, OpDef, ProjectConfig, RemoteSpec, ResourceConfig,
    ResourceSource, load_experiment,
};
pub use operation::{Operation, OperationError};
pub use proc::{
    kill_process_tree, parent_pid, ProcError, ProcessSupervisor, SupervisorState,
    DEFAULT_GRACE, FORCED_EXIT_STATUS,
};
pub use remote::{Remote, RemoteError, RemoteRegistry, SshRemote};
pub use resource::{resolve, ResourceError};
