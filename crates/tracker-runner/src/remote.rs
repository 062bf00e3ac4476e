use std::collections::BTreeMap;
use std::process::Command;
use thiserror::Error;

use crate::config::{ProjectConfig, RemoteSpec};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote {0:?} is not defined")]
    NoSuchRemote(String),
    #[error("remote {name:?} has unsupported type {remote_type:?}")]
    UnsupportedType { name: String, remote_type: String },
    #[error("remote {name:?} is missing required config: {key}")]
    MissingConfig { name: String, key: String },
    #[error("{op} is not supported for {remote_type} remotes")]
    NotSupported { op: String, remote_type: String },
    #[error("remote {0:?} is not available")]
    Down(String),
    #[error("remote operation failed: {0}")]
    Operation(String),
}

/// A dispatch target capable of running an operation off-host.
///
/// `create_cmd` wraps an already-resolved argument vector in the
/// remote's invocation form; the wrapped vector is then spawned
/// locally like any other command.
pub trait Remote {
    fn name(&self) -> &str;
    fn remote_type(&self) -> &str;
    fn status(&self) -> Result<(), RemoteError>;
    fn start(&self) -> Result<(), RemoteError>;
    fn stop(&self) -> Result<(), RemoteError>;
    fn create_cmd(&self, cmd: &[String]) -> Vec<String>;
}

type RemoteCtor = fn(&str, &RemoteSpec) -> Result<Box<dyn Remote>, RemoteError>;

/// Maps a remote type tag to its constructor. New remote kinds are
/// added by registering, never by branching on type strings at call
/// sites.
pub struct RemoteRegistry {
    ctors: BTreeMap<String, RemoteCtor>,
}

impl RemoteRegistry {
    pub fn empty() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, remote_type: &str, ctor: RemoteCtor) {
        self.ctors.insert(remote_type.to_string(), ctor);
    }

    /// Builds a remote from its project-config declaration.
    pub fn for_name(
        &self,
        name: &str,
        config: &ProjectConfig,
    ) -> Result<Box<dyn Remote>, RemoteError> {
        let spec = config
            .remotes
            .get(name)
            .ok_or_else(|| RemoteError::NoSuchRemote(name.to_string()))?;
        let ctor =
            self.ctors
                .get(&spec.remote_type)
                .ok_or_else(|| RemoteError::UnsupportedType {
                    name: name.to_string(),
                    remote_type: spec.remote_type.clone(),
                })?;
        ctor(name, spec)
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("ssh", SshRemote::from_spec);
        registry
    }
}

/// Remote reachable over plain ssh. Commands are wrapped as an `ssh`
/// invocation against the configured host.
pub struct SshRemote {
    name: String,
    host: String,
    port: Option<u16>,
    user: Option<String>,
    private_key: Option<std::path::PathBuf>,
    connect_timeout: Option<u64>,
}

impl SshRemote {
    fn from_spec(name: &str, spec: &RemoteSpec) -> Result<Box<dyn Remote>, RemoteError> {
        let host = spec
            .host
            .clone()
            .ok_or_else(|| RemoteError::MissingConfig {
                name: name.to_string(),
                key: "host".to_string(),
            })?;
        Ok(Box::new(Self {
            name: name.to_string(),
            host,
            port: spec.port,
            user: spec.user.clone(),
            private_key: spec.private_key.clone(),
            connect_timeout: spec.connect_timeout,
        }))
    }

    fn address(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn ssh_base(&self) -> Vec<String> {
        let mut cmd = vec!["ssh".to_string()];
        if let Some(port) = self.port {
            cmd.push("-p".to_string());
            cmd.push(port.to_string());
        }
        if let Some(key) = &self.private_key {
            cmd.push("-i".to_string());
            cmd.push(key.display().to_string());
        }
        if let Some(timeout) = self.connect_timeout {
            cmd.push("-o".to_string());
            cmd.push(format!("ConnectTimeout={}", timeout));
        }
        cmd.push(self.address());
        cmd
    }
}

impl Remote for SshRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn remote_type(&self) -> &str {
        "ssh"
    }

    /// Pings the host with a no-op command.
    fn status(&self) -> Result<(), RemoteError> {
        let mut cmd = self.ssh_base();
        cmd.push("true".to_string());
        tracing::debug!(remote = %self.name, "pinging remote");
        let status = Command::new(&cmd[0])
            .args(&cmd[1..])
            .status()
            .map_err(|e| RemoteError::Operation(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(RemoteError::Down(self.name.clone()))
        }
    }

    fn start(&self) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported {
            op: "start".to_string(),
            remote_type: "ssh".to_string(),
        })
    }

    fn stop(&self) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported {
            op: "stop".to_string(),
            remote_type: "ssh".to_string(),
        })
    }

    fn create_cmd(&self, cmd: &[String]) -> Vec<String> {
        let mut wrapped = self.ssh_base();
        wrapped.push(cmd.join(" "));
        wrapped
    }
}
