//! Session configuration and per-target setup strategies

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// GDB configuration
#[derive(Debug, Clone)]
pub struct GdbConfig {
    pub gdb_path: String,
    /// Program to debug; its directory becomes GDB's working directory
    pub elf_file: PathBuf,
    pub gdb_args: Vec<String>,
    /// Negotiate `mi-async`, allowing commands while the target runs
    pub async_mode: bool,
    pub architecture: Option<String>,
    pub command_timeout: Duration,
    /// How long to wait for the first line of output after spawning
    pub ready_timeout: Duration,
    pub quit_timeout: Duration,
    pub pause_attempts: u32,
    pub pause_interval: Duration,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            gdb_path: "gdb".to_string(),
            elf_file: PathBuf::new(),
            gdb_args: vec!["--interpreter=mi".to_string()],
            async_mode: false,
            architecture: None,
            command_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(5),
            quit_timeout: Duration::from_millis(500),
            pause_attempts: 3,
            pause_interval: Duration::from_millis(500),
        }
    }
}

impl GdbConfig {
    pub fn new(gdb_path: impl Into<String>, elf_file: impl Into<PathBuf>) -> Self {
        Self {
            gdb_path: gdb_path.into(),
            elf_file: elf_file.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `GDB_PATH`, `GDB_TIMEOUT_MS` and `GDB_ASYNC`
    pub fn from_env(elf_file: impl Into<PathBuf>) -> Self {
        let defaults = Self::default();

        let gdb_path = std::env::var("GDB_PATH").unwrap_or(defaults.gdb_path.clone());

        let command_timeout = std::env::var("GDB_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.command_timeout);

        let async_mode = std::env::var("GDB_ASYNC")
            .map(|v| matches!(v.as_str(), "1" | "true" | "on"))
            .unwrap_or(defaults.async_mode);

        Self {
            gdb_path,
            elf_file: elf_file.into(),
            command_timeout,
            async_mode,
            ..defaults
        }
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.elf_file.parent()
    }

    /// Name GDB is given, relative to the working directory
    pub fn elf_name(&self) -> Option<String> {
        self.elf_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Remote target configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteTargetConfig {
    Tcp { host: String, port: u16 },
    Serial {
        port: String,
        #[serde(default)]
        baud_rate: Option<u32>,
    },
}

impl RemoteTargetConfig {
    pub fn to_target_string(&self) -> String {
        match self {
            RemoteTargetConfig::Tcp { host, port } => format!("{}:{}", host, port),
            RemoteTargetConfig::Serial { port, .. } => port.clone(),
        }
    }
}

/// Per-target launch parameters and warm-up commands.
///
/// Implementations supply what differs between debugger flavors; the
/// session runs the common warm-up first and then `setup_commands`.
pub trait SessionSetup: Send + Sync {
    fn launch_args(&self, config: &GdbConfig) -> Vec<String> {
        let mut args = config.gdb_args.clone();
        args.extend(config.elf_name());
        args
    }

    fn setup_commands(&self, _config: &GdbConfig) -> Vec<String> {
        Vec::new()
    }
}

/// Debug a program on the host
#[derive(Debug, Clone, Default)]
pub struct LocalTarget;

impl SessionSetup for LocalTarget {}

/// Attach to a gdbserver, QEMU stub or serial probe
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub remote: RemoteTargetConfig,
    pub extended: bool,
}

impl SessionSetup for RemoteTarget {
    fn setup_commands(&self, _config: &GdbConfig) -> Vec<String> {
        let mut commands = Vec::new();
        if let RemoteTargetConfig::Serial {
            baud_rate: Some(baud),
            ..
        } = &self.remote
        {
            commands.push(format!("-gdb-set serial baud {}", baud));
        }
        let mode = if self.extended { "extended-remote" } else { "remote" };
        commands.push(format!(
            "-target-select {} {}",
            mode,
            self.remote.to_target_string()
        ));
        commands
    }
}
