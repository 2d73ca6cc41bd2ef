use crate::supervisor::SupervisorSettings;
use crate::worker::{WorkerKind, WorkerSpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from panel.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct PanelConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub project: ProjectConfig,
    pub supervisor: SupervisorConfig,
    pub workers: WorkersConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

/// Operator credentials for the login form.
#[derive(Debug, Deserialize)]
#[cfg_attr(not(feature = "serve"), allow(dead_code))]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Directory the bots run from; relative script and db paths resolve here.
    pub root: PathBuf,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub db_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub stop_timeout_secs: u64,
    pub restart_settle_secs: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub twitch: WorkerConfig,
    pub discord: WorkerConfig,
}

/// Overrides for one worker; unset fields fall back to the stock install.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Launch script, relative to the project root.
    pub script: Option<PathBuf>,
    pub display_name: Option<String>,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            interpreter: "python3".to_string(),
            interpreter_args: Vec::new(),
            db_path: PathBuf::from("data/users.db"),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 5,
            restart_settle_secs: 2,
            poll_interval_secs: 5,
        }
    }
}

/// Script and display name of `kind` in a stock install.
fn stock_worker(kind: WorkerKind) -> (&'static str, &'static str) {
    match kind {
        WorkerKind::ChatBot => ("core/testBot.py", "Twitch Bot"),
        WorkerKind::MessagingBot => ("core/discord_bot_standalone.py", "Discord Bot"),
    }
}

impl PanelConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn worker(&self, kind: WorkerKind) -> &WorkerConfig {
        match kind {
            WorkerKind::ChatBot => &self.workers.twitch,
            WorkerKind::MessagingBot => &self.workers.discord,
        }
    }

    /// Launch spec for `kind`, with paths resolved against the project root.
    pub fn worker_spec(&self, kind: WorkerKind) -> WorkerSpec {
        let worker = self.worker(kind);
        let (stock_script, stock_name) = stock_worker(kind);
        let script = worker
            .script
            .clone()
            .unwrap_or_else(|| PathBuf::from(stock_script));
        WorkerSpec {
            display_name: worker
                .display_name
                .clone()
                .unwrap_or_else(|| stock_name.to_string()),
            interpreter: self.project.interpreter.clone(),
            interpreter_args: self.project.interpreter_args.clone(),
            script: self.project.root.join(script),
            working_dir: self.project.root.clone(),
        }
    }

    #[cfg(feature = "serve")]
    pub fn db_path(&self) -> PathBuf {
        self.project.root.join(&self.project.db_path)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            stop_timeout: Duration::from_secs(self.supervisor.stop_timeout_secs),
            restart_settle: Duration::from_secs(self.supervisor.restart_settle_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        // tokio intervals panic on a zero period.
        Duration::from_secs(self.supervisor.poll_interval_secs.max(1))
    }
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}
