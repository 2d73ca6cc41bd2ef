/// Worker identities supervised by the panel.
///
/// The set is fixed: one chat-platform bot and one messaging-platform bot.
/// Each kind has a stable slug used in URLs, JSON payloads and config keys.
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum WorkerKind {
    #[serde(rename = "twitch")]
    ChatBot,
    #[serde(rename = "discord")]
    MessagingBot,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 2] = [WorkerKind::ChatBot, WorkerKind::MessagingBot];

    /// Stable slug (`"twitch"`, `"discord"`).
    pub fn slug(self) -> &'static str {
        match self {
            WorkerKind::ChatBot => "twitch",
            WorkerKind::MessagingBot => "discord",
        }
    }

    /// Position in [`WorkerKind::ALL`]; used to index per-kind slots.
    pub fn index(self) -> usize {
        match self {
            WorkerKind::ChatBot => 0,
            WorkerKind::MessagingBot => 1,
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// Returned when a slug does not name a known worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownWorker(pub String);

impl std::fmt::Display for UnknownWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown worker type: {}", self.0)
    }
}

impl std::error::Error for UnknownWorker {}

impl FromStr for WorkerKind {
    type Err = UnknownWorker;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "twitch" => Ok(WorkerKind::ChatBot),
            "discord" => Ok(WorkerKind::MessagingBot),
            other => Err(UnknownWorker(other.to_string())),
        }
    }
}

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub display_name: String,
    /// Program that runs the script (e.g. `python3`).
    pub interpreter: String,
    /// Arguments placed between the interpreter and the script path.
    pub interpreter_args: Vec<String>,
    pub script: PathBuf,
    pub working_dir: PathBuf,
}
