//! Error types and Result aliases for fwpilot

use std::path::PathBuf;

/// Result type alias for fwpilot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fwpilot
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // === Session errors ===
    /// Host did not answer any liveness probe; no credentials were sent
    #[error("Unable to reach host {host} after {probes} probe attempt(s)")]
    Connection { host: String, probes: u32 },

    /// Login was rejected on every attempt of the budget
    #[error("Authentication to {host} failed after {attempts} attempt(s)")]
    Auth { host: String, attempts: u32 },

    /// The underlying transport broke while a session was in use
    #[error("Session fault: {reason}")]
    SessionFault { reason: String },

    /// Operation attempted on a session that is no longer connected
    #[error("Session is closed")]
    SessionClosed,

    /// Failed to open a pseudoterminal for the remote shell client
    #[error("Failed to create PTY for '{program}': {reason}")]
    PtyCreationFailed { program: String, reason: String },

    /// Failed to spawn the remote shell client inside the PTY
    #[error("Failed to spawn '{program}': {reason}")]
    PtySpawnFailed { program: String, reason: String },

    /// PTY reader/writer plumbing failed
    #[error("PTY I/O failure: {reason}")]
    PtyIo { reason: String },

    // === Transaction errors ===
    /// A transaction exhausted its attempt budget without a pattern match
    #[error("Timed out waiting on '{command}' after {retries} retries")]
    Timeout {
        command: String,
        retries: u32,
        partial: String,
    },

    /// The wait was aborted through the session's cancellation token
    #[error("Transaction '{command}' was cancelled")]
    Cancelled { command: String },

    // === Policy and decision errors ===
    /// Component or version absent from the policy registry
    #[error("Policy configuration error: {reason}")]
    Config { reason: String },

    /// The preferred version cannot be reached directly from the detected one
    #[error("Update of {identity} from {current} to {target} is blocked by a conflict rule")]
    ConflictBlocked {
        identity: String,
        current: String,
        target: String,
    },

    /// Forced update targets a part that is not the one installed
    #[error("Model {model} expects part {expected} but detected {detected}")]
    Mismatch {
        model: String,
        expected: String,
        detected: String,
    },

    /// Failed to read a configuration or policy file
    #[error("Failed to load config from '{}': {reason}", .path.display())]
    ConfigLoadFailed { path: PathBuf, reason: String },

    /// Failed to parse a configuration or policy file
    #[error("Failed to parse {format} config: {reason}")]
    ConfigParseFailed { format: String, reason: String },

    /// Configuration values out of range
    #[error("Configuration validation failed for '{field}': {reason}")]
    ConfigValidationFailed { field: String, reason: String },

    // === Apply errors ===
    /// Vendor tool failure, missing artifact, or repeated reboot request.
    /// `step` is `None` when the failure happened before the first apply step.
    #[error("Apply failed{}: {reason}", step_suffix(.step))]
    Apply {
        step: Option<usize>,
        reason: String,
        completed: Vec<String>,
        skipped: Vec<String>,
    },

    /// The collector could not extract an identity or version
    #[error("Detection failed: {reason}")]
    Detection { reason: String },

    // === I/O and serialization errors ===
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Regex compilation errors
    #[error("Regex compilation error: {0}")]
    Regex(#[from] regex::Error),
}

fn step_suffix(step: &Option<usize>) -> String {
    step.map(|s| format!(" at step {}", s)).unwrap_or_default()
}

impl Error {
    /// Shorthand for a policy lookup miss
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }

    /// Timeouts are the only error a caller may reasonably recover from
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Timeout { .. })
    }

    /// Errors that mean the session can no longer be used
    pub fn is_session_fault(&self) -> bool {
        matches!(
            self,
            Error::SessionFault { .. } | Error::SessionClosed | Error::PtyIo { .. }
        )
    }

    /// Process exit code for a run that ended with this error
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Buffer captured before a timeout, if any
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Error::Timeout { partial, .. } => Some(partial),
            _ => None,
        }
    }
}
