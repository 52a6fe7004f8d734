//! Error types shared across loopvault crates.

use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Configuration file missing, unreadable, or failing validation.
    /// Fatal at start-up; there is no fallback configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The loop-device query could not be run or its output could not be
    /// parsed. Fatal to the operation in progress; no partial state can be
    /// assumed past this point.
    #[error("loop device probe failed: {0}")]
    Probe(String),

    /// A must-succeed external command returned a non-zero exit status.
    #[error("{program} exited with status {status}: {detail}")]
    Command {
        program: String,
        status: i32,
        detail: String,
    },

    /// `engage`/`disengage` called in a state that does not admit it.
    #[error("lifecycle violation: {0}")]
    Lifecycle(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
