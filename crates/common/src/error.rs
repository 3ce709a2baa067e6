//! Error types for SafeNet

use crate::name::NameError;
use crate::policy::ValidationError;
use thiserror::Error;

/// Result type alias using SafeNet Error
pub type Result<T> = std::result::Result<T, Error>;

/// SafeNet error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Policy document error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Policy validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid name: {0}")]
    InvalidName(#[from] NameError),

    #[error("Peer '{name}' is already enrolled")]
    DuplicateName { name: String },

    #[error("Address {address} is already assigned")]
    DuplicateAddress { address: String },

    #[error("Resource already exists: {kind} {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Resource not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("Address pool {pool} is exhausted")]
    Exhausted { pool: String },

    #[error("Group '{group}' is not declared by the active policy")]
    UnknownGroup { group: String },

    #[error("{tool} not found. {hint}")]
    ToolMissing { tool: String, hint: String },

    #[error("{command} failed with {}: {stderr}", exit_label(.status))]
    ProcessFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("Tunnel is already {state}")]
    AlreadyActive { state: String },

    #[error("Tunnel transition in progress (state: {state})")]
    TransitionInProgress { state: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_label(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

impl Error {
    /// Whether the error came from the external tunnel daemon boundary
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Error::ToolMissing { .. } | Error::ProcessFailure { .. } | Error::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_failure_message() {
        let err = Error::ProcessFailure {
            command: "wireguard.exe /installtunnelservice".to_string(),
            status: Some(1),
            stderr: "access denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "wireguard.exe /installtunnelservice failed with exit code 1: access denied"
        );
        assert!(err.is_external());
    }

    #[test]
    fn test_signal_exit_message() {
        let err = Error::ProcessFailure {
            command: "wg-quick up".to_string(),
            status: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[test]
    fn test_registry_errors_are_not_external() {
        let err = Error::DuplicateName { name: "laptop-01".to_string() };
        assert!(!err.is_external());
        assert_eq!(err.to_string(), "Peer 'laptop-01' is already enrolled");
    }
}
