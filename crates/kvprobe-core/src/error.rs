//! Error types for kvprobe

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::ConvergenceTimeout;

/// How a client call failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Authenticated, but not allowed to touch the key or call
    PermissionDenied,
    /// Credentials rejected
    AuthFailed,
    /// Endpoint unreachable or call timed out
    Unavailable,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::PermissionDenied => "permission denied",
            TransportErrorKind::AuthFailed => "authentication failed",
            TransportErrorKind::Unavailable => "unavailable",
            TransportErrorKind::Other => "error",
        };
        f.write_str(name)
    }
}

/// Network or auth failure on a client call
#[derive(Error, Clone, Debug)]
#[error("{operation} against [{endpoints}] failed ({kind}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub operation: String,
    pub endpoints: String,
    pub message: String,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        operation: &str,
        endpoints: &[String],
        message: impl Into<String>,
    ) -> Self {
        TransportError {
            kind,
            operation: operation.to_string(),
            endpoints: endpoints.join(","),
            message: message.into(),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        self.kind == TransportErrorKind::PermissionDenied
    }
}

/// How a member process ended during shutdown
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemberExit {
    pub member: String,
    /// Exit code, `None` when the process died from a signal
    pub code: Option<i32>,
    /// Graceful termination timed out and the process was killed
    pub forced: bool,
}

impl MemberExit {
    /// A member failed if it reported a non-zero exit code
    pub fn is_failure(&self) -> bool {
        matches!(self.code, Some(code) if code != 0)
    }
}

impl fmt::Display for MemberExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} exited with code {}", self.member, code)?,
            None => write!(f, "{} terminated by signal", self.member)?,
        }
        if self.forced {
            write!(f, " (killed after grace period)")?;
        }
        Ok(())
    }
}

fn join_exits(exits: &[MemberExit]) -> String {
    exits
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Harness errors
#[derive(Error, Debug)]
pub enum ProbeError {
    // Process errors
    #[error("Member {member} failed to become ready: {reason}")]
    Startup { member: String, reason: String },

    #[error("Member {member} failed to join the cluster: {reason}")]
    Join { member: String, reason: String },

    #[error("Cluster shutdown reported failures: {}", join_exits(.failures))]
    Shutdown { failures: Vec<MemberExit> },

    // Client errors
    #[error("Admin operation `{operation}` failed: {source}")]
    Admin {
        operation: String,
        #[source]
        source: TransportError,
    },

    #[error("Put of key {key} failed: {source}")]
    Write {
        key: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    // Verification errors
    #[error(transparent)]
    Timeout(#[from] ConvergenceTimeout),

    #[error("Check `{check}` failed: {detail}")]
    Check { check: String, detail: String },

    #[error("Cancelled during {0}")]
    Cancelled(String),

    // Environment errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProbeError {
    pub fn check(check: &str, detail: impl Into<String>) -> Self {
        ProbeError::Check {
            check: check.to_string(),
            detail: detail.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ProbeError::Io {
            context: context.into(),
            source,
        }
    }

    /// The transport failure underneath this error, if any
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            ProbeError::Admin { source, .. } | ProbeError::Write { source, .. } => Some(source),
            ProbeError::Transport(source) => Some(source),
            _ => None,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        self.transport()
            .is_some_and(TransportError::is_permission_denied)
    }
}

/// Result type for kvprobe operations
pub type ProbeResult<T> = Result<T, ProbeError>;
