//! Error taxonomy shared by every part of the build engine.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for shipyard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// One failed invocation inside a fan-out call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Label of the item the invocation ran for (a node or a server).
    pub target: String,
    /// Rendered error of that invocation.
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.message)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The request or a resource spec is malformed. Raised before any remote work.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The servers cannot hold the requested number of new nodes.
    #[error("capacity exceeded: requested {requested} nodes but only {available} slots remain")]
    CapacityExceeded { requested: usize, available: usize },

    /// A single remote operation failed.
    #[error("remote command failed on {host}: `{command}`: {message}")]
    Remote {
        host: String,
        command: String,
        message: String,
    },

    /// One or more invocations of a fan-out call failed.
    #[error("{what} failed for {} target(s): {}", .failures.len(), join_failures(.failures))]
    FanOut {
        what: String,
        failures: Vec<Failure>,
    },

    /// An error scoped to one node or server.
    #[error("{target}: {source}")]
    Target {
        target: String,
        #[source]
        source: Box<Error>,
    },

    /// A scratch key a phase depends on was never stored.
    #[error("build state has no value for `{0}`")]
    MissingKey(String),

    /// A scratch key holds a value of another type.
    #[error("build state value for `{0}` has an unexpected type")]
    ScratchType(String),

    /// A poll-until-ready loop used its whole attempt budget.
    #[error("`{command}` did not succeed after {attempts} attempts: {last}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        last: String,
    },

    /// The session was cancelled while waiting on a remote call.
    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown network type: {0}")]
    UnknownNetworkType(String),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error a detached task recorded in the build state after every
    /// awaited phase had succeeded.
    #[error("{0}")]
    Reported(Arc<Error>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn remote(host: &str, command: &str, message: impl Into<String>) -> Self {
        Error::Remote {
            host: host.to_string(),
            command: command.to_string(),
            message: message.into(),
        }
    }

    /// Failures of a fan-out error, empty for every other variant.
    pub fn failures(&self) -> &[Failure] {
        match self {
            Error::FanOut { failures, .. } => failures,
            _ => &[],
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

fn join_failures(failures: &[Failure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
