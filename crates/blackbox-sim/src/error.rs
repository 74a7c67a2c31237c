use std::time::Duration;

use thiserror::Error;

/// Result type used throughout the harness.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors raised while orchestrating containers and network topologies.
///
/// Every external operation reports failure through this type so a
/// provisioning problem fails one test case instead of the whole run.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command `{command}` failed (status {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("daemon `{command}` in {container} exited before becoming ready (status {status:?})")]
    DaemonExited {
        container: String,
        command: String,
        status: Option<i32>,
    },

    #[error("invalid name {0:?}")]
    InvalidName(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("NAT layer setup failed at {step}: {source}")]
    NatSetup {
        step: &'static str,
        #[source]
        source: Box<HarnessError>,
    },
}

impl HarnessError {
    /// Whether this error is a deadline expiry rather than a hard failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }
}
