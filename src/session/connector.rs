//! Remoting client contract
//!
//! The pool never speaks the remote protocol itself. A [`Connector`] knows how
//! to authenticate against the management host and hands back a [`Channel`],
//! one live administrative session that runs one command at a time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// A loosely-typed record emitted by a remote command
pub type PropertyBag = HashMap<String, String>;

/// Output of one remote command execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    /// Records in the order the remote side emitted them
    pub records: Vec<PropertyBag>,
    /// The remote side reported errors, even if some records were produced
    pub had_errors: bool,
    /// Error messages reported by the remote side
    pub errors: Vec<String>,
}

impl CommandResult {
    /// A successful result carrying the given records
    pub fn with_records(records: Vec<PropertyBag>) -> Self {
        Self {
            records,
            had_errors: false,
            errors: Vec::new(),
        }
    }

    /// A result flagged as failed, optionally with partial output
    pub fn with_errors(records: Vec<PropertyBag>, errors: Vec<String>) -> Self {
        Self {
            records,
            had_errors: true,
            errors,
        }
    }
}

/// Failure to establish (or keep) a session with the management host
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot reach {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("timed out connecting to {endpoint} after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("remoting client failed: {0}")]
    Client(String),
    #[error("remoting client i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single command invocation
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The host did not answer within the deadline (retryable)
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),
    /// The host answered but the command failed
    #[error("remote command failed: {0}")]
    Fault(String),
    /// The channel is unusable and must be discarded
    #[error("session connection lost: {0}")]
    Connection(String),
}

impl InvokeError {
    /// Whether the session that produced this error must be discarded
    pub fn is_connection_level(&self) -> bool {
        matches!(self, InvokeError::Connection(_))
    }
}

/// Opens channels to the management host
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable target, used in logs and errors
    fn endpoint(&self) -> &str;

    /// Open and authenticate a new channel
    async fn connect(&self) -> Result<Box<dyn Channel>, ConnectError>;
}

/// One live administrative session
#[async_trait]
pub trait Channel: Send {
    /// Run `script` with `args` bound positionally to its parameters
    async fn invoke(
        &mut self,
        script: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, InvokeError>;

    /// Tear the channel down
    async fn close(&mut self) -> Result<(), ConnectError>;

    /// `false` once the channel can no longer be trusted with a new command
    fn is_healthy(&self) -> bool {
        true
    }
}
