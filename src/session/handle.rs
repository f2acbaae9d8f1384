//! Remote Session - a single live administrative channel to the host
//!
//! Each RemoteSession tracks one channel throughout its lifecycle:
//! Open -> (Broken) -> Closed

use std::time::{Duration, Instant};

use uuid::Uuid;

use super::connector::{Channel, CommandResult, ConnectError, Connector, InvokeError};
use crate::command::CommandTemplate;

/// Status of a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Channel is open and can take commands
    Open,
    /// Channel failed and must not be handed out again
    Broken(String),
    /// Channel was closed
    Closed,
}

/// A live channel to the management host plus its bookkeeping
pub struct RemoteSession {
    /// Unique identifier for this session (e.g., "session-01926abc...")
    pub session_id: String,
    channel: Box<dyn Channel>,
    state: SessionState,
    opened_at: Instant,
    last_activity: Instant,
}

impl RemoteSession {
    /// Open a new session through the given connector
    pub async fn open(connector: &dyn Connector) -> Result<Self, ConnectError> {
        let session_id = format!("session-{}", Uuid::now_v7());
        let started = Instant::now();

        let channel = connector.connect().await?;

        tracing::debug!(
            session_id = %session_id,
            endpoint = connector.endpoint(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Session opened"
        );

        let now = Instant::now();
        Ok(Self {
            session_id,
            channel,
            state: SessionState::Open,
            opened_at: now,
            last_activity: now,
        })
    }

    /// Run a template with positional arguments
    ///
    /// A connection-level failure, or a channel that reports itself unhealthy
    /// afterwards, leaves the session in the `Broken` state. So does dropping
    /// the future before the host answers.
    pub async fn invoke(
        &mut self,
        template: &CommandTemplate,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, InvokeError> {
        if let SessionState::Broken(reason) = &self.state {
            return Err(InvokeError::Connection(reason.clone()));
        }
        if self.state == SessionState::Closed {
            return Err(InvokeError::Connection("session closed".to_string()));
        }

        self.last_activity = Instant::now();
        self.mark_broken("command abandoned before the host answered");
        let result = self.channel.invoke(template.text(), args, timeout).await;
        self.state = SessionState::Open;
        self.last_activity = Instant::now();

        match &result {
            Err(e) if e.is_connection_level() => self.mark_broken(e.to_string()),
            _ if !self.channel.is_healthy() => self.mark_broken("channel reported unhealthy"),
            _ => {}
        }

        result
    }

    /// Close the channel
    pub async fn close(mut self) -> Result<(), ConnectError> {
        self.state = SessionState::Closed;
        self.channel.close().await
    }

    /// Mark the session as unusable
    pub fn mark_broken(&mut self, reason: impl Into<String>) {
        self.state = SessionState::Broken(reason.into());
    }

    /// Check if the session can be handed out again
    pub fn is_usable(&self) -> bool {
        self.state == SessionState::Open && self.channel.is_healthy()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Reset the idle clock (called when the session is checked back in)
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the session last ran or finished a command
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Time since the session was opened
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("age", &self.age())
            .field("idle_for", &self.idle_for())
            .finish()
    }
}
