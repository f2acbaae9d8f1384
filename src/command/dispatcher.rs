//! Command Dispatcher - runs templates on pooled sessions
//!
//! # Request Flow
//!
//! ```text
//! caller ──dispatch──► Dispatcher ──acquire──► SessionPool
//!                          │                       │
//!                          │◄──── SessionLease ────┘
//!                          │
//!                          ├──spawn──► invoke task (owns the lease)
//!                          │                │
//!                          │◄── result ─────┤  caller deadline may elapse
//!                          │                │  first; the task keeps the
//! caller ◄── Vec<Vm> ──────┘                ▼  session until the host answers
//!                                      drop(lease) ──► SessionPool
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info_span, Instrument};

use super::decode::{decode, Vm};
use super::template::{CommandKind, CommandTemplate, TemplateStore};
use crate::metrics::{DISPATCH_TOTAL, INVOKE_DURATION};
use crate::session::{CommandResult, InvokeError, PoolError, SessionLease, SessionPool};

/// Timeouts applied to every dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Overall bound on acquire + invoke, as seen by the caller
    pub request_timeout: Duration,
    /// How long a session waits on the host before giving up on a command
    pub operation_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(20),
        }
    }
}

/// Failure classes surfaced to callers
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("script for `{0}` is not loaded")]
    TemplateUnavailable(CommandKind),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no session available: {0}")]
    ServiceUnavailable(String),
    #[error("management host did not answer within {0:?}")]
    UpstreamTimeout(Duration),
    #[error("management host reported an error: {0}")]
    UpstreamError(String),
}

impl DispatchError {
    /// Label used for the `outcome` metric dimension
    pub fn outcome(&self) -> &'static str {
        match self {
            DispatchError::TemplateUnavailable(_) => "template_unavailable",
            DispatchError::InvalidArgument(_) => "invalid_argument",
            DispatchError::ServiceUnavailable(_) => "unavailable",
            DispatchError::UpstreamTimeout(_) => "timeout",
            DispatchError::UpstreamError(_) => "upstream_error",
        }
    }
}

impl From<PoolError> for DispatchError {
    fn from(e: PoolError) -> Self {
        DispatchError::ServiceUnavailable(e.to_string())
    }
}

/// Check that a VM identifier is a GUID (`8-4-4-4-12` hex digits)
pub fn validate_vm_id(vmid: &str) -> Result<(), DispatchError> {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

    let groups: Vec<&str> = vmid.split('-').collect();
    let well_formed = groups.len() == GROUPS.len()
        && groups
            .iter()
            .zip(GROUPS)
            .all(|(group, len)| group.len() == len && group.chars().all(|c| c.is_ascii_hexdigit()));

    if well_formed {
        Ok(())
    } else {
        Err(DispatchError::InvalidArgument(format!("`{vmid}` is not a VM ID")))
    }
}

/// Runs command templates against the session pool
pub struct Dispatcher {
    pool: Arc<SessionPool>,
    templates: TemplateStore,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(pool: Arc<SessionPool>, templates: TemplateStore, config: DispatcherConfig) -> Self {
        Self {
            pool,
            templates,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    fn template(&self, kind: CommandKind) -> Result<Arc<CommandTemplate>, DispatchError> {
        self.templates
            .get(kind)
            .ok_or(DispatchError::TemplateUnavailable(kind))
    }

    /// Run a command and wait for its decoded output
    ///
    /// `timeout` bounds both the wait for a session and the wait for the
    /// host. The session is released on every path; when the caller's
    /// deadline elapses first, it is released once the host answers.
    pub async fn dispatch(
        &self,
        kind: CommandKind,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<Vec<Vm>, DispatchError> {
        let outcome = self.dispatch_inner(kind, args, timeout).await;
        let label = match &outcome {
            Ok(Dispatched::Complete(_)) => "ok",
            Ok(Dispatched::Partial(_)) => "partial",
            Err(e) => e.outcome(),
        };
        DISPATCH_TOTAL.with_label_values(&[kind.as_str(), label]).inc();
        outcome.map(Dispatched::into_records)
    }

    async fn dispatch_inner(
        &self,
        kind: CommandKind,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<Dispatched, DispatchError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let template = self.template(kind)?;
        let lease = self.pool.acquire(timeout).await?;
        let session_id = lease.session_id().to_string();

        let (tx, rx) = oneshot::channel();
        let span = info_span!("invoke", command = %kind, session_id = %session_id);
        let operation_timeout = self.config.operation_timeout;

        tokio::spawn(
            async move {
                let result = run(lease, kind, &template, &args, operation_timeout).await;
                if let Err(unclaimed) = tx.send(result) {
                    tracing::warn!(
                        outcome = ?unclaimed.map(|r| r.records.len()),
                        "Command finished after its caller gave up"
                    );
                }
            }
            .instrument(span),
        );

        let result = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                return Err(DispatchError::UpstreamError(
                    "command task ended without a result".to_string(),
                ))
            }
            Err(_) => {
                tracing::warn!(
                    command = %kind,
                    session_id = %session_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Deadline elapsed before the host answered; remote side effects unknown"
                );
                return Err(DispatchError::UpstreamTimeout(timeout));
            }
        };

        interpret(kind, result)
    }

    /// Fire-and-forget: submit a command and return once it is running
    ///
    /// Waiting for a session is still bounded by `timeout` and its failure is
    /// returned. The command's own outcome is only logged.
    pub async fn submit(
        &self,
        kind: CommandKind,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let submitted = self.submit_inner(kind, args, timeout).await;
        let label = match &submitted {
            Ok(()) => "submitted",
            Err(e) => e.outcome(),
        };
        DISPATCH_TOTAL.with_label_values(&[kind.as_str(), label]).inc();
        submitted
    }

    async fn submit_inner(
        &self,
        kind: CommandKind,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let template = self.template(kind)?;
        let lease = self.pool.acquire(timeout).await?;
        let span = info_span!("submit", command = %kind, session_id = %lease.session_id());
        let operation_timeout = self.config.operation_timeout;

        tokio::spawn(
            async move {
                match run(lease, kind, &template, &args, operation_timeout).await {
                    Ok(result) if result.had_errors => tracing::warn!(
                        errors = ?result.errors,
                        "Submitted command reported errors"
                    ),
                    Ok(_) => tracing::info!("Submitted command completed"),
                    Err(e) => tracing::warn!(error = %e, "Submitted command failed"),
                }
            }
            .instrument(span),
        );

        Ok(())
    }

    /// VMs owned by `domain\username` (both expected pre-normalized)
    pub async fn list_vms(&self, domain: &str, username: &str) -> Result<Vec<Vm>, DispatchError> {
        let vms = self
            .dispatch(
                CommandKind::List,
                vec![domain.to_string(), username.to_string()],
                self.config.request_timeout,
            )
            .await?;
        if !vms.is_empty() {
            tracing::info!(domain, username, count = vms.len(), "VM list returned");
        }
        Ok(vms)
    }

    pub async fn start_vm(&self, vmid: &str) -> Result<(), DispatchError> {
        self.vm_action(CommandKind::Start, vmid).await
    }

    pub async fn save_vm(&self, vmid: &str) -> Result<(), DispatchError> {
        self.vm_action(CommandKind::Save, vmid).await
    }

    pub async fn shutdown_vm(&self, vmid: &str) -> Result<(), DispatchError> {
        self.vm_action(CommandKind::Shutdown, vmid).await
    }

    pub async fn poweroff_vm(&self, vmid: &str) -> Result<(), DispatchError> {
        self.vm_action(CommandKind::PowerOff, vmid).await
    }

    async fn vm_action(&self, kind: CommandKind, vmid: &str) -> Result<(), DispatchError> {
        if let Err(e) = validate_vm_id(vmid) {
            DISPATCH_TOTAL.with_label_values(&[kind.as_str(), e.outcome()]).inc();
            return Err(e);
        }
        self.submit(kind, vec![vmid.to_string()], self.config.request_timeout)
            .await
    }
}

enum Dispatched {
    Complete(Vec<Vm>),
    Partial(Vec<Vm>),
}

impl Dispatched {
    fn into_records(self) -> Vec<Vm> {
        match self {
            Dispatched::Complete(vms) | Dispatched::Partial(vms) => vms,
        }
    }
}

/// Invoke on the leased session; the lease is released when this returns
async fn run(
    mut lease: SessionLease,
    kind: CommandKind,
    template: &CommandTemplate,
    args: &[String],
    operation_timeout: Duration,
) -> Result<CommandResult, InvokeError> {
    let started = Instant::now();
    let result = lease.invoke(template, args, operation_timeout).await;
    INVOKE_DURATION
        .with_label_values(&[kind.as_str()])
        .observe(started.elapsed().as_secs_f64());
    result
}

/// Map an invocation outcome onto the caller-facing error classes
fn interpret(
    kind: CommandKind,
    result: Result<CommandResult, InvokeError>,
) -> Result<Dispatched, DispatchError> {
    match result {
        Err(InvokeError::Timeout(after)) => Err(DispatchError::UpstreamTimeout(after)),
        Err(InvokeError::Connection(reason)) => Err(DispatchError::ServiceUnavailable(reason)),
        Err(InvokeError::Fault(reason)) => Err(DispatchError::UpstreamError(reason)),
        Ok(result) if result.had_errors && result.records.is_empty() => {
            let reason = if result.errors.is_empty() {
                "command reported errors and produced no output".to_string()
            } else {
                result.errors.join("; ")
            };
            Err(DispatchError::UpstreamError(reason))
        }
        Ok(result) if result.had_errors => {
            tracing::warn!(
                command = %kind,
                records = result.records.len(),
                errors = ?result.errors,
                "Command reported errors; returning partial output"
            );
            Ok(Dispatched::Partial(decode(&result)))
        }
        Ok(result) => Ok(Dispatched::Complete(decode(&result))),
    }
}
