//! SCVMM gateway - HTTP front end for SCVMM virtual machine lifecycle
//!
//! This library translates a small HTTP API into PowerShell commands that run
//! on a bounded pool of long-lived remote sessions to the management host.
//!
//! # Modules
//!
//! - `session` - remote sessions and the bounded session pool
//! - `command` - command templates, dispatch and result decoding
//! - `api` - axum routes and error responses
//! - `config` - environment and settings file loading
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use scvmm_gateway::{
//!     Dispatcher, PoolConfig, PwshConnector, PwshOptions, SessionPool, TemplateStore,
//! };
//!
//! let connector = Arc::new(PwshConnector::new(PwshOptions::new("scvmm.corp.local")));
//! let pool = SessionPool::start(connector, PoolConfig::default()).await?;
//! let dispatcher = Dispatcher::new(pool, TemplateStore::load(paths), Default::default());
//! let vms = dispatcher.list_vms("CORP", "alice").await?;
//! ```

pub mod api;
pub mod command;
pub mod config;
pub mod metrics;
pub mod session;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use command::{CommandKind, DispatchError, Dispatcher, DispatcherConfig, TemplateStore, Vm};
pub use config::{Config, ConfigError};
pub use session::{PoolConfig, PwshConnector, PwshOptions, SessionPool, StartupError};
