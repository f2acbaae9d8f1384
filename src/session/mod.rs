//! Remote session management
//!
//! This module provides:
//! - The remoting client contract (`Connector`, `Channel`)
//! - A single live session with its bookkeeping (`RemoteSession`)
//! - The bounded session pool (`SessionPool`, `SessionLease`)
//! - A `pwsh`-backed connector for PowerShell remoting

pub mod connector;
pub mod handle;
pub mod pool;
pub mod pwsh;

pub use connector::{Channel, CommandResult, ConnectError, Connector, InvokeError, PropertyBag};
pub use handle::{RemoteSession, SessionState};
pub use pool::{PoolConfig, PoolError, PoolStats, SessionLease, SessionPool, StartupError};
pub use pwsh::{PwshConnector, PwshOptions};
