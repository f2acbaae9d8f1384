//! Command handling: templates, dispatch and result decoding
//!
//! - `template` - loading and normalizing PowerShell scripts
//! - `dispatcher` - running templates on pooled sessions
//! - `decode` - turning property bags into VM records

pub mod decode;
pub mod dispatcher;
pub mod template;

pub use decode::{decode, Vm, SENTINEL};
pub use dispatcher::{validate_vm_id, DispatchError, Dispatcher, DispatcherConfig};
pub use template::{CommandKind, CommandTemplate, TemplateError, TemplateStore};
