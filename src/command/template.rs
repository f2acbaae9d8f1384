//! Command templates loaded from PowerShell script files
//!
//! Scripts are stripped of comments and blank lines before they are sent to
//! the host, to keep the payload small. Arguments are never spliced into the
//! text: each template declares a `param(...)` block and receives its
//! arguments positionally.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

const BLOCK_OPEN: &str = "<#";
const BLOCK_CLOSE: &str = "#>";
const LINE_COMMENT: &str = "#";

/// The command families the gateway knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    List,
    Start,
    Save,
    Shutdown,
    PowerOff,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::List,
        CommandKind::Start,
        CommandKind::Save,
        CommandKind::Shutdown,
        CommandKind::PowerOff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::List => "list",
            CommandKind::Start => "start",
            CommandKind::Save => "save",
            CommandKind::Shutdown => "shutdown",
            CommandKind::PowerOff => "poweroff",
        }
    }

    /// Whether the command targets a single VM by identifier
    pub fn is_vm_action(&self) -> bool {
        !matches!(self, CommandKind::List)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to load a template file
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("cannot read script {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("script {} contains no statements", .0.display())]
    Empty(PathBuf),
}

/// A normalized, immutable script body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    text: String,
}

impl CommandTemplate {
    /// Build a template from raw script text
    ///
    /// Returns `None` if nothing but comments and whitespace remain.
    pub fn parse(source: &str) -> Option<Self> {
        let text = strip_comments(source);
        if text.is_empty() {
            None
        } else {
            Some(Self { text })
        }
    }

    /// Read and normalize a script file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&source).ok_or_else(|| TemplateError::Empty(path.to_path_buf()))
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Drop comment and blank lines, trimming what is left
pub fn strip_comments(source: &str) -> String {
    let mut in_block = false;
    let mut kept = Vec::new();

    for line in source.lines() {
        let line = line.trim();
        if in_block {
            in_block = !line.ends_with(BLOCK_CLOSE);
        } else if line.starts_with(BLOCK_OPEN) {
            // `<# ... #>` on a single line closes itself
            in_block = !(line.len() >= BLOCK_OPEN.len() + BLOCK_CLOSE.len()
                && line.ends_with(BLOCK_CLOSE));
        } else if !line.is_empty() && !line.starts_with(LINE_COMMENT) {
            kept.push(line);
        }
    }

    kept.join("\n")
}

/// Templates for every command kind that loaded successfully
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<CommandKind, Arc<CommandTemplate>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load each script; a missing or empty one is logged and left out
    pub fn load<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = (CommandKind, PathBuf)>,
    {
        let mut store = Self::new();
        for (kind, path) in paths {
            match CommandTemplate::load(&path) {
                Ok(template) => {
                    tracing::debug!(command = %kind, path = %path.display(), "Loaded script");
                    store.insert(kind, template);
                }
                Err(e) => {
                    tracing::warn!(
                        command = %kind,
                        error = %e,
                        "Script not loaded, command disabled"
                    );
                }
            }
        }
        tracing::info!(loaded = store.templates.len(), "Command templates loaded");
        store
    }

    pub fn insert(&mut self, kind: CommandKind, template: CommandTemplate) {
        self.templates.insert(kind, Arc::new(template));
    }

    /// Insert a template and return the store
    pub fn with(mut self, kind: CommandKind, template: CommandTemplate) -> Self {
        self.insert(kind, template);
        self
    }

    pub fn get(&self, kind: CommandKind) -> Option<Arc<CommandTemplate>> {
        self.templates.get(&kind).cloned()
    }

    pub fn contains(&self, kind: CommandKind) -> bool {
        self.templates.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_strip_comments_keeps_code_in_order() {
        let source = "\
<#
.SYNOPSIS
    Lists VMs owned by a user
#>
param($Domain, $UserName)

# owner is DOMAIN\\user
$owner = \"$Domain\\$UserName\"
    Get-SCVirtualMachine |
  # trailing filter
    Where-Object { $_.Owner -eq $owner }
";
        let stripped = strip_comments(source);
        assert_eq!(
            stripped,
            "param($Domain, $UserName)\n$owner = \"$Domain\\$UserName\"\nGet-SCVirtualMachine |\nWhere-Object { $_.Owner -eq $owner }"
        );
    }

    #[test]
    fn test_block_comment_ends_on_closing_line() {
        let source = "<# start\nhidden\nstill hidden #>\nvisible";
        assert_eq!(strip_comments(source), "visible");
    }

    #[test]
    fn test_single_line_block_comment() {
        let source = "<# one-liner #>\nGet-SCVMMServer";
        assert_eq!(strip_comments(source), "Get-SCVMMServer");
    }

    #[test]
    fn test_only_comments_is_empty() {
        assert!(CommandTemplate::parse("# nothing\n\n   \n<#\nx\n#>").is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let err = CommandTemplate::load("/nonexistent/list.ps1").unwrap_err();
        assert!(matches!(err, TemplateError::Read { .. }));
    }

    #[test]
    fn test_store_skips_unloadable_scripts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# list\nparam($Domain, $UserName)\nGet-SCVirtualMachine").unwrap();

        let store = TemplateStore::load(vec![
            (CommandKind::List, file.path().to_path_buf()),
            (CommandKind::Start, PathBuf::from("/nonexistent/start.ps1")),
        ]);

        assert!(store.contains(CommandKind::List));
        assert!(!store.contains(CommandKind::Start));
        assert_eq!(
            store.get(CommandKind::List).unwrap().text(),
            "param($Domain, $UserName)\nGet-SCVirtualMachine"
        );
    }

    #[test]
    fn test_command_kind_names() {
        let names: Vec<&str> = CommandKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(names, ["list", "start", "save", "shutdown", "poweroff"]);
        assert!(!CommandKind::List.is_vm_action());
        assert!(CommandKind::PowerOff.is_vm_action());
    }
}
