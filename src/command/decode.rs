//! VM records decoded from remote property bags

use serde::Serialize;

use crate::session::{CommandResult, PropertyBag};

/// Placeholder for any field the host did not report
pub const SENTINEL: &str = "-";

/// A virtual machine as returned by the list endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vm {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "VirtualMachineState")]
    pub virtual_machine_state: String,
    #[serde(rename = "MostRecentTask")]
    pub most_recent_task: String,
    #[serde(rename = "MostRecentTaskUIState")]
    pub most_recent_task_ui_state: String,
    #[serde(rename = "VMHost")]
    pub vm_host: String,
}

impl Vm {
    /// Build a record from one bag, filling gaps with [`SENTINEL`]
    pub fn from_bag(bag: &PropertyBag) -> Self {
        let field = |key: &str| {
            bag.get(key)
                .cloned()
                .unwrap_or_else(|| SENTINEL.to_string())
        };

        Self {
            name: field("Name"),
            id: field("VMId"),
            virtual_machine_state: field("VirtualMachineState"),
            most_recent_task: field("MostRecentTask"),
            most_recent_task_ui_state: field("MostRecentTaskUIState"),
            vm_host: field("VMHost"),
        }
    }
}

/// Decode every record of a result; never fails
pub fn decode(result: &CommandResult) -> Vec<Vm> {
    result.records.iter().map(Vm::from_bag).collect()
}
