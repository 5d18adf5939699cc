//! Operation vocabulary and per-call options.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CRUD method understood by the remote transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Create => "create",
            Method::Read => "read",
            Method::Update => "update",
            Method::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Full operation vocabulary dispatched by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "create")]
    Create,
    #[serde(rename = "read")]
    Read,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "reset")]
    Reset,
    #[serde(rename = "clear")]
    Clear,
    #[serde(rename = "closeall")]
    CloseAll,
    #[serde(rename = "hasDirtyOrDestroyed")]
    HasDirtyOrDestroyed,
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Reset => "reset",
            Operation::Clear => "clear",
            Operation::CloseAll => "closeall",
            Operation::HasDirtyOrDestroyed => "hasDirtyOrDestroyed",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "create" => Ok(Operation::Create),
            "read" => Ok(Operation::Read),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "reset" => Ok(Operation::Reset),
            "clear" => Ok(Operation::Clear),
            "closeall" => Ok(Operation::CloseAll),
            "hasDirtyOrDestroyed" => Ok(Operation::HasDirtyOrDestroyed),
            other => Err(crate::Error::Validation(format!(
                "unknown operation '{}'",
                other
            ))),
        }
    }
}

/// Per-call flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// The write is degraded (remote unreachable) and must be journaled.
    #[serde(default)]
    pub dirty: bool,
    /// Additive collection fetch instead of replace.
    #[serde(default)]
    pub add: bool,
    /// Suppress the dirty-journal short-circuit on an additive local create.
    #[serde(default)]
    pub merge: bool,
}

impl SyncOptions {
    /// Options with every flag off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for an additive fetch.
    pub fn additive() -> Self {
        Self {
            add: true,
            ..Self::default()
        }
    }

    /// Copy of these options with the dirty flag set.
    pub fn degraded(self) -> Self {
        Self {
            dirty: true,
            ..self
        }
    }

    /// Copy of these options with the dirty flag cleared.
    pub fn clean(self) -> Self {
        Self {
            dirty: false,
            ..self
        }
    }
}
