use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::constants::{args as fields, document};
use crate::error::{FlowError, Result};

/// Parsed script document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptDocument {
    #[serde(rename = "@id", default)]
    pub id: String,
    #[serde(default)]
    pub flow: Vec<SequenceDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exceptionally: Option<ActionNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import: Vec<ImportDef>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceDef {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(default)]
    pub sequence: Vec<ActionNode>,
}

/// One step of a sequence.
///
/// `kind()` is checked when the step runs, so a node naming neither an
/// action nor a decision still parses and fails at execution time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub do_block: Option<Block>,
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    pub else_block: Option<Block>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind<'a> {
    Action(&'a str),
    Decision(&'a str),
}

impl<'a> NodeKind<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            NodeKind::Action(name) | NodeKind::Decision(name) => name,
        }
    }
}

impl ActionNode {
    pub fn kind(&self) -> Result<NodeKind<'_>> {
        if let Some(name) = self.action.as_deref() {
            return Ok(NodeKind::Action(name));
        }
        if let Some(name) = self.decision.as_deref() {
            return Ok(NodeKind::Decision(name));
        }
        Err(FlowError::NotValidObject(
            serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}")),
        ))
    }

    /// Name shown in logs, `"?"` for malformed nodes.
    pub fn label(&self) -> &str {
        self.kind().map(|kind| kind.name()).unwrap_or("?")
    }

    /// The `do` (true) or `else` (false) block. Blocks declared inside `args`
    /// are honoured when the node itself declares none.
    pub fn block(&self, outcome: bool) -> Result<Option<Block>> {
        let (own, key) = if outcome {
            (&self.do_block, document::DO)
        } else {
            (&self.else_block, document::ELSE)
        };
        if let Some(block) = own {
            return Ok(Some(block.clone()));
        }
        match self.args.get(key) {
            Some(value @ Value::Object(_)) => Ok(Some(serde_json::from_value(value.clone())?)),
            _ => Ok(None),
        }
    }

    pub fn is_async(&self) -> bool {
        self.args.get(fields::ASYNC).and_then(Value::as_bool) == Some(true)
    }
}

/// Target of a `do`/`else` branch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
}

impl Block {
    pub fn to(sequence: impl Into<String>) -> Self {
        Self {
            sequence: Some(sequence.into()),
            args: Map::new(),
        }
    }
}

/// Event-triggered entry point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HookDef {
    pub event: String,
    #[serde(flatten)]
    pub node: ActionNode,
}

/// Deferred action registration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportDef {
    pub action: String,
    pub url: String,
    #[serde(default)]
    pub reload: bool,
}
