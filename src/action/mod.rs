// 动作能力接口

mod builtin;
#[cfg(feature = "http-actions")]
mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

pub use builtin::{
    ExitAction, ForEachAction, LogAction, MenuAction, ParseJsonAction, RunAction,
    DEFAULT_ELEMENT_FIELD,
};
#[cfg(feature = "http-actions")]
pub use rest::RestAction;

/// A named capability a script can call.
///
/// `globals` is an immutable snapshot of the shared variable document taken
/// before the step; `args` are the node's arguments after binding.
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, globals: &Value, args: &Map<String, Value>) -> Result<ActionResult>;
}

/// What an action produced. Booleans carried in `Value` drive `do`/`else`.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionResult {
    Value(Value),
    Exit,
    ForEach(ForEachMarker),
    Menu(MenuMarker),
}

impl ActionResult {
    pub fn value(value: impl Into<Value>) -> Self {
        ActionResult::Value(value.into())
    }

    /// `Exit`, or an object value with `"exit": true`.
    pub fn is_exit(&self) -> bool {
        match self {
            ActionResult::Exit => true,
            ActionResult::Value(Value::Object(map)) => {
                map.get(EXIT_FIELD).and_then(Value::as_bool) == Some(true)
            }
            _ => false,
        }
    }

    /// JSON form stored in continuation frames and by `set`/`setGlobal`.
    pub fn to_value(&self) -> Value {
        match self {
            ActionResult::Value(value) => value.clone(),
            ActionResult::Exit => {
                let mut marker = Map::new();
                marker.insert(EXIT_FIELD.to_string(), Value::Bool(true));
                Value::Object(marker)
            }
            ActionResult::ForEach(marker) => serde_json::to_value(marker).unwrap_or(Value::Null),
            ActionResult::Menu(marker) => serde_json::to_value(marker).unwrap_or(Value::Null),
        }
    }
}

impl From<Value> for ActionResult {
    fn from(value: Value) -> Self {
        ActionResult::Value(value)
    }
}

impl From<bool> for ActionResult {
    fn from(flag: bool) -> Self {
        ActionResult::Value(Value::Bool(flag))
    }
}

pub const EXIT_FIELD: &str = "exit";

/// Iteration request: run the node's `do` block once per element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachMarker {
    pub elements: Vec<Value>,
    pub element_field: String,
    pub parallel: bool,
}

/// Menu selection. `option` is the matched option node, `None` selects `else`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MenuMarker {
    pub option: Option<Value>,
}

/// Adapts a synchronous closure into an [`Action`].
pub struct FnAction<F> {
    handler: F,
}

impl<F> FnAction<F>
where
    F: Fn(&Value, &Map<String, Value>) -> Result<ActionResult> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(&Value, &Map<String, Value>) -> Result<ActionResult> + Send + Sync,
{
    async fn execute(&self, globals: &Value, args: &Map<String, Value>) -> Result<ActionResult> {
        (self.handler)(globals, args)
    }
}
