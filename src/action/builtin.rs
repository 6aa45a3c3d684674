use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use super::{Action, ActionResult, ForEachMarker, MenuMarker};
use crate::error::{FlowError, Result};
use crate::script::constants::args as fields;
use crate::utils::lookup;

pub const DEFAULT_ELEMENT_FIELD: &str = "iterationElement";

/// Always takes the `do` block.
pub struct RunAction;

#[async_trait]
impl Action for RunAction {
    async fn execute(&self, _globals: &Value, _args: &Map<String, Value>) -> Result<ActionResult> {
        Ok(ActionResult::from(true))
    }
}

/// Finishes the calling thread.
pub struct ExitAction;

#[async_trait]
impl Action for ExitAction {
    async fn execute(&self, _globals: &Value, _args: &Map<String, Value>) -> Result<ActionResult> {
        Ok(ActionResult::Exit)
    }
}

/// Runs the node's `do` block once per element of `iterateOver`.
///
/// `iterateOver` is either a variable path, resolved in the caller's local
/// scope first and the global document second, or a value already bound by a
/// lone `{{placeholder}}`. A non-list value iterates as a single element.
pub struct ForEachAction;

#[async_trait]
impl Action for ForEachAction {
    async fn execute(&self, globals: &Value, args: &Map<String, Value>) -> Result<ActionResult> {
        let over = args.get(fields::ITERATE_OVER).ok_or_else(|| {
            FlowError::NotValidObject("forEach requires an `iterateOver` argument".to_string())
        })?;

        let resolved = match over {
            Value::String(path) => {
                let local = args
                    .get(fields::PATH)
                    .and_then(Value::as_str)
                    .map(|prefix| format!("{prefix}{path}"));
                local
                    .and_then(|local| lookup(globals, &local).cloned())
                    .or_else(|| lookup(globals, path).cloned())
                    .unwrap_or(Value::Null)
            }
            other => other.clone(),
        };

        let elements = match resolved {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };

        let element_field = args
            .get(fields::SET_ELEMENT)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_ELEMENT_FIELD)
            .to_string();

        Ok(ActionResult::ForEach(ForEachMarker {
            elements,
            element_field,
            parallel: args.get(fields::PARALLEL).and_then(Value::as_bool) == Some(true),
        }))
    }
}

/// Picks the option whose `code`, or any of its `similar` aliases, equals the
/// received `text`. Comparison is case-insensitive and ignores surrounding
/// whitespace.
pub struct MenuAction;

impl MenuAction {
    fn normalize(value: &Value) -> String {
        match value {
            Value::String(text) => text.trim().to_lowercase(),
            Value::Null => String::new(),
            other => other.to_string().trim().to_lowercase(),
        }
    }

    fn matches(option: &Value, received: &str) -> bool {
        let code = option.get("code").map(Self::normalize);
        if code.as_deref() == Some(received) {
            return true;
        }
        option
            .get("similar")
            .and_then(Value::as_array)
            .is_some_and(|aliases| aliases.iter().any(|alias| Self::normalize(alias) == received))
    }
}

#[async_trait]
impl Action for MenuAction {
    async fn execute(&self, _globals: &Value, args: &Map<String, Value>) -> Result<ActionResult> {
        let received = args.get("text").map(Self::normalize).unwrap_or_default();
        let option = args
            .get("options")
            .and_then(Value::as_array)
            .and_then(|options| {
                options
                    .iter()
                    .find(|option| Self::matches(option, &received))
                    .cloned()
            });
        Ok(ActionResult::Menu(MenuMarker { option }))
    }
}

/// Parses the `text` argument as JSON. Missing text parses as `{}`.
pub struct ParseJsonAction;

#[async_trait]
impl Action for ParseJsonAction {
    async fn execute(&self, _globals: &Value, args: &Map<String, Value>) -> Result<ActionResult> {
        let parsed = match args.get("text") {
            Some(Value::String(text)) => serde_json::from_str(text)?,
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(other) => other.clone(),
        };
        Ok(ActionResult::Value(parsed))
    }
}

/// Writes `text` to the log at info level and returns `"ok"`.
pub struct LogAction;

#[async_trait]
impl Action for LogAction {
    async fn execute(&self, _globals: &Value, args: &Map<String, Value>) -> Result<ActionResult> {
        let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
        let thread = args
            .get(fields::THREAD_ID)
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!(thread = %thread, "{}", text);
        Ok(ActionResult::value("ok"))
    }
}
