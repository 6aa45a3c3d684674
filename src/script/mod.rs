// 脚本定义模块

pub mod constants;
mod document;
mod imports;
mod registry;

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::action::{
    Action, ActionResult, ExitAction, FnAction, ForEachAction, MenuAction, ParseJsonAction,
    RunAction,
};
use crate::error::{FlowError, Result};
use crate::state::ExecutionContext;
use constants::{builtin, document as doc_fields};

pub use document::{ActionNode, Block, HookDef, ImportDef, NodeKind, ScriptDocument, SequenceDef};
pub use imports::ActionLoader;
pub use registry::ActionRegistry;

/// Immutable flow graph plus the capabilities it may call.
pub struct Script {
    source: Value,
    document: ScriptDocument,
    actions: ActionRegistry,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("id", &self.document.id)
            .field("sequences", &self.document.flow.len())
            .field("actions", &self.actions.names())
            .finish()
    }
}

impl FromStr for Script {
    type Err = FlowError;

    fn from_str(source: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(source)?)
    }
}

impl Script {
    pub fn from_value(source: Value) -> Result<Self> {
        let document: ScriptDocument = serde_json::from_value(source.clone())?;
        let script = Self {
            source,
            document,
            actions: ActionRegistry::new(),
        };
        script.register_builtins();
        info!(script = %script.name(), sequences = script.document.flow.len(), "loaded script");
        Ok(script)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            FlowError::Other(anyhow::anyhow!("failed to read `{}`: {}", path.display(), e))
        })?;
        text.parse()
    }

    fn register_builtins(&self) {
        self.register(builtin::RUN, Arc::new(RunAction));
        self.register(builtin::EXIT, Arc::new(ExitAction));
        self.register(builtin::FOR_EACH, Arc::new(ForEachAction));
        self.register(builtin::MENU, Arc::new(MenuAction));
        self.register(builtin::PARSE_JSON, Arc::new(ParseJsonAction));
    }

    /// Script `@id`, `"no-name"` when absent.
    pub fn name(&self) -> &str {
        if self.document.id.is_empty() {
            "no-name"
        } else {
            &self.document.id
        }
    }

    /// The document exactly as it was loaded; embedded in snapshots.
    pub fn source(&self) -> &Value {
        &self.source
    }

    pub fn document(&self) -> &ScriptDocument {
        &self.document
    }

    pub fn main(&self) -> Option<&[ActionNode]> {
        self.sequence(doc_fields::MAIN_SEQUENCE)
    }

    pub fn sequence(&self, id: &str) -> Option<&[ActionNode]> {
        self.document
            .flow
            .iter()
            .find(|sequence| sequence.id == id)
            .map(|sequence| sequence.sequence.as_slice())
    }

    pub fn action_at(&self, sequence_id: &str, index: usize) -> Option<&ActionNode> {
        self.sequence(sequence_id)?.get(index)
    }

    pub fn hooks(&self) -> &[HookDef] {
        &self.document.hooks
    }

    /// First hook declared for `event`.
    pub fn hook(&self, event: &str) -> Option<&HookDef> {
        self.document.hooks.iter().find(|hook| hook.event == event)
    }

    pub fn exceptionally(&self) -> Option<&ActionNode> {
        self.document.exceptionally.as_ref()
    }

    pub fn imports(&self) -> &[ImportDef] {
        &self.document.import
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn action(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name)
    }

    pub fn register(&self, name: impl Into<String>, action: Arc<dyn Action>) {
        self.actions.register(name, action);
    }

    /// Registers a synchronous closure as an action.
    pub fn register_fn<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value, &Map<String, Value>) -> Result<ActionResult> + Send + Sync + 'static,
    {
        self.actions.register(name, Arc::new(FnAction::new(handler)));
    }

    /// Registers every import whose action is still unknown, or that asks to
    /// be reloaded. Returns how many actions were (re)registered.
    pub async fn load_imports(&self, loader: &dyn ActionLoader) -> Result<usize> {
        let mut loaded = 0;
        for import in &self.document.import {
            if !import.reload && self.actions.contains(&import.action) {
                continue;
            }
            debug!(action = %import.action, url = %import.url, "fetching action");
            let action = loader
                .load(import)
                .await
                .map_err(|e| FlowError::ImportFailed {
                    action: import.action.clone(),
                    url: import.url.clone(),
                    reason: e.to_string(),
                })?;
            self.actions.register(import.action.clone(), action);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Creates a fresh execution context seeded with `args` (JSON text).
    pub fn with(self: &Arc<Self>, args: &str) -> Result<Arc<ExecutionContext>> {
        ExecutionContext::create(Arc::clone(self), args)
    }
}
