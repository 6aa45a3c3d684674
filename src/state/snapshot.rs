use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::frame::{ExecutionState, StackFrame};
use crate::script::constants::runtime::MAIN_THREAD_ID;

/// Mutable execution state guarded by the context's single lock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextState {
    pub variables: Value,
    pub threads: BTreeMap<String, ExecutionState>,
    pub stacks: BTreeMap<String, Vec<StackFrame>>,
    /// Parallel master → children it is still waiting for.
    #[serde(default)]
    pub joins: BTreeMap<String, BTreeSet<String>>,
    /// Child → its parallel master.
    #[serde(default)]
    pub parents: BTreeMap<String, String>,
    /// Threads that already entered `exceptionally`.
    #[serde(default)]
    pub recovered: BTreeSet<String>,
    #[serde(default)]
    pub thread_seq: u64,
}

impl ContextState {
    pub fn new(variables: Map<String, Value>) -> Self {
        let mut threads = BTreeMap::new();
        threads.insert(MAIN_THREAD_ID.to_string(), ExecutionState::New);
        let mut stacks = BTreeMap::new();
        stacks.insert(MAIN_THREAD_ID.to_string(), Vec::new());
        Self {
            variables: Value::Object(variables),
            threads,
            stacks,
            joins: BTreeMap::new(),
            parents: BTreeMap::new(),
            recovered: BTreeSet::new(),
            thread_seq: 0,
        }
    }
}

/// 上下文快照
///
/// Everything needed to rebuild a context in another process: the script
/// document plus the full execution state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub context_id: String,
    pub script: Value,
    #[serde(flatten)]
    pub state: ContextState,
}

impl ContextSnapshot {
    pub fn main_state(&self) -> Option<ExecutionState> {
        self.state.threads.get(MAIN_THREAD_ID).copied()
    }
}
