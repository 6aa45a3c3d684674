use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::script::ActionNode;

/// 线程执行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    New,
    Running,
    Waiting,
    Finished,
}

impl ExecutionState {
    pub fn is_runnable(self) -> bool {
        matches!(self, ExecutionState::New | ExecutionState::Running)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionState::New => "NEW",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Waiting => "WAITING",
            ExecutionState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Where `set` results inside an iteration scope are collected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectTarget {
    /// Top-level variable key holding the result list.
    pub key: String,
    /// `set` name whose values are appended to the list.
    pub field: String,
}

/// Remaining work of a forEach expansion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
    pub elements: VecDeque<Value>,
    pub element_var: String,
    pub parallel: bool,
    /// Path of the first iteration; later serial iterations live at
    /// `{base_path}({index})-` derived from it.
    pub base_path: String,
    pub next_index: usize,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub block_args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect: Option<CollectTarget>,
}

impl Iteration {
    /// Path where the `index`-th serial iteration keeps its locals.
    pub fn path_for(&self, index: usize) -> String {
        match self.base_path.strip_suffix('-') {
            Some(stem) if index > 0 => format!("{stem}({index})-"),
            _ => self.base_path.clone(),
        }
    }
}

/// 续体栈帧
///
/// Frames are pushed by the engine and popped by the resolver; the top of a
/// thread's stack always describes where that thread continues.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum StackFrame {
    /// A sequence about to be opened at `path`.
    #[serde(rename_all = "camelCase")]
    Entry {
        path: String,
        sequence_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<Iteration>,
    },
    /// A sequence opened; its first node is next.
    #[serde(rename_all = "camelCase")]
    Start { path: String, sequence_id: String },
    /// A node that already ran.
    #[serde(rename_all = "camelCase")]
    Action {
        path: String,
        sequence_id: String,
        action_index: usize,
        #[serde(default)]
        args: Map<String, Value>,
        #[serde(default)]
        result: Value,
    },
    /// Parallel iteration barrier: the thread waits here for its children.
    Join { path: String },
}

impl StackFrame {
    pub fn path(&self) -> &str {
        match self {
            StackFrame::Entry { path, .. }
            | StackFrame::Start { path, .. }
            | StackFrame::Action { path, .. }
            | StackFrame::Join { path } => path,
        }
    }

    pub fn sequence_id(&self) -> Option<&str> {
        match self {
            StackFrame::Entry { sequence_id, .. }
            | StackFrame::Start { sequence_id, .. }
            | StackFrame::Action { sequence_id, .. } => Some(sequence_id),
            StackFrame::Join { .. } => None,
        }
    }
}

/// What the resolver hands to the engine for the next step.
#[derive(Clone, Debug, PartialEq)]
pub enum FramePointer {
    /// Open `sequence_id` at `path`.
    Entry {
        path: String,
        sequence_id: String,
        iteration: Option<Iteration>,
    },
    /// Run `node`, found at `action_index` of `sequence_id`.
    Action {
        path: String,
        sequence_id: String,
        action_index: usize,
        node: ActionNode,
    },
}

impl FramePointer {
    pub fn path(&self) -> &str {
        match self {
            FramePointer::Entry { path, .. } | FramePointer::Action { path, .. } => path,
        }
    }
}
