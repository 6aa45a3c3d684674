use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::frame::{CollectTarget, ExecutionState, FramePointer, StackFrame};
use super::listener::{
    ActionListener, CompleteListener, ExceptionListener, Listeners, StateListener,
};
use super::snapshot::{ContextSnapshot, ContextState};
use crate::action::ActionResult;
use crate::error::{FlowError, Result};
use crate::script::constants::{args as fields, document, runtime};
use crate::script::{ActionNode, Script};
use crate::utils::{lookup, path};

/// Side effects gathered under the lock and delivered after it is released.
#[derive(Default)]
struct Effects {
    changes: Vec<(String, ExecutionState)>,
    completed: bool,
}

/// 执行上下文
///
/// All mutation goes through `state`; actions only ever see cloned snapshots
/// of the variable document.
pub struct ExecutionContext {
    id: String,
    script: Arc<Script>,
    state: Mutex<ContextState>,
    listeners: Listeners,
    done: watch::Sender<bool>,
    /// Dispatch gate; true while a loop drives this context.
    gate: tokio::sync::Mutex<bool>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("script", &self.script.name())
            .field("threads", &self.thread_states())
            .finish()
    }
}

impl ExecutionContext {
    /// Fresh context whose variable document is `args`, a JSON object.
    /// Blank text seeds an empty document.
    pub fn create(script: Arc<Script>, args: &str) -> Result<Arc<Self>> {
        let seed = if args.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(args)?
        };
        Self::create_with_value(script, seed)
    }

    pub fn create_with_value(script: Arc<Script>, args: Value) -> Result<Arc<Self>> {
        let variables = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(FlowError::NotValidObject(format!(
                    "context arguments must be a JSON object, got {other}"
                )))
            }
        };
        let id = uuid::Uuid::new_v4().to_string();
        debug!(context = %id, script = %script.name(), "created context");
        Ok(Self::from_parts(id, script, ContextState::new(variables)))
    }

    /// Rebuilds a context from a snapshot, with built-in actions only.
    pub fn load(snapshot: ContextSnapshot) -> Result<Arc<Self>> {
        let script = Arc::new(Script::from_value(snapshot.script.clone())?);
        Self::load_with_script(snapshot, script)
    }

    pub fn load_str(snapshot: &str) -> Result<Arc<Self>> {
        Self::load(serde_json::from_str(snapshot)?)
    }

    /// Rebuilds a context from a snapshot on top of an already configured
    /// script. The script must carry the same `@id` as the snapshot.
    pub fn load_with_script(snapshot: ContextSnapshot, script: Arc<Script>) -> Result<Arc<Self>> {
        let expected = snapshot
            .script
            .get(document::ID)
            .and_then(Value::as_str)
            .unwrap_or_default();
        if expected != script.document().id {
            return Err(FlowError::ScriptState(format!(
                "snapshot belongs to script `{expected}`, not `{}`",
                script.name()
            )));
        }
        debug!(context = %snapshot.context_id, "loaded context snapshot");
        Ok(Self::from_parts(snapshot.context_id, script, snapshot.state))
    }

    fn from_parts(id: String, script: Arc<Script>, state: ContextState) -> Arc<Self> {
        let finished =
            state.threads.get(runtime::MAIN_THREAD_ID) == Some(&ExecutionState::Finished);
        let (done, _) = watch::channel(finished);
        Arc::new(Self {
            id,
            script,
            state: Mutex::new(state),
            listeners: Listeners::default(),
            done,
            gate: tokio::sync::Mutex::new(false),
        })
    }

    pub fn to_snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            context_id: self.id.clone(),
            script: self.script.source().clone(),
            state: self.state.lock().clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_snapshot())?)
    }

    pub(crate) fn gate(&self) -> &tokio::sync::Mutex<bool> {
        &self.gate
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn script(&self) -> &Arc<Script> {
        &self.script
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut ContextState, &mut Effects) -> R) -> R {
        let mut effects = Effects::default();
        let out = {
            let mut state = self.state.lock();
            apply(&mut state, &mut effects)
        };
        self.deliver(effects);
        out
    }

    fn deliver(&self, effects: Effects) {
        for (thread, state) in effects.changes {
            trace!(context = %self.id, thread = %thread, state = %state, "thread state changed");
            self.listeners.invoke_state_change(&thread, state);
        }
        if effects.completed {
            debug!(context = %self.id, "main thread finished");
            self.listeners.invoke_complete();
            self.done.send_replace(true);
        }
    }

    fn transition(
        state: &mut ContextState,
        effects: &mut Effects,
        thread: &str,
        to: ExecutionState,
    ) {
        let previous = state.threads.insert(thread.to_string(), to);
        if previous == Some(to) {
            return;
        }
        effects.changes.push((thread.to_string(), to));
        if to != ExecutionState::Finished {
            return;
        }

        if let Some(master) = state.parents.remove(thread) {
            let drained = match state.joins.get_mut(&master) {
                Some(children) => {
                    children.remove(thread);
                    children.is_empty()
                }
                None => true,
            };
            let parked = state.threads.get(&master) == Some(&ExecutionState::Waiting)
                && matches!(
                    state.stacks.get(&master).and_then(|stack| stack.last()),
                    Some(StackFrame::Join { .. })
                );
            if drained && parked {
                Self::transition(state, effects, &master, ExecutionState::Running);
            }
        }
        if thread == runtime::MAIN_THREAD_ID {
            effects.completed = true;
        }
    }

    pub fn thread_state(&self, thread: &str) -> Option<ExecutionState> {
        self.state.lock().threads.get(thread).copied()
    }

    pub fn thread_states(&self) -> BTreeMap<String, ExecutionState> {
        self.state.lock().threads.clone()
    }

    pub fn set_thread_state(&self, thread: &str, to: ExecutionState) {
        self.mutate(|state, effects| Self::transition(state, effects, thread, to));
    }

    /// True while any thread is NEW or RUNNING.
    pub fn running(&self) -> bool {
        self.state
            .lock()
            .threads
            .values()
            .any(|state| state.is_runnable())
    }

    pub fn is_runnable(&self, thread: &str) -> bool {
        self.thread_state(thread)
            .is_some_and(ExecutionState::is_runnable)
    }

    pub fn is_finished(&self) -> bool {
        self.thread_state(runtime::MAIN_THREAD_ID) == Some(ExecutionState::Finished)
    }

    pub fn runnable_threads(&self) -> Vec<String> {
        self.state
            .lock()
            .threads
            .iter()
            .filter(|(_, state)| state.is_runnable())
            .map(|(thread, _)| thread.clone())
            .collect()
    }

    pub fn push(&self, thread: &str, frame: StackFrame) {
        trace!(context = %self.id, thread = %thread, ?frame, "push frame");
        self.state
            .lock()
            .stacks
            .entry(thread.to_string())
            .or_default()
            .push(frame);
    }

    pub fn pop(&self, thread: &str) -> Option<StackFrame> {
        self.state.lock().stacks.get_mut(thread)?.pop()
    }

    pub fn current_frame(&self, thread: &str) -> Option<StackFrame> {
        self.state.lock().stacks.get(thread)?.last().cloned()
    }

    pub fn stack_depth(&self, thread: &str) -> usize {
        self.state.lock().stacks.get(thread).map_or(0, Vec::len)
    }

    pub fn clear_stack(&self, thread: &str) {
        if let Some(stack) = self.state.lock().stacks.get_mut(thread) {
            stack.clear();
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        lookup(&self.state.lock().variables, name).cloned()
    }

    pub fn set_variable(&self, name: &str, value: Value) {
        path::assign(&mut self.state.lock().variables, name, value);
    }

    pub fn unset_variable(&self, name: &str) -> Option<Value> {
        path::remove(&mut self.state.lock().variables, name)
    }

    /// Appends to the list variable `name`, creating it when missing.
    pub fn append(&self, name: &str, value: Value) {
        path::append(&mut self.state.lock().variables, name, value);
    }

    /// Immutable snapshot of the whole variable document.
    pub fn variables(&self) -> Value {
        self.state.lock().variables.clone()
    }

    /// Continuation resolver: decides what `thread` does next.
    pub fn next(&self, thread: &str) -> Result<Option<FramePointer>> {
        let script = Arc::clone(&self.script);
        self.mutate(|state, effects| match state.threads.get(thread).copied() {
            Some(ExecutionState::New) => {
                if script.main().is_none() {
                    return Err(FlowError::SequenceNotFound(
                        document::MAIN_SEQUENCE.to_string(),
                    ));
                }
                Self::transition(state, effects, thread, ExecutionState::Running);
                Ok(Some(FramePointer::Entry {
                    path: format!("{thread}-{}-", document::MAIN_SEQUENCE),
                    sequence_id: document::MAIN_SEQUENCE.to_string(),
                    iteration: None,
                }))
            }
            Some(ExecutionState::Running) => Self::resolve(&script, state, effects, thread),
            _ => Ok(None),
        })
    }

    fn resolve(
        script: &Script,
        state: &mut ContextState,
        effects: &mut Effects,
        thread: &str,
    ) -> Result<Option<FramePointer>> {
        let Some(frame) = state.stacks.get_mut(thread).and_then(Vec::pop) else {
            warn!(thread = %thread, "running thread has an empty stack");
            Self::transition(state, effects, thread, ExecutionState::Finished);
            return Ok(None);
        };

        let (path, sequence_id, index) = match frame {
            StackFrame::Entry {
                path,
                sequence_id,
                iteration,
            } => {
                return Ok(Some(FramePointer::Entry {
                    path,
                    sequence_id,
                    iteration,
                }))
            }
            StackFrame::Start { path, sequence_id } => (path, sequence_id, 0),
            StackFrame::Action {
                path,
                sequence_id,
                action_index,
                ..
            } => (path, sequence_id, action_index + 1),
            StackFrame::Join { path } => {
                let pending = state
                    .joins
                    .get(thread)
                    .is_some_and(|children| !children.is_empty());
                if pending {
                    state
                        .stacks
                        .entry(thread.to_string())
                        .or_default()
                        .push(StackFrame::Join { path });
                    Self::transition(state, effects, thread, ExecutionState::Waiting);
                } else {
                    state.joins.remove(thread);
                }
                return Ok(None);
            }
        };

        let nodes = script
            .sequence(&sequence_id)
            .ok_or_else(|| FlowError::SequenceNotFound(sequence_id.clone()))?;
        if let Some(node) = nodes.get(index) {
            return Ok(Some(FramePointer::Action {
                path,
                sequence_id,
                action_index: index,
                node: node.clone(),
            }));
        }

        let exhausted = state.stacks.get(thread).map_or(true, Vec::is_empty);
        if exhausted {
            Self::transition(state, effects, thread, ExecutionState::Finished);
        }
        Ok(None)
    }

    /// Next id for a thread created under `prefix`.
    pub fn allocate_thread_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock();
        state.thread_seq += 1;
        format!(
            "{prefix}{}{}",
            runtime::THREAD_SUFFIX_SEPARATOR,
            state.thread_seq
        )
    }

    /// Registers a RUNNING thread whose stack holds `frame`. With a `master`,
    /// the thread joins that master's rendezvous.
    pub fn spawn_thread(&self, thread: &str, master: Option<&str>, frame: StackFrame) {
        self.mutate(|state, effects| {
            state.stacks.insert(thread.to_string(), vec![frame]);
            if let Some(master) = master {
                state
                    .joins
                    .entry(master.to_string())
                    .or_default()
                    .insert(thread.to_string());
                state.parents.insert(thread.to_string(), master.to_string());
            }
            Self::transition(state, effects, thread, ExecutionState::Running);
        });
    }

    /// Parks `thread` on a pending async frame.
    pub fn begin_async(&self, thread: &str, frame: StackFrame) {
        self.mutate(|state, effects| {
            state
                .stacks
                .entry(thread.to_string())
                .or_default()
                .push(frame);
            Self::transition(state, effects, thread, ExecutionState::Waiting);
        });
    }

    /// Attaches a callback result to the pending async frame of `thread`
    /// and makes it runnable again.
    pub fn complete_async(&self, thread: &str, result: Value) -> Result<()> {
        self.mutate(|state, effects| {
            if state.threads.get(thread) != Some(&ExecutionState::Waiting) {
                return Err(FlowError::ScriptState(format!(
                    "thread `{thread}` is not waiting for a callback"
                )));
            }
            let Some(StackFrame::Action {
                path,
                args,
                result: pending,
                ..
            }) = state.stacks.get_mut(thread).and_then(|stack| stack.last_mut())
            else {
                return Err(FlowError::ScriptState(format!(
                    "thread `{thread}` has no pending action"
                )));
            };
            *pending = result.clone();
            let (path, args) = (path.clone(), args.clone());
            Self::store(state, &path, &args, &result, true);
            Self::transition(state, effects, thread, ExecutionState::Running);
            Ok(())
        })
    }

    /// Records a completed non-async step: pushes its frame and writes the
    /// stored value to `set`/`setGlobal`.
    pub fn commit_action(&self, thread: &str, frame: StackFrame, stored: &Value, accumulate: bool) {
        let mut state = self.state.lock();
        if let StackFrame::Action { path, args, .. } = &frame {
            Self::store(&mut state, path, args, stored, accumulate);
        }
        state
            .stacks
            .entry(thread.to_string())
            .or_default()
            .push(frame);
    }

    /// Writes `value` to the targets named by `args`, outside of any frame.
    pub fn store_result(&self, scope: &str, args: &Map<String, Value>, value: &Value) {
        Self::store(&mut self.state.lock(), scope, args, value, true);
    }

    fn store(
        state: &mut ContextState,
        scope: &str,
        args: &Map<String, Value>,
        value: &Value,
        accumulate: bool,
    ) {
        if value.is_null() {
            return;
        }
        let target = |field: &str| {
            args.get(field)
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        };

        if let Some(name) = target(fields::SET) {
            path::assign(&mut state.variables, &format!("{scope}{name}"), value.clone());
            if accumulate {
                let collect = lookup(
                    &state.variables,
                    &format!("{scope}{}", runtime::COLLECT_FIELD),
                )
                .cloned()
                .and_then(|marker| serde_json::from_value::<CollectTarget>(marker).ok());
                if let Some(collect) = collect.filter(|collect| collect.field == name) {
                    path::append(&mut state.variables, &collect.key, value.clone());
                }
            }
        }
        if let Some(name) = target(fields::SET_GLOBAL) {
            path::assign(&mut state.variables, &name, value.clone());
        }
    }

    /// Drops the variables scoped to `thread`. Finished child threads are
    /// forgotten entirely; the main thread keeps its terminal state.
    pub fn reclaim(&self, thread: &str) {
        let mut state = self.state.lock();
        let prefix = format!("{thread}-");
        if let Value::Object(variables) = &mut state.variables {
            variables.retain(|key, _| !key.starts_with(&prefix));
        }
        if thread != runtime::MAIN_THREAD_ID
            && state.threads.get(thread) == Some(&ExecutionState::Finished)
        {
            state.threads.remove(thread);
            state.stacks.remove(thread);
            state.recovered.remove(thread);
            state.joins.remove(thread);
        }
        trace!(context = %self.id, thread = %thread, "reclaimed thread scope");
    }

    /// Marks that `thread` entered `exceptionally`. False when it already had.
    pub fn mark_recovered(&self, thread: &str) -> bool {
        self.state.lock().recovered.insert(thread.to_string())
    }

    /// Terminates `thread`: its stack is discarded and it becomes FINISHED.
    pub fn finish(&self, thread: &str) {
        self.mutate(|state, effects| {
            if let Some(stack) = state.stacks.get_mut(thread) {
                stack.clear();
            }
            Self::transition(state, effects, thread, ExecutionState::Finished);
        });
    }

    /// Resolves once the main thread is FINISHED.
    pub async fn wait_complete(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn close(&self) {
        self.listeners.unregister_listeners();
    }

    pub fn on_action(&self, listener: ActionListener) -> &Self {
        self.listeners.on_action(listener);
        self
    }

    pub fn on_state_change(&self, listener: StateListener) -> &Self {
        self.listeners.on_state_change(listener);
        self
    }

    pub fn on_exception(&self, listener: ExceptionListener) -> &Self {
        self.listeners.on_exception(listener);
        self
    }

    pub fn on_complete(&self, listener: CompleteListener) -> &Self {
        self.listeners.on_complete(listener);
        self
    }

    pub fn unregister_action(&self, listener: &ActionListener) {
        self.listeners.unregister_action(listener);
    }

    pub fn unregister_state_change(&self, listener: &StateListener) {
        self.listeners.unregister_state_change(listener);
    }

    pub fn unregister_exception(&self, listener: &ExceptionListener) {
        self.listeners.unregister_exception(listener);
    }

    pub fn unregister_complete(&self, listener: &CompleteListener) {
        self.listeners.unregister_complete(listener);
    }

    pub fn unregister_listeners(&self) {
        self.listeners.unregister_listeners();
    }

    pub(crate) fn notify_action(
        &self,
        node: &ActionNode,
        args: &Map<String, Value>,
        result: &ActionResult,
    ) {
        self.listeners.invoke_action(node, args, result);
    }

    pub(crate) fn notify_exception(&self, error: &FlowError) {
        self.listeners.invoke_exception(error);
    }
}
