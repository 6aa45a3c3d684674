use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::action::ActionResult;
use crate::error::{FlowError, Result};
use crate::script::constants::{args as fields, runtime};
use crate::script::ActionNode;
use crate::state::{ExecutionContext, ExecutionState, FramePointer, StackFrame};
use crate::utils::bind_vars;

use super::engine::FlowEngine;
use super::types::Event;

/// Where a node sits and what it is.
pub(super) struct Located {
    pub path: String,
    pub sequence_id: String,
    pub action_index: usize,
    pub node: ActionNode,
}

impl FlowEngine {
    /// Runs steps for `thread` while it stays runnable.
    pub(super) async fn run_thread(&self, ctx: &Arc<ExecutionContext>, thread: &str) {
        while ctx.is_runnable(thread) {
            let step = AssertUnwindSafe(self.step(ctx, thread))
                .catch_unwind()
                .await;
            let outcome = step.unwrap_or_else(|panic| {
                Err(FlowError::Other(anyhow!(
                    "step panicked: {}",
                    panic_message(&*panic)
                )))
            });
            if let Err(failure) = outcome {
                self.handle_step_error(ctx, thread, failure);
            }
            tokio::task::yield_now().await;
        }
    }

    /// Resolves and runs exactly one continuation of `thread` outside any
    /// loop. Fails with `ScriptState` while a loop drives `ctx`. The gate is
    /// held for the whole step, so the action must not call back into an
    /// engine for the same context.
    pub async fn execute_one_step(&self, ctx: &Arc<ExecutionContext>, thread: &str) -> Result<()> {
        let live = ctx.gate().lock().await;
        if *live {
            return Err(FlowError::ScriptState(format!(
                "context `{}` is driven by a running loop",
                ctx.id()
            )));
        }
        let outcome = self.step(ctx, thread).await;
        drop(live);
        outcome
    }

    /// One continuation of `thread`; callers hold the dispatch gate or are
    /// the loop it admitted.
    pub(super) async fn step(&self, ctx: &Arc<ExecutionContext>, thread: &str) -> Result<()> {
        match ctx.next(thread)? {
            None => {
                if ctx.stack_depth(thread) == 0
                    && ctx.thread_state(thread) == Some(ExecutionState::Finished)
                {
                    ctx.reclaim(thread);
                }
                Ok(())
            }
            Some(FramePointer::Entry {
                path,
                sequence_id,
                iteration,
            }) => self.open_sequence(ctx, thread, path, sequence_id, iteration),
            Some(FramePointer::Action {
                path,
                sequence_id,
                action_index,
                node,
            }) => {
                let located = Located {
                    path,
                    sequence_id,
                    action_index,
                    node,
                };
                self.run_action(ctx, thread, located).await
            }
        }
    }

    async fn run_action(
        &self,
        ctx: &Arc<ExecutionContext>,
        thread: &str,
        located: Located,
    ) -> Result<()> {
        let Located {
            path,
            sequence_id,
            action_index,
            node,
        } = located;

        let mut args = node.args.clone();
        args.insert(fields::THREAD_ID.to_string(), Value::String(thread.to_string()));
        args.insert(fields::PATH.to_string(), Value::String(path.clone()));
        let globals = ctx.variables();
        bind_vars("", &mut args, &globals, false);
        bind_vars(&path, &mut args, &globals, true);

        let name = node.kind()?.name().to_string();
        let action = ctx
            .script()
            .action(&name)
            .ok_or_else(|| FlowError::ActionNotFound(name.clone()))?;
        let frame = |result: Value| StackFrame::Action {
            path: path.clone(),
            sequence_id: sequence_id.clone(),
            action_index,
            args: args.clone(),
            result,
        };

        debug!(context = %ctx.id(), thread = %thread, action = %name, index = action_index, "executing action");

        if node.is_async() {
            ctx.begin_async(thread, frame(Value::Null));
            let result = action.execute(&globals, &args).await?;
            ctx.notify_action(&node, &args, &result);
            return Ok(());
        }

        let result = action.execute(&globals, &args).await?;
        let stored = match &result {
            ActionResult::ForEach(_) => Value::Array(Vec::new()),
            ActionResult::Exit => Value::Null,
            ActionResult::Menu(menu) => menu.option.clone().unwrap_or(Value::Null),
            ActionResult::Value(value) => value.clone(),
        };
        let accumulate = !matches!(result, ActionResult::ForEach(_));
        ctx.commit_action(thread, frame(result.to_value()), &stored, accumulate);

        self.process_result(ctx, thread, &path, &node, &args, &result)?;
        ctx.notify_action(&node, &args, &result);
        Ok(())
    }

    /// Reports a failed step, then recovers through `exceptionally` once per
    /// thread or finishes the thread.
    pub(super) fn handle_step_error(
        &self,
        ctx: &Arc<ExecutionContext>,
        thread: &str,
        failure: FlowError,
    ) {
        let failure = FlowError::script(thread, failure);
        warn!(context = %ctx.id(), thread = %thread, error = %failure, "step failed");
        ctx.notify_exception(&failure);

        let Some(handler) = ctx.script().exceptionally().cloned() else {
            return Self::fail_thread(ctx, thread, failure);
        };
        if !ctx.mark_recovered(thread) {
            return Self::fail_thread(ctx, thread, failure);
        }

        ctx.clear_stack(thread);
        if ctx.thread_state(thread) != Some(ExecutionState::Running) {
            ctx.set_thread_state(thread, ExecutionState::Running);
        }

        let mut overrides = Map::new();
        overrides.insert(
            runtime::EXCEPTION.to_string(),
            json!({
                "message": failure.root_cause().to_string(),
                "cause": failure.to_string(),
            }),
        );
        match self.expand_block(ctx, thread, &handler, true, &overrides, None, None) {
            Ok(()) => info!(context = %ctx.id(), thread = %thread, "recovering through exceptionally"),
            Err(nested) => {
                let nested = FlowError::script(thread, nested);
                ctx.notify_exception(&nested);
                Self::fail_thread(ctx, thread, nested);
            }
        }
    }

    fn fail_thread(ctx: &ExecutionContext, thread: &str, failure: FlowError) {
        error!(context = %ctx.id(), thread = %thread, error = %failure, "unhandled script error");
        ctx.finish(thread);
        ctx.reclaim(thread);
        ctx.notify_exception(&FlowError::not_handled(thread, failure));
    }

    /// Admission half of `trigger`: schedules the hook on a new thread.
    pub(super) fn start_hook(&self, ctx: &Arc<ExecutionContext>, event: &Event) -> Result<()> {
        if ctx.is_finished() {
            return Err(FlowError::ScriptState(format!(
                "script finished, event `{}` ignored",
                event.name
            )));
        }
        let hook = ctx.script().hook(&event.name).cloned().ok_or_else(|| {
            FlowError::ScriptState(format!("no hook handles event `{}`", event.name))
        })?;

        if event.name.contains(runtime::SCOPE_SEPARATOR) {
            return Err(FlowError::ScriptState(format!(
                "event `{}` must not contain `{}`",
                event.name,
                runtime::SCOPE_SEPARATOR
            )));
        }
        let thread = ctx.allocate_thread_id(&event.name);
        if let Err(failure) = self.expand_block(ctx, &thread, &hook.node, true, &event.args, None, None)
        {
            ctx.clear_stack(&thread);
            return Err(failure);
        }
        ctx.set_thread_state(&thread, ExecutionState::Running);
        debug!(context = %ctx.id(), thread = %thread, event = %event.name, "hook scheduled");
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = panic.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic".to_string()
}
