use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::trace;

use crate::action::{ActionResult, ForEachMarker};
use crate::error::{FlowError, Result};
use crate::script::constants::{args as fields, runtime};
use crate::script::ActionNode;
use crate::state::{CollectTarget, ExecutionContext, Iteration, StackFrame};
use crate::utils::bind_vars;

use super::engine::FlowEngine;

/// forEach request carried into the expansion of a `do` block.
pub(super) struct IterationSeed {
    pub marker: ForEachMarker,
    pub collect: Option<CollectTarget>,
}

impl FlowEngine {
    /// Schedules the `do` (`outcome == true`) or `else` block of `node`.
    ///
    /// Block args are bound against `overrides`, the globals, then the
    /// caller's scope, and materialized, with the overrides, as locals of the
    /// new scope `<scope><sequence>-`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn expand_block(
        &self,
        ctx: &Arc<ExecutionContext>,
        thread: &str,
        node: &ActionNode,
        outcome: bool,
        overrides: &Map<String, Value>,
        scope: Option<&str>,
        iteration: Option<IterationSeed>,
    ) -> Result<()> {
        let Some(block) = node.block(outcome)? else {
            return Ok(());
        };

        let depth = ctx.stack_depth(thread);
        if depth > self.config.max_stack_depth {
            return Err(FlowError::ScriptStackOverflow {
                depth,
                limit: self.config.max_stack_depth,
            });
        }

        let sequence_id = block.sequence.clone().ok_or_else(|| {
            FlowError::NotValidObject(format!(
                "`{}` block of `{}` names no sequence",
                if outcome { "do" } else { "else" },
                node.label()
            ))
        })?;

        let scope = scope.map_or_else(|| format!("{thread}-"), str::to_string);
        let path = format!("{scope}{sequence_id}-");

        let mut args = block.args;
        bind_vars("", &mut args, &Value::Object(overrides.clone()), false);
        let globals = ctx.variables();
        bind_vars("", &mut args, &globals, false);
        bind_vars(&scope, &mut args, &globals, true);

        materialize(ctx, &path, overrides);
        materialize(ctx, &path, &args);

        let iteration = iteration.map(|seed| Iteration {
            elements: seed.marker.elements.into(),
            element_var: seed.marker.element_field,
            parallel: seed.marker.parallel,
            base_path: path.clone(),
            next_index: 0,
            block_args: args,
            collect: seed.collect,
        });

        trace!(context = %ctx.id(), thread = %thread, path = %path, sequence = %sequence_id, "expand block");
        ctx.push(
            thread,
            StackFrame::Entry {
                path,
                sequence_id,
                iteration,
            },
        );
        Ok(())
    }

    /// Opens `sequence_id` at `path`, unrolling one forEach element first.
    pub(super) fn open_sequence(
        &self,
        ctx: &Arc<ExecutionContext>,
        thread: &str,
        path: String,
        sequence_id: String,
        iteration: Option<Iteration>,
    ) -> Result<()> {
        if ctx.script().sequence(&sequence_id).is_none() {
            return Err(FlowError::SequenceNotFound(sequence_id));
        }

        if let Some(mut iteration) = iteration {
            let Some(element) = iteration.elements.pop_front() else {
                trace!(context = %ctx.id(), thread = %thread, path = %path, "nothing to iterate");
                return Ok(());
            };
            bind_element(ctx, &path, &iteration, element);

            if iteration.parallel {
                ctx.push(thread, StackFrame::Join { path: path.clone() });
                while let Some(element) = iteration.elements.pop_front() {
                    let child = ctx.allocate_thread_id(thread);
                    let child_path = format!("{child}-{sequence_id}-");
                    materialize(ctx, &child_path, &iteration.block_args);
                    bind_element(ctx, &child_path, &iteration, element);
                    ctx.spawn_thread(
                        &child,
                        Some(thread),
                        StackFrame::Start {
                            path: child_path,
                            sequence_id: sequence_id.clone(),
                        },
                    );
                    trace!(context = %ctx.id(), master = %thread, thread = %child, "spawned iteration thread");
                }
            } else if !iteration.elements.is_empty() {
                iteration.next_index += 1;
                let next_path = iteration.path_for(iteration.next_index);
                materialize(ctx, &next_path, &iteration.block_args);
                ctx.push(
                    thread,
                    StackFrame::Entry {
                        path: next_path,
                        sequence_id: sequence_id.clone(),
                        iteration: Some(iteration),
                    },
                );
            }
        }

        ctx.push(thread, StackFrame::Start { path, sequence_id });
        Ok(())
    }

    /// Branches on a non-async action result.
    pub(super) fn process_result(
        &self,
        ctx: &Arc<ExecutionContext>,
        thread: &str,
        path: &str,
        node: &ActionNode,
        args: &Map<String, Value>,
        result: &ActionResult,
    ) -> Result<()> {
        if result.is_exit() {
            ctx.finish(thread);
            ctx.reclaim(thread);
            return Ok(());
        }

        let none = Map::new();
        match result {
            ActionResult::Value(Value::Bool(outcome)) => {
                self.expand_block(ctx, thread, node, *outcome, &none, Some(path), None)
            }
            ActionResult::ForEach(marker) => {
                let collect = args
                    .get(fields::SET)
                    .and_then(Value::as_str)
                    .filter(|name| !name.is_empty())
                    .map(|name| CollectTarget {
                        key: format!("{path}{name}"),
                        field: name.to_string(),
                    });
                let seed = IterationSeed {
                    marker: marker.clone(),
                    collect,
                };
                self.expand_block(ctx, thread, node, true, &none, Some(path), Some(seed))
            }
            ActionResult::Menu(menu) => match &menu.option {
                Some(option) => {
                    let chosen: ActionNode = serde_json::from_value(option.clone())?;
                    self.expand_block(ctx, thread, &chosen, true, &none, Some(path), None)
                }
                None => self.expand_block(ctx, thread, node, false, &none, Some(path), None),
            },
            _ => Ok(()),
        }
    }
}

fn materialize(ctx: &ExecutionContext, path: &str, values: &Map<String, Value>) {
    for (key, value) in values {
        ctx.set_variable(&format!("{path}{key}"), value.clone());
    }
}

fn bind_element(ctx: &ExecutionContext, path: &str, iteration: &Iteration, element: Value) {
    ctx.set_variable(&format!("{path}{}", iteration.element_var), element);
    if let Some(collect) = &iteration.collect {
        if let Ok(marker) = serde_json::to_value(collect) {
            ctx.set_variable(&format!("{path}{}", runtime::COLLECT_FIELD), marker);
        }
    }
}
