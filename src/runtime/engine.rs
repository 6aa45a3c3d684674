use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{FlowError, Result};
use crate::script::constants::runtime::MAIN_THREAD_ID;
use crate::state::{ExecutionContext, ExecutionState};

use super::types::{Callback, Event};

/// 流程调度引擎
///
/// Stateless: every context carries its own execution state and dispatch
/// gate, so any number of engines can share any number of contexts.
#[derive(Clone, Default)]
pub struct FlowEngine {
    pub(super) config: EngineConfig,
}

impl FlowEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn with_max_stack_depth(mut self, depth: usize) -> Self {
        self.config.max_stack_depth = depth;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.config.max_concurrency = limit.max(1);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a NEW context.
    pub async fn run(&self, ctx: &Arc<ExecutionContext>) {
        self.dispatch(ctx, |ctx, live| {
            if live || ctx.thread_state(MAIN_THREAD_ID) != Some(ExecutionState::New) {
                return Err(FlowError::ScriptState("script already running".to_string()));
            }
            Ok(())
        })
        .await;
    }

    /// Delivers an async result to the thread waiting for it.
    pub async fn resume(&self, ctx: &Arc<ExecutionContext>, callback: Callback) {
        self.dispatch(ctx, |ctx, _| {
            ctx.complete_async(&callback.thread_id, callback.result)
        })
        .await;
    }

    /// Starts the hook registered for `event` on a fresh thread.
    pub async fn trigger(&self, ctx: &Arc<ExecutionContext>, event: Event) {
        self.dispatch(ctx, |ctx, _| self.start_hook(ctx, &event)).await;
    }

    /// Applies `admit` and makes sure a loop drives the context afterwards.
    async fn dispatch<F>(&self, ctx: &Arc<ExecutionContext>, admit: F)
    where
        F: FnOnce(&Arc<ExecutionContext>, bool) -> Result<()>,
    {
        let mut live = ctx.gate().lock().await;
        if let Err(rejected) = admit(ctx, *live) {
            warn!(context = %ctx.id(), error = %rejected, "dispatch rejected");
            ctx.notify_exception(&rejected);
            return;
        }
        if *live {
            return;
        }
        *live = true;
        let engine = self.clone();
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move { engine.drive(ctx).await });
    }

    async fn drive(self, ctx: Arc<ExecutionContext>) {
        info!(context = %ctx.id(), script = %ctx.script().name(), "flow loop started");
        loop {
            if !ctx.running() {
                let mut live = ctx.gate().lock().await;
                // a resume admitted after the check above is seen here
                if !ctx.running() {
                    *live = false;
                    debug!(context = %ctx.id(), "flow loop idle");
                    return;
                }
                continue;
            }
            self.round(&ctx).await;
        }
    }

    /// Steps every runnable thread until each one blocks or finishes.
    async fn round(&self, ctx: &Arc<ExecutionContext>) {
        let mut join_set: JoinSet<String> = JoinSet::new();
        let mut inflight = 0usize;

        for thread in ctx.runnable_threads() {
            if inflight >= self.config.max_concurrency {
                if let Some(joined) = join_set.join_next().await {
                    inflight -= 1;
                    Self::joined(ctx, joined);
                }
            }
            let engine = self.clone();
            let ctx = Arc::clone(ctx);
            join_set.spawn(async move {
                engine.run_thread(&ctx, &thread).await;
                thread
            });
            inflight += 1;
        }

        while let Some(joined) = join_set.join_next().await {
            Self::joined(ctx, joined);
        }
    }

    fn joined(ctx: &ExecutionContext, joined: std::result::Result<String, tokio::task::JoinError>) {
        match joined {
            Ok(thread) => debug!(context = %ctx.id(), thread = %thread, "thread parked"),
            Err(join_error) => {
                error!(context = %ctx.id(), error = %join_error, "thread task aborted")
            }
        }
    }
}
