use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use flowscript::{
    Action, ActionNode, ActionResult, Callback, ContextSnapshot, Event, ExecutionContext,
    ExecutionState, FlowEngine, FlowError, Result, Script, StackFrame,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Script with the test actions registered; `say` echoes its `text`.
fn script(document: Value) -> Arc<Script> {
    let script = Script::from_value(document).unwrap();
    script.register_fn("say", |_globals, args| {
        Ok(ActionResult::Value(args.get("text").cloned().unwrap_or(Value::Null)))
    });
    script.register_fn("expr", |_globals, args| {
        Ok(ActionResult::from(args.get("value") == Some(&json!("yes"))))
    });
    script.register_fn("ask", |_globals, _args| Ok(ActionResult::Value(Value::Null)));
    script.register_fn("boom", |_globals, _args| {
        Err(FlowError::Other(anyhow!("kaboom")))
    });
    Arc::new(script)
}

#[derive(Clone, Debug, PartialEq)]
struct Said {
    thread: String,
    text: Value,
}

/// Collects `say` calls in the order they happened.
fn record_says(ctx: &ExecutionContext) -> Arc<Mutex<Vec<Said>>> {
    let said = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&said);
    ctx.on_action(Arc::new(
        move |node: &ActionNode, args: &Map<String, Value>, _result: &ActionResult| {
            if node.label() != "say" {
                return;
            }
            sink.lock().push(Said {
                thread: args["threadId"].as_str().unwrap_or_default().to_string(),
                text: args["text"].clone(),
            });
        },
    ));
    said
}

fn texts(said: &Mutex<Vec<Said>>) -> Vec<Value> {
    said.lock().iter().map(|said| said.text.clone()).collect()
}

fn record_errors(ctx: &ExecutionContext) -> Arc<Mutex<Vec<String>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    ctx.on_exception(Arc::new(move |error: &FlowError| {
        let kind = match error {
            FlowError::Script { .. } => "script",
            FlowError::NotHandledScript { .. } => "unhandled",
            FlowError::ScriptState(_) => "state",
            _ => "other",
        };
        sink.lock().push(format!("{kind}: {}", error.root_cause()));
    }));
    errors
}

fn state_channel(ctx: &ExecutionContext) -> mpsc::UnboundedReceiver<(String, ExecutionState)> {
    let (tx, rx) = mpsc::unbounded_channel();
    ctx.on_state_change(Arc::new(move |thread: &str, state: ExecutionState| {
        let _ = tx.send((thread.to_string(), state));
    }));
    rx
}

async fn wait_for_state(
    rx: &mut mpsc::UnboundedReceiver<(String, ExecutionState)>,
    thread: &str,
    wanted: ExecutionState,
) -> anyhow::Result<Vec<ExecutionState>> {
    let mut seen = Vec::new();
    timeout(WAIT, async {
        while let Some((changed, state)) = rx.recv().await {
            if changed == thread {
                seen.push(state);
                if state == wanted {
                    return Ok(());
                }
            }
        }
        Err(anyhow!("state channel closed"))
    })
    .await??;
    Ok(seen)
}

async fn run_to_end(engine: &FlowEngine, ctx: &Arc<ExecutionContext>) -> anyhow::Result<()> {
    engine.run(ctx).await;
    timeout(WAIT, ctx.wait_complete()).await?;
    Ok(())
}

#[tokio::test]
async fn linear_sequence_runs_each_action_once_in_order() -> anyhow::Result<()> {
    let script = script(json!({
        "@id": "linear",
        "flow": [{ "@id": "main", "sequence": [
            { "action": "say", "args": { "text": "one" } },
            { "action": "say", "args": { "text": "two {{who}}" } },
            { "action": "say", "args": { "text": "three" } }
        ]}]
    }));
    let ctx = script.with(r#"{"who": "ben"}"#)?;
    let said = record_says(&ctx);

    run_to_end(&FlowEngine::new(), &ctx).await?;

    assert_eq!(texts(&said), vec![json!("one"), json!("two ben"), json!("three")]);
    assert!(said.lock().iter().all(|said| said.thread == "main"));
    assert_eq!(ctx.thread_state("main"), Some(ExecutionState::Finished));
    Ok(())
}

fn decision_script() -> Arc<Script> {
    script(json!({
        "@id": "decision",
        "flow": [
            { "@id": "main", "sequence": [
                {
                    "decision": "expr",
                    "args": { "value": "{{answer}}" },
                    "do": { "sequence": "yes", "args": { "greeting": "hi {{user}}" } },
                    "else": { "sequence": "no" }
                },
                { "action": "say", "args": { "text": "after" } }
            ]},
            { "@id": "yes", "sequence": [{ "action": "say", "args": { "text": "{{greeting}}" } }] },
            { "@id": "no", "sequence": [{ "action": "say", "args": { "text": "no" } }] }
        ]
    }))
}

#[tokio::test]
async fn decision_takes_do_or_else() -> anyhow::Result<()> {
    let engine = FlowEngine::new();

    let yes = decision_script().with(r#"{"answer": "yes", "user": "ben"}"#)?;
    let said = record_says(&yes);
    run_to_end(&engine, &yes).await?;
    assert_eq!(texts(&said), vec![json!("hi ben"), json!("after")]);

    let no = decision_script().with(r#"{"answer": "nope"}"#)?;
    let said = record_says(&no);
    run_to_end(&engine, &no).await?;
    assert_eq!(texts(&said), vec![json!("no"), json!("after")]);
    Ok(())
}

#[tokio::test]
async fn true_decision_schedules_only_the_do_block() -> anyhow::Result<()> {
    let engine = FlowEngine::new();
    let ctx = decision_script().with(r#"{"answer": "yes", "user": "ben"}"#)?;
    let said = record_says(&ctx);

    engine.execute_one_step(&ctx, "main").await?;
    engine.execute_one_step(&ctx, "main").await?;

    assert_eq!(
        ctx.current_frame("main"),
        Some(StackFrame::Entry {
            path: "main-main-yes-".into(),
            sequence_id: "yes".into(),
            iteration: None,
        })
    );
    assert_eq!(ctx.get_variable("main-main-yes-greeting"), Some(json!("hi ben")));
    assert!(said.lock().is_empty());
    Ok(())
}

fn async_script() -> Arc<Script> {
    script(json!({
        "@id": "async",
        "flow": [{ "@id": "main", "sequence": [
            { "action": "ask", "args": { "async": true, "set": "answer" } },
            { "action": "say", "args": { "text": "got {{answer}}" } }
        ]}]
    }))
}

#[tokio::test]
async fn async_action_parks_until_its_callback() -> anyhow::Result<()> {
    let engine = FlowEngine::new();
    let ctx = async_script().with("{}")?;
    let said = record_says(&ctx);
    let mut states = state_channel(&ctx);

    engine.run(&ctx).await;
    let before = wait_for_state(&mut states, "main", ExecutionState::Waiting).await?;
    assert_eq!(before, vec![ExecutionState::Running, ExecutionState::Waiting]);
    assert!(said.lock().is_empty());
    assert!(matches!(ctx.current_frame("main"), Some(StackFrame::Action { .. })));

    engine.resume(&ctx, Callback::new("main", json!("42"))).await;
    let after = wait_for_state(&mut states, "main", ExecutionState::Finished).await?;
    assert_eq!(after, vec![ExecutionState::Running, ExecutionState::Finished]);
    assert_eq!(texts(&said), vec![json!("got 42")]);
    Ok(())
}

#[tokio::test]
async fn snapshot_of_a_parked_context_resumes_elsewhere() -> anyhow::Result<()> {
    let engine = FlowEngine::new();
    let script = async_script();
    let ctx = script.with("{}")?;
    let mut states = state_channel(&ctx);

    engine.run(&ctx).await;
    wait_for_state(&mut states, "main", ExecutionState::Waiting).await?;

    let file = tempfile::NamedTempFile::new()?;
    std::fs::write(file.path(), ctx.to_json()?)?;
    let snapshot: ContextSnapshot = serde_json::from_str(&std::fs::read_to_string(file.path())?)?;
    assert_eq!(snapshot.main_state(), Some(ExecutionState::Waiting));

    let restored = ExecutionContext::load_with_script(snapshot, Arc::clone(&script))?;
    let said = record_says(&restored);
    let callback: Callback = r#"{"id": "cb-1", "threadId": "main", "result": "from disk"}"#.parse()?;
    engine.resume(&restored, callback).await;
    timeout(WAIT, restored.wait_complete()).await?;

    assert_eq!(texts(&said), vec![json!("got from disk")]);
    assert_eq!(ctx.thread_state("main"), Some(ExecutionState::Waiting));
    Ok(())
}

#[tokio::test]
async fn hooks_run_on_their_own_thread() -> anyhow::Result<()> {
    let engine = FlowEngine::new();
    let script = script(json!({
        "@id": "hooks",
        "flow": [
            { "@id": "main", "sequence": [{ "action": "ask", "args": { "async": true } }] },
            { "@id": "bye", "sequence": [{ "action": "say", "args": { "text": "bye {{reason}}" } }] }
        ],
        "hooks": [
            { "event": "hangup", "action": "run", "do": { "sequence": "bye", "args": { "reason": "{{why}}" } } },
            { "event": "main-x", "action": "run", "do": { "sequence": "bye" } }
        ]
    }));
    let ctx = script.with("{}")?;
    let mut states = state_channel(&ctx);
    let errors = record_errors(&ctx);

    engine.run(&ctx).await;
    wait_for_state(&mut states, "main", ExecutionState::Waiting).await?;

    let said = record_says(&ctx);
    engine
        .trigger(&ctx, Event::new("hangup").with_arg("why", json!("timeout")))
        .await;
    wait_for_state(&mut states, "hangup#1", ExecutionState::Finished).await?;

    let said = said.lock().clone();
    assert_eq!(said.len(), 1);
    assert_eq!(said[0].thread, "hangup#1");
    assert_eq!(said[0].text, json!("bye timeout"));
    assert_eq!(ctx.thread_state("main"), Some(ExecutionState::Waiting));

    engine.trigger(&ctx, Event::new("dtmf")).await;
    assert_eq!(errors.lock().len(), 1);
    assert!(errors.lock()[0].starts_with("state:"));

    // a thread named `main-x#2` would share the `main-` variable scope
    engine.trigger(&ctx, Event::new("main-x")).await;
    assert_eq!(errors.lock().len(), 2);
    assert!(errors.lock()[1].starts_with("state:"));
    assert_eq!(ctx.thread_state("main-x#2"), None);
    Ok(())
}

#[tokio::test]
async fn serial_for_each_reuses_the_calling_thread() -> anyhow::Result<()> {
    let script = script(json!({
        "@id": "serial",
        "flow": [
            { "@id": "main", "sequence": [
                {
                    "action": "forEach",
                    "args": { "iterateOver": "items", "setElement": "item", "set": "results" },
                    "do": { "sequence": "each" }
                },
                { "action": "say", "args": { "text": "{{results}}" } }
            ]},
            { "@id": "each", "sequence": [
                { "action": "say", "args": { "text": "item {{item}}", "set": "results" } }
            ]}
        ]
    }));
    let ctx = script.with(r#"{"items": ["a", "b", "c"]}"#)?;
    let said = record_says(&ctx);

    run_to_end(&FlowEngine::new(), &ctx).await?;

    assert_eq!(
        texts(&said),
        vec![
            json!("item a"),
            json!("item b"),
            json!("item c"),
            json!(["item a", "item b", "item c"]),
        ]
    );
    assert!(said.lock().iter().all(|said| said.thread == "main"));
    Ok(())
}

/// Sleeps longer for every element but `a`, so spawned threads finish after
/// the master's own element.
struct Slow;

#[async_trait]
impl Action for Slow {
    async fn execute(&self, _globals: &Value, args: &Map<String, Value>) -> Result<ActionResult> {
        let item = args.get("text").cloned().unwrap_or(Value::Null);
        if item != json!("a") {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(ActionResult::Value(item))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_for_each_joins_before_the_master_continues() -> anyhow::Result<()> {
    let script = script(json!({
        "@id": "parallel",
        "flow": [
            { "@id": "main", "sequence": [
                {
                    "action": "forEach",
                    "args": { "iterateOver": "items", "setElement": "item", "parallel": true, "set": "results" },
                    "do": { "sequence": "each" }
                },
                { "action": "say", "args": { "text": "returned from iterations" } }
            ]},
            { "@id": "each", "sequence": [
                { "action": "slow", "args": { "text": "{{item}}", "set": "results" } },
                { "action": "say", "args": { "text": "{{item}}" } }
            ]}
        ]
    }));
    script.register("slow", Arc::new(Slow));
    let ctx = script.with(r#"{"items": ["a", "b", "c"]}"#)?;
    let said = record_says(&ctx);

    run_to_end(&FlowEngine::new(), &ctx).await?;

    let said = said.lock().clone();
    assert_eq!(said.len(), 4);
    assert_eq!(said[0].text, json!("a"));
    assert_eq!(said[3].text, json!("returned from iterations"));
    assert_eq!(said[3].thread, "main");

    let elements: BTreeSet<String> = said[..3]
        .iter()
        .filter_map(|said| said.text.as_str().map(str::to_string))
        .collect();
    assert_eq!(elements, BTreeSet::from(["a".into(), "b".into(), "c".into()]));

    let threads: BTreeSet<&str> = said.iter().map(|said| said.thread.as_str()).collect();
    assert_eq!(threads, BTreeSet::from(["main", "main#1", "main#2"]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engines_share_the_context_gate() -> anyhow::Result<()> {
    let script = script(json!({
        "@id": "two-engines",
        "flow": [
            { "@id": "main", "sequence": [
                { "action": "slow", "args": { "text": "x" } },
                { "action": "say", "args": { "text": "one" } },
                { "action": "slow", "args": { "text": "x" } },
                { "action": "say", "args": { "text": "two" } }
            ]},
            { "@id": "pong", "sequence": [{ "action": "say", "args": { "text": "pong" } }] }
        ],
        "hooks": [{ "event": "ping", "action": "run", "do": { "sequence": "pong" } }]
    }));
    script.register("slow", Arc::new(Slow));
    let ctx = script.with("{}")?;
    let said = record_says(&ctx);
    let mut states = state_channel(&ctx);

    FlowEngine::new().run(&ctx).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    FlowEngine::new().trigger(&ctx, Event::new("ping")).await;

    timeout(WAIT, ctx.wait_complete()).await?;
    wait_for_state(&mut states, "ping#1", ExecutionState::Finished).await?;

    let said = said.lock().clone();
    let on = |thread: &str| -> Vec<Value> {
        said.iter()
            .filter(|said| said.thread == thread)
            .map(|said| said.text.clone())
            .collect()
    };
    assert_eq!(on("main"), vec![json!("one"), json!("two")]);
    assert_eq!(on("ping#1"), vec![json!("pong")]);
    Ok(())
}

#[tokio::test]
async fn single_steps_are_refused_while_a_loop_runs() -> anyhow::Result<()> {
    let script = script(json!({
        "@id": "busy",
        "flow": [{ "@id": "main", "sequence": [{ "action": "slow", "args": { "text": "x" } }] }]
    }));
    script.register("slow", Arc::new(Slow));
    let ctx = script.with("{}")?;
    let engine = FlowEngine::new();

    engine.run(&ctx).await;
    let refused = engine.execute_one_step(&ctx, "main").await;
    assert!(matches!(refused, Err(FlowError::ScriptState(_))));

    timeout(WAIT, ctx.wait_complete()).await?;
    Ok(())
}

/// Async action that delivers its own callback before returning.
struct CallsBack {
    engine: FlowEngine,
    ctx: OnceCell<Arc<ExecutionContext>>,
}

#[async_trait]
impl Action for CallsBack {
    async fn execute(&self, _globals: &Value, args: &Map<String, Value>) -> Result<ActionResult> {
        let ctx = self
            .ctx
            .get()
            .ok_or_else(|| FlowError::Other(anyhow!("context not attached")))?;
        let thread = args["threadId"].as_str().unwrap_or_default();
        self.engine
            .resume(ctx, Callback::new(thread, json!("inline")))
            .await;
        Ok(ActionResult::Value(Value::Null))
    }
}

#[tokio::test]
async fn callback_delivered_inside_the_async_action_is_accepted() -> anyhow::Result<()> {
    let engine = FlowEngine::new();
    let script = script(json!({
        "@id": "inline-callback",
        "flow": [{ "@id": "main", "sequence": [
            { "action": "callsBack", "args": { "async": true, "set": "answer" } },
            { "action": "say", "args": { "text": "got {{answer}}" } }
        ]}]
    }));
    let action = Arc::new(CallsBack {
        engine: engine.clone(),
        ctx: OnceCell::new(),
    });
    script.register("callsBack", action.clone());
    let ctx = script.with("{}")?;
    let _ = action.ctx.set(Arc::clone(&ctx));
    let said = record_says(&ctx);
    let errors = record_errors(&ctx);
    let mut states = state_channel(&ctx);

    engine.run(&ctx).await;
    let seen = wait_for_state(&mut states, "main", ExecutionState::Finished).await?;

    assert_eq!(
        seen,
        vec![
            ExecutionState::Running,
            ExecutionState::Waiting,
            ExecutionState::Running,
            ExecutionState::Finished,
        ]
    );
    assert!(errors.lock().is_empty());
    assert_eq!(texts(&said), vec![json!("got inline")]);
    Ok(())
}

fn menu_script() -> Arc<Script> {
    script(json!({
        "@id": "menu",
        "flow": [
            { "@id": "main", "sequence": [{
                "action": "menu",
                "args": {
                    "text": "{{input}}",
                    "options": [
                        { "code": "1000", "do": { "sequence": "greet" } },
                        { "code": "2000", "similar": ["quit"], "do": { "sequence": "quit" } }
                    ]
                },
                "else": { "sequence": "retry" }
            }]},
            { "@id": "greet", "sequence": [{ "action": "say", "args": { "text": "greeted" } }] },
            { "@id": "quit", "sequence": [{ "action": "say", "args": { "text": "bye" } }] },
            { "@id": "retry", "sequence": [{ "action": "say", "args": { "text": "retry" } }] }
        ]
    }))
}

#[tokio::test]
async fn menu_matches_padded_codes_and_falls_back_to_else() -> anyhow::Result<()> {
    let engine = FlowEngine::new();

    let padded = menu_script().with(r#"{"input": " 1000 "}"#)?;
    let said = record_says(&padded);
    run_to_end(&engine, &padded).await?;
    assert_eq!(texts(&said), vec![json!("greeted")]);

    let alias = menu_script().with(r#"{"input": "QUIT"}"#)?;
    let said = record_says(&alias);
    run_to_end(&engine, &alias).await?;
    assert_eq!(texts(&said), vec![json!("bye")]);

    let unknown = menu_script().with(r#"{"input": "42"}"#)?;
    let said = record_says(&unknown);
    run_to_end(&engine, &unknown).await?;
    assert_eq!(texts(&said), vec![json!("retry")]);
    Ok(())
}

#[tokio::test]
async fn exit_finishes_the_thread_immediately() -> anyhow::Result<()> {
    let script = script(json!({
        "@id": "exit",
        "flow": [{ "@id": "main", "sequence": [
            { "action": "say", "args": { "text": "before" } },
            { "action": "exit" },
            { "action": "say", "args": { "text": "never" } }
        ]}]
    }));
    let ctx = script.with("{}")?;
    let said = record_says(&ctx);

    run_to_end(&FlowEngine::new(), &ctx).await?;

    assert_eq!(texts(&said), vec![json!("before")]);
    assert_eq!(ctx.stack_depth("main"), 0);
    Ok(())
}

#[tokio::test]
async fn runaway_recursion_overflows_the_stack() -> anyhow::Result<()> {
    let script = script(json!({
        "@id": "recursion",
        "flow": [{ "@id": "main", "sequence": [
            { "action": "run", "do": { "sequence": "main" } }
        ]}]
    }));
    let ctx = script.with("{}")?;
    let errors = record_errors(&ctx);
    let engine = FlowEngine::new().with_max_stack_depth(5);

    run_to_end(&engine, &ctx).await?;

    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 2);
    assert!(errors[0].starts_with("script: script stack overflow"));
    assert!(errors[1].starts_with("unhandled: script stack overflow"));
    Ok(())
}

#[tokio::test]
async fn exceptionally_is_entered_at_most_once_per_thread() -> anyhow::Result<()> {
    let script = script(json!({
        "@id": "recover",
        "flow": [
            { "@id": "main", "sequence": [
                { "action": "boom" },
                { "action": "say", "args": { "text": "unreachable" } }
            ]},
            { "@id": "recover", "sequence": [
                { "action": "say", "args": { "text": "recovered {{exception.message}}" } },
                { "action": "boom" }
            ]}
        ],
        "exceptionally": { "action": "run", "do": { "sequence": "recover" } }
    }));
    let ctx = script.with("{}")?;
    let said = record_says(&ctx);
    let errors = record_errors(&ctx);

    run_to_end(&FlowEngine::new(), &ctx).await?;

    assert_eq!(texts(&said), vec![json!("recovered kaboom")]);
    assert_eq!(
        *errors.lock(),
        vec![
            "script: kaboom".to_string(),
            "script: kaboom".to_string(),
            "unhandled: kaboom".to_string(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn unknown_actions_and_malformed_nodes_are_reported() -> anyhow::Result<()> {
    let script = script(json!({
        "@id": "broken",
        "flow": [{ "@id": "main", "sequence": [{ "action": "nobody" }] }]
    }));
    let ctx = script.with("{}")?;
    let errors = record_errors(&ctx);
    run_to_end(&FlowEngine::new(), &ctx).await?;
    assert_eq!(errors.lock()[0], "script: action is not registered: [nobody]");

    let script = self::script(json!({
        "@id": "malformed",
        "flow": [{ "@id": "main", "sequence": [{ "args": { "text": "?" } }] }]
    }));
    let ctx = script.with("{}")?;
    let errors = record_errors(&ctx);
    run_to_end(&FlowEngine::new(), &ctx).await?;
    assert!(errors.lock()[0].starts_with("script: object is neither"));
    Ok(())
}

#[tokio::test]
async fn api_misuse_is_reported_not_raised() -> anyhow::Result<()> {
    let engine = FlowEngine::new();
    let script = script(json!({
        "@id": "misuse",
        "flow": [{ "@id": "main", "sequence": [{ "action": "say", "args": { "text": "once" } }] }]
    }));
    let ctx = script.with("{}")?;
    let errors = record_errors(&ctx);

    run_to_end(&engine, &ctx).await?;
    engine.run(&ctx).await;
    engine.resume(&ctx, Callback::new("main", json!(1))).await;
    engine.trigger(&ctx, Event::new("anything")).await;

    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|error| error.starts_with("state:")));
    Ok(())
}
