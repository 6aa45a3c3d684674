use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flowscript::action::LogAction;
use flowscript::script::constants::builtin;
use flowscript::utils::LoggingConfig;
use flowscript::{ContextSnapshot, EngineConfig, FlowEngine, FlowError, Script};

#[derive(Parser)]
#[command(name = "flowscript", version, about = "Flow script runner", author)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a script until it finishes or parks on async work.
    Run {
        #[arg(long)]
        script: PathBuf,
        /// Initial variables, as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Where to write the resulting snapshot; printed when omitted.
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Seconds to wait for the main thread to finish.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Prints thread states and stack depths of a snapshot.
    Inspect { snapshot: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoggingConfig::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            script,
            args,
            snapshot,
            timeout,
        } => handle_run(script, args, snapshot, timeout).await?,
        Command::Inspect { snapshot } => handle_inspect(snapshot)?,
    }
    Ok(())
}

async fn handle_run(
    path: PathBuf,
    args: String,
    output: Option<PathBuf>,
    timeout: u64,
) -> anyhow::Result<()> {
    let script = Arc::new(
        Script::from_path(&path).with_context(|| format!("loading `{}`", path.display()))?,
    );
    script.register(builtin::LOG, Arc::new(LogAction));
    #[cfg(feature = "http-actions")]
    script.register(builtin::REST, Arc::new(flowscript::RestAction::new()?));

    let ctx = script.with(&args)?;
    ctx.on_exception(Arc::new(|error: &FlowError| eprintln!("error: {error}")));

    let engine = FlowEngine::with_config(EngineConfig::from_env()?);
    engine.run(&ctx).await;

    if tokio::time::timeout(Duration::from_secs(timeout), ctx.wait_complete())
        .await
        .is_err()
    {
        eprintln!("main thread still {:?} after {timeout}s", ctx.thread_states());
    }

    let snapshot = serde_json::to_string_pretty(&ctx.to_snapshot())?;
    match output {
        Some(output) => {
            fs::write(&output, snapshot)
                .with_context(|| format!("writing `{}`", output.display()))?;
            println!("Snapshot written to `{}`", output.display());
        }
        None => println!("{snapshot}"),
    }
    Ok(())
}

fn handle_inspect(path: PathBuf) -> anyhow::Result<()> {
    let text = fs::read_to_string(&path).with_context(|| format!("reading `{}`", path.display()))?;
    let snapshot: ContextSnapshot = serde_json::from_str(&text)?;

    println!("context {}", snapshot.context_id);
    println!("{:<24} {:<10} {}", "Thread", "State", "Frames");
    for (thread, state) in &snapshot.state.threads {
        let depth = snapshot.state.stacks.get(thread).map_or(0, Vec::len);
        println!("{:<24} {:<10} {}", thread, state.to_string(), depth);
    }
    for (master, children) in &snapshot.state.joins {
        let waiting: Vec<&str> = children.iter().map(String::as_str).collect();
        println!("{master} waits for {}", waiting.join(", "));
    }
    Ok(())
}
