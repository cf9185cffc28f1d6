//! crewtrace CLI: run the observer, inspect agent cards, tail events.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crewtrace_runtime::hooks::HookEvent;
use crewtrace_runtime::{Config, Runtime, SubscribeFilters};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "crewtrace", version, about = "Lifecycle observer for interactive coding-agent sessions")]
struct Cli {
    /// Path to the config file (defaults apply when absent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the timeline database
    #[arg(long, global = true, default_value = "crewtrace.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the observer: daemons on, events streamed to stdout as JSON
    Serve {
        /// Only print these event types (repeatable)
        #[arg(long = "type")]
        types: Vec<String>,
    },
    /// Show the current card for every active agent
    Status,
    /// List currently held advisory locks
    Locks,
    /// Replay a demo session against an in-memory runtime
    Simulate,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load_from(path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve { types } => serve(config, &cli.db, types),
        Command::Status => status(config, &cli.db),
        Command::Locks => locks(config, &cli.db),
        Command::Simulate => simulate(),
    }
}

fn serve(config: Config, db: &PathBuf, types: Vec<String>) -> Result<()> {
    let runtime = Runtime::builder(config).db_path(db).build()?;
    runtime.start();

    let subscription = runtime
        .subscribe(SubscribeFilters {
            types,
            ..Default::default()
        })
        .context("subscriber capacity exhausted")?;

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    eprintln!("crewtrace serving (db: {}); ctrl-c to stop", db.display());
    while running.load(Ordering::SeqCst) {
        if let Some(event) = subscription.next(Duration::from_millis(500)) {
            println!("{}", serde_json::to_string(&event)?);
        }
    }

    runtime.stop();
    Ok(())
}

fn status(config: Config, db: &PathBuf) -> Result<()> {
    let staleness = Duration::from_secs(config.active_timeout_minutes * 60);
    let runtime = Runtime::builder(config).db_path(db).build()?;

    let agents = runtime.list_active_agents(staleness)?;
    if agents.is_empty() {
        println!("No active agents.");
        return Ok(());
    }

    println!(
        "{:<6} {:<20} {:<16} {:<10} {:<12} {}",
        "ID".bold(),
        "PROJECT".bold(),
        "STATE".bold(),
        "UPTIME".bold(),
        "LAST SEEN".bold(),
        "TASK".bold()
    );
    for agent in agents {
        let card = runtime.get_card(agent.id)?;
        let state = match card.state.as_str() {
            "IDLE" => card.state.green().to_string(),
            "PROCESSING" => card.state.blue().to_string(),
            "AWAITING_INPUT" => card.state.yellow().to_string(),
            "TIMED_OUT" => card.state.red().to_string(),
            _ => card.state.clone(),
        };
        println!(
            "{:<6} {:<20} {:<16} {:<10} {:<12} {}",
            card.agent_id,
            card.project_name.as_deref().unwrap_or("-"),
            state,
            card.uptime,
            card.last_seen,
            card.task_summary
        );
    }
    Ok(())
}

fn locks(config: Config, db: &PathBuf) -> Result<()> {
    let runtime = Runtime::builder(config).db_path(db).build()?;
    let held = runtime.held_locks();
    if held.is_empty() {
        println!("No advisory locks held.");
        return Ok(());
    }
    for lock in held {
        println!(
            "{:<12} entity={:<8} thread={:<24} mode={:<8} held_for={:?}",
            lock.namespace.as_str(),
            lock.entity_id,
            lock.thread,
            lock.mode,
            lock.held_for
        );
    }
    Ok(())
}

/// A scripted command/question/answer/completion round trip against an
/// in-memory runtime, printing every broadcast event. Useful to verify an
/// installation end to end without a live agent.
fn simulate() -> Result<()> {
    use crewtrace_testing::TestWorld;

    let world = TestWorld::new();
    let subscription = world
        .runtime
        .subscribe(SubscribeFilters::default())
        .context("subscribe")?;

    let session = "simulated-session";
    world.runtime.ingest_session_start(&world.hook(session))?;

    let mut prompt: HookEvent = world.hook(session);
    prompt.text = Some("add a healthcheck endpoint".to_string());
    world.runtime.ingest_user_prompt_submit(&prompt)?;

    world.transcript.append_user("add a healthcheck endpoint");
    world
        .transcript
        .append_assistant("Should the endpoint require auth?");
    world.runtime.ingest_stop(&world.hook(session))?;

    let mut answer: HookEvent = world.hook(session);
    answer.text = Some("no, keep it public".to_string());
    world.runtime.ingest_user_prompt_submit(&answer)?;

    world.transcript.append_assistant("Done. All tests are passing");
    world.runtime.ingest_stop(&world.hook(session))?;
    world.runtime.ingest_session_end(&world.hook(session))?;

    while let Some(event) = subscription.next(Duration::from_millis(200)) {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
