use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use swarm::agent::AgentCommand;
use swarm::config::{expand_tilde, Config, RunnerConfig};
use swarm::core::{PromptSource, Task};
use swarm::orchestration::{
    DetachedSpawner, FilePromptResolver, LaunchOutcome, ProcessAgent, TaskRunner, UnitOutcome,
    WriterGroup, AGENT_SUBCOMMAND,
};
use swarm::state::control::{self, WaitOptions, WaitState};
use swarm::state::{
    AgentId, AgentRecord, AgentStore, FileStore, Scope, SharedStore, TerminateMode,
};
use swarm::{Error, Result};

/// Swarm - run and control AI coding agents
#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    SWARM_DEBUG=1   Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.swarm/swarm.log)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Operate on agents from every directory, not just this one
    #[arg(short = 'g', long, global = true)]
    pub global: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List agents
    List {
        /// Include terminated agents
        #[arg(short, long)]
        all: bool,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Pause an agent at its next iteration boundary
    Pause {
        /// Agent id, name, or @last
        agent: String,
    },

    /// Resume a paused agent
    Resume { agent: String },

    /// Stop an agent
    Kill {
        agent: String,

        /// Let the current iteration finish first
        #[arg(long)]
        after_iteration: bool,
    },

    /// Change a running agent's iteration count or model
    Update {
        agent: String,

        /// New iteration count (0 runs until stopped)
        #[arg(short = 'n', long)]
        iterations: Option<u32>,

        #[arg(short, long)]
        model: Option<String>,
    },

    /// Wait for agents to terminate
    Wait {
        #[arg(required = true)]
        agents: Vec<String>,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Seconds between checks
        #[arg(long, default_value_t = 1)]
        interval: u64,

        /// Return when the first agent terminates
        #[arg(long)]
        any: bool,
    },

    /// Run a task
    Run(RunArgs),

    #[command(name = "__agent", hide = true)]
    Agent {
        #[arg(long)]
        id: String,

        #[arg(long)]
        prompt_file: PathBuf,

        #[arg(long)]
        state_dir: PathBuf,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Named prompt from ./swarm/prompts
    #[arg(conflicts_with_all = ["prompt_string", "prompt_file"])]
    pub prompt: Option<String>,

    /// Inline prompt text
    #[arg(short = 's', long)]
    pub prompt_string: Option<String>,

    /// Prompt file path
    #[arg(short = 'f', long)]
    pub prompt_file: Option<PathBuf>,

    /// Agent name (defaults to the prompt name)
    #[arg(short = 'N', long)]
    pub name: Option<String>,

    #[arg(short, long)]
    pub model: Option<String>,

    /// Iterations (0 runs until stopped)
    #[arg(short = 'n', long)]
    pub iterations: Option<u32>,

    /// Run in the background and return immediately
    #[arg(short, long)]
    pub detach: bool,
}

fn main() {
    let cli = Cli::parse();
    swarm::log::init_with_debug(cli.debug);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let config = Config::load(&cwd)?;
    Config::ensure_dirs()?;

    if let Command::Agent {
        id,
        prompt_file,
        state_dir,
    } = &cli.command
    {
        return run_agent(&config, &cwd, id, prompt_file, state_dir);
    }

    let scope = if cli.global {
        Scope::Global
    } else {
        Scope::project(&cwd)
    };
    let store = FileStore::open(&Config::state_dir()?, scope)?;
    let reconciled = store.reconcile_stale()?;
    if !reconciled.is_empty() {
        info!(count = reconciled.len(), "marked stale agents as crashed");
    }
    let store: SharedStore = Arc::new(store);

    match cli.command {
        Command::List { all, json } => run_list(&store, all, json),
        Command::Pause { agent } => {
            let record = control::pause(&*store, &agent)?;
            println!("Pausing {} ({})", record.display_name(), record.id);
            Ok(())
        }
        Command::Resume { agent } => {
            let record = control::resume(&*store, &agent)?;
            println!("Resumed {} ({})", record.display_name(), record.id);
            Ok(())
        }
        Command::Kill {
            agent,
            after_iteration,
        } => {
            let mode = if after_iteration {
                TerminateMode::AfterIteration
            } else {
                TerminateMode::Immediate
            };
            let record = control::kill(&*store, &agent, mode)?;
            if after_iteration {
                println!(
                    "{} will stop after iteration {}",
                    record.display_name(),
                    record.current_iteration.max(1)
                );
            } else {
                println!("Stopping {} ({})", record.display_name(), record.id);
            }
            Ok(())
        }
        Command::Update {
            agent,
            iterations,
            model,
        } => run_update(&store, &agent, iterations, model),
        Command::Wait {
            agents,
            timeout,
            interval,
            any,
        } => run_wait(store, agents, timeout, interval, any),
        Command::Run(args) => run_task(&config, &cwd, store, args),
        Command::Agent { .. } => Ok(()),
    }
}

fn run_list(store: &SharedStore, all: bool, json: bool) -> Result<()> {
    let records = store.list(!all)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No agents");
        return Ok(());
    }
    println!(
        "{:<10} {:<20} {:<11} {:<9} {:<20} {}",
        "ID", "NAME", "STATUS", "ITER", "MODEL", "STARTED"
    );
    for record in &records {
        println!(
            "{:<10} {:<20} {:<11} {:<9} {:<20} {}",
            record.id.as_str(),
            truncate(record.display_name(), 20),
            status_label(record),
            iteration_label(record),
            truncate(&record.model, 20),
            record.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn status_label(record: &AgentRecord) -> String {
    match (record.is_running(), record.paused, record.exit_reason) {
        (true, true, _) => "paused".to_string(),
        (true, false, _) => "running".to_string(),
        (false, _, Some(reason)) => reason.to_string(),
        (false, _, None) => "terminated".to_string(),
    }
}

fn iteration_label(record: &AgentRecord) -> String {
    if record.total_iterations == 0 {
        format!("{}/∞", record.current_iteration)
    } else {
        format!("{}/{}", record.current_iteration, record.total_iterations)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

fn run_update(
    store: &SharedStore,
    agent: &str,
    iterations: Option<u32>,
    model: Option<String>,
) -> Result<()> {
    if iterations.is_none() && model.is_none() {
        return Err(Error::Validation(
            "nothing to update: pass --iterations or --model".to_string(),
        ));
    }
    if let Some(total) = iterations {
        let record = control::set_iterations(&**store, agent, total)?;
        println!("{}: iterations set to {}", record.display_name(), iteration_label(&record));
    }
    if let Some(model) = model {
        let record = control::set_model(&**store, agent, &model)?;
        println!("{}: model set to {}", record.display_name(), record.model);
    }
    Ok(())
}

fn run_wait(
    store: SharedStore,
    agents: Vec<String>,
    timeout: Option<u64>,
    interval: u64,
    any: bool,
) -> Result<()> {
    let options = WaitOptions {
        timeout: timeout.map(Duration::from_secs),
        interval: Duration::from_secs(interval.max(1)),
        any,
    };
    let rt = tokio::runtime::Runtime::new()?;
    let results = rt.block_on(async {
        let cancel = ctrl_c_token();
        control::wait(store, &agents, &options, &cancel).await
    })?;
    for (id, state) in results {
        match state {
            WaitState::Terminated(record) => println!(
                "{} ({}) terminated: {}",
                record.display_name(),
                id,
                status_label(&record)
            ),
            WaitState::Removed => println!("{} removed", id),
            WaitState::Running => println!("{} still running", id),
        }
    }
    Ok(())
}

/// Cancelled on the first ctrl-c. Must be called inside a runtime.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

fn build_runner(
    config: &Config,
    runner_config: RunnerConfig,
    store: SharedStore,
    cancel: CancellationToken,
) -> TaskRunner {
    let mut agent = ProcessAgent::new(AgentCommand::from_config(&config.command));
    if let Some(limit) = config.iteration_timeout() {
        agent = agent.with_timeout(limit);
    }
    TaskRunner::new(
        Arc::new(runner_config),
        store,
        Arc::new(agent),
        Arc::new(DetachedSpawner),
        cancel,
    )
}

fn task_from_args(config: &Config, args: &RunArgs) -> Result<Task> {
    let (default_name, source) = match (&args.prompt, &args.prompt_string, &args.prompt_file) {
        (Some(name), None, None) => (name.clone(), PromptSource::Named(name.clone())),
        (None, Some(text), None) => ("prompt".to_string(), PromptSource::Inline(text.clone())),
        (None, None, Some(path)) => {
            let path = expand_tilde(&path.to_string_lossy());
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "prompt".to_string());
            (stem, PromptSource::File(path))
        }
        _ => {
            return Err(Error::Validation(
                "give exactly one of a prompt name, --prompt-string or --prompt-file".to_string(),
            ))
        }
    };
    let mut task = Task::new(&default_name, source)
        .with_iterations(args.iterations.unwrap_or(config.iterations));
    task.model = args.model.clone();
    task.agent_name = args.name.clone();
    Ok(task)
}

fn run_task(config: &Config, cwd: &Path, store: SharedStore, args: RunArgs) -> Result<()> {
    let task = task_from_args(config, &args)?;
    let runner_config = RunnerConfig::from_config(config, cwd)?;
    let resolver = FilePromptResolver::new(&runner_config.prompts_dir, cwd);
    let command = AgentCommand::from_config(&config.command);
    if !command.is_available() {
        return Err(Error::AgentNotAvailable(command.binary().to_string()));
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let cancel = ctrl_c_token();
        let runner = build_runner(config, runner_config, store, cancel);

        if args.detach {
            match runner.launch_detached(&task, &resolver).await? {
                LaunchOutcome::Started { id, pid, log_file } => {
                    println!("Started {} ({}) pid {}", task.effective_name(), id, pid);
                    println!("Logs: {}", log_file.display());
                }
                LaunchOutcome::Skipped { name } => {
                    println!("Agent '{}' is already running, not started", name);
                }
            }
            return Ok(());
        }

        let mut group = WriterGroup::stdout(&[task.effective_name()]);
        let outcomes = runner
            .run_foreground(std::slice::from_ref(&task), &resolver, &mut group)
            .await?;
        let interrupted = outcomes.iter().any(UnitOutcome::interrupted);
        for outcome in outcomes {
            if let UnitOutcome::Finished(record) = outcome {
                println!(
                    "{}: {} succeeded, {} failed ({})",
                    record.display_name(),
                    record.successful_iterations,
                    record.failed_iterations,
                    status_label(&record)
                );
            }
        }
        if interrupted {
            return Err(Error::Cancelled);
        }
        Ok::<(), Error>(())
    })
}

/// Entry point of a detached agent: `swarm __agent --id ...`.
fn run_agent(
    config: &Config,
    cwd: &Path,
    id: &str,
    prompt_file: &Path,
    state_dir: &Path,
) -> Result<()> {
    let id = AgentId::parse(id)?;
    let state_dir = expand_tilde(&state_dir.to_string_lossy());
    let store: SharedStore = Arc::new(FileStore::open(&state_dir, Scope::Global)?);
    let mut runner_config = RunnerConfig::from_config(config, cwd)?;
    runner_config.locks_dir = state_dir.join("locks");
    runner_config.state_dir = state_dir;
    info!(%id, subcommand = AGENT_SUBCOMMAND, "detached agent starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let cancel = ctrl_c_token();
        let runner = build_runner(config, runner_config, store, cancel);
        let mut out = io::stdout();
        let record = runner.resume_detached(&id, prompt_file, &mut out).await?;
        writeln!(
            out,
            "\n[swarm] Finished: {} succeeded, {} failed ({})",
            record.successful_iterations,
            record.failed_iterations,
            status_label(&record)
        )?;
        Ok::<(), Error>(())
    })
}
