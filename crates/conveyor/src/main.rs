//! conveyor - CLI entry point.
//!
//! `run` submits, `worker` drains the queue, `status`/`cancel` inspect
//! and stop runs, and the manual phase commands drive a single phase
//! with the same executors the worker uses.

use clap::{Parser, Subcommand};
use conveyor::exec::CommandExecutors;
use conveyor::phases::{self, PhaseCtx};
use conveyor::queue::QueueStore;
use conveyor::submit::{self, SubmitRequest};
use conveyor::worker::Worker;
use conveyor::workspace::GitWorkspaces;
use conveyor::{executor::ExecutorSet, status, workspace::WorkspaceProvider};
use conveyor_core::task::resolve_task_input;
use conveyor_core::{Config, Id, Phase};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Durable multi-worker pipeline for code-modification runs.
#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Durable multi-worker pipeline for code-modification runs")]
#[command(version)]
struct Cli {
    /// State root holding runs/, workspaces/, and queue.db. Defaults to
    /// $CONVEYOR_ROOT, then ~/.local/share/conveyor; a `root` line in
    /// the config file overrides both.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Config file (flat key = value format)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a run and print its id
    Run {
        /// Task text, or a path to a .md/.json task file
        task: String,

        /// Repository url to clone
        #[arg(long)]
        repo: String,

        /// Keep the workspace directory after the pr phase
        #[arg(long)]
        keep_workspace: bool,

        /// Base branch (defaults to the repository's main/master/HEAD)
        #[arg(long)]
        branch: Option<String>,

        /// Also run a worker loop in this process
        #[arg(long)]
        start_worker: bool,
    },

    /// Run the worker loop; stops on SIGINT/SIGTERM
    Worker,

    /// Show one run, or all runs when no id is given
    Status {
        run_id: Option<String>,

        /// Refresh continuously
        #[arg(long)]
        watch: bool,

        /// Refresh interval in milliseconds
        #[arg(long, default_value_t = 2000)]
        interval: u64,
    },

    /// Cancel a run's jobs and lease, and mark its handoff cancelled
    Cancel { run_id: String },

    /// Execute only the plan phase for a new run directory
    Plan {
        /// Task text, or a path to a .md/.json task file
        task: String,

        /// Repository url to clone
        #[arg(long)]
        repo: String,
    },

    /// Execute only the implement phase for an existing run directory
    Implement {
        #[arg(long)]
        run: PathBuf,
    },

    /// Execute only the review phase for an existing run directory
    Review {
        #[arg(long)]
        run: PathBuf,
    },

    /// Execute only the test phase for an existing run directory
    Test {
        #[arg(long)]
        run: PathBuf,
    },
}

fn build_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    Ok(config)
}

async fn open_store(config: &Config) -> Result<Arc<QueueStore>, Box<dyn std::error::Error>> {
    let store = QueueStore::new(&config.db_path(), config.lease_timeout()).await?;
    store.migrate_embedded().await?;
    Ok(Arc::new(store))
}

/// Run the worker until a termination signal arrives.
async fn run_worker(worker: Arc<Worker>) {
    let signal_worker = Arc::clone(&worker);
    tokio::select! {
        _ = worker.run() => {}
        _ = termination_signal() => {
            info!("termination signal received");
            signal_worker.shutdown();
        }
    }
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Execute one phase in place, the way the worker would, and report the
/// outcome.
async fn run_single_phase(
    config: &Config,
    executors: &dyn ExecutorSet,
    workspaces: &dyn WorkspaceProvider,
    run_dir: &Path,
    phase: Phase,
) -> Result<(), Box<dyn std::error::Error>> {
    let run_id = Id::from_string(
        run_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    );
    let ctx = PhaseCtx {
        config,
        run_id: &run_id,
        run_dir: run_dir.to_path_buf(),
        executors,
        workspaces,
    };

    match phases::dispatch(&ctx, phase).await? {
        Some(next) => println!("{} complete; next phase: {}", phase.as_str(), next.as_str()),
        None => println!("{} complete; run finished", phase.as_str()),
    }
    Ok(())
}

async fn run_cli(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&cli)?;
    let executors: Arc<dyn ExecutorSet> = Arc::new(CommandExecutors::from_config(&config));
    let workspaces: Arc<dyn WorkspaceProvider> = Arc::new(GitWorkspaces::new(
        config.workspaces_dir(),
        config.branch_prefix.clone(),
    ));

    match cli.command {
        Command::Run {
            task,
            repo,
            keep_workspace,
            branch,
            start_worker,
        } => {
            let store = open_store(&config).await?;
            let task = resolve_task_input(&task)?;
            let run_id = submit::submit(
                &config,
                &store,
                SubmitRequest {
                    task,
                    repo_url: repo,
                    keep_workspace,
                    base_branch: branch,
                },
            )
            .await?;
            println!("{run_id}");

            if start_worker {
                let worker = Arc::new(Worker::new(
                    config.clone(),
                    store,
                    executors,
                    workspaces,
                ));
                run_worker(worker).await;
            }
        }

        Command::Worker => {
            let store = open_store(&config).await?;
            let worker = Arc::new(Worker::new(config.clone(), store, executors, workspaces));
            run_worker(worker).await;
        }

        Command::Status {
            run_id,
            watch,
            interval,
        } => {
            let store = open_store(&config).await?;
            let run_id = run_id.map(Id::from_string);
            loop {
                let output = match &run_id {
                    Some(id) => status::render_run(&config, &store, id).await?,
                    None => status::render_all(&config, &store).await?,
                };
                if watch {
                    // Clear screen and home the cursor between refreshes.
                    print!("\x1b[2J\x1b[H");
                }
                print!("{output}");
                if !watch {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(interval)).await;
            }
        }

        Command::Cancel { run_id } => {
            let store = open_store(&config).await?;
            submit::cancel(&config, &store, &Id::from_string(run_id)).await?;
        }

        Command::Plan { task, repo } => {
            let task = resolve_task_input(&task)?;
            let run_id = submit::create_run(
                &config,
                &SubmitRequest {
                    task,
                    repo_url: repo,
                    keep_workspace: config.keep_workspace,
                    base_branch: None,
                },
            )?;
            let run_dir = config.run_dir(&run_id);
            println!("{run_id}");
            run_single_phase(
                &config,
                executors.as_ref(),
                workspaces.as_ref(),
                &run_dir,
                Phase::Plan,
            )
            .await?;
        }

        Command::Implement { run } => {
            run_single_phase(
                &config,
                executors.as_ref(),
                workspaces.as_ref(),
                &run,
                Phase::Implement,
            )
            .await?;
        }

        Command::Review { run } => {
            run_single_phase(
                &config,
                executors.as_ref(),
                workspaces.as_ref(),
                &run,
                Phase::Review,
            )
            .await?;
        }

        Command::Test { run } => {
            run_single_phase(
                &config,
                executors.as_ref(),
                workspaces.as_ref(),
                &run,
                Phase::Test,
            )
            .await?;
        }
    }

    Ok(())
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let result = runtime.block_on(run_cli(cli));
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
