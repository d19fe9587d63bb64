use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;

use epic_executor::config::Config;
use epic_executor::orchestration::{
    compute_plan, CommandImplementer, CommandVerifier, ExecutionPool, Implementer, PoolEvent,
    RetryMode, Verifier,
};
use epic_executor::state::ExecutionRecord;
use epic_executor::workspace::{
    IntegrationStrategy, SharedWorkspace, WorkspaceProvider, WorktreeManager, WorktreeSettings,
};
use epic_executor::{elog, elog_warn, EpicManifest, Error, Result};

/// Epic executor - run a dependency graph of tasks through implement and verify
#[derive(Parser, Debug)]
#[command(name = "epic-executor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    EPIC_DEBUG=1        Enable debug logging (alternative to --debug)\n    EPIC_DEBUG=trace    Also log collaborator output"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.epic-executor/executor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the execution levels of an epic without running anything
    Plan {
        /// Epic manifest (.toml or .json)
        manifest: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute an epic
    Run(RunArgs),

    /// Show the persisted result of the last run
    Status {
        /// Epic manifest (.toml or .json)
        manifest: PathBuf,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Epic manifest (.toml or .json)
    manifest: PathBuf,

    /// Git repository the tasks work in (defaults to the current directory)
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Maximum number of tasks running at once
    #[arg(long, short = 'j')]
    max_concurrent: Option<usize>,

    /// Retries after a failed verification
    #[arg(long)]
    retries: Option<u32>,

    #[arg(long, value_enum)]
    retry_mode: Option<RetryMode>,

    /// Run every task in the repository directory, one at a time
    #[arg(long)]
    no_worktree: bool,

    /// What to do with a task branch once the task completes.
    ///
    /// With `branch` (the default) dependents do not see their
    /// dependencies' work; pick `merge` or `fast-forward` when tasks build
    /// on each other.
    #[arg(long, value_enum)]
    integration: Option<IntegrationStrategy>,

    /// Skip tasks completed by the previous run
    #[arg(long)]
    resume: bool,

    /// Print the final status as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    epic_executor::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Plan { manifest, json } => {
            run_plan(&manifest, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => {
            if run_epic(args)? {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Status { manifest } => {
            run_status(&manifest)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_plan(manifest_path: &Path, json: bool) -> Result<()> {
    let manifest = EpicManifest::load(manifest_path)?;
    let epic = manifest.epic.clone();
    let graph = manifest.into_graph(None)?;
    let plan = compute_plan(&graph);
    let conflicts = plan.file_conflicts(&graph);

    if json {
        let output = serde_json::json!({
            "epic": epic,
            "levels": plan.levels,
            "file_conflicts": conflicts,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Epic: {} ({} tasks)", epic, graph.len());
    println!();
    for (level, ids) in plan.levels.iter().enumerate() {
        println!("Level {}:", level);
        for id in ids {
            let task = graph.task(id)?;
            let deps = graph.dependencies(id);
            if deps.is_empty() {
                println!("  {}  {}", id, task.name);
            } else {
                let deps: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
                println!("  {}  {}  (after {})", id, task.name, deps.join(", "));
            }
        }
    }
    println!();
    println!(
        "{} level(s), up to {} task(s) in parallel",
        plan.level_count(),
        plan.max_parallelism()
    );
    if !conflicts.is_empty() {
        println!();
        println!("Possible file conflicts:");
        for conflict in &conflicts {
            println!("  {}", conflict);
        }
    }
    Ok(())
}

fn run_status(manifest_path: &Path) -> Result<()> {
    let record_path = EpicManifest::record_path(manifest_path);
    match ExecutionRecord::load(&record_path)? {
        Some(record) => print!("{}", record),
        None => println!("No execution record at {}", record_path.display()),
    }
    Ok(())
}

fn run_epic(args: RunArgs) -> Result<bool> {
    let mut config = Config::load()?;
    if let Some(n) = args.max_concurrent {
        config.max_concurrent = n;
    }
    if let Some(n) = args.retries {
        config.max_retries = n;
    }
    if let Some(mode) = args.retry_mode {
        config.retry_mode = mode;
    }
    if let Some(strategy) = args.integration {
        config.integration = strategy;
    }
    if args.no_worktree {
        config.isolation = false;
    }
    config.validate()?;

    let manifest = EpicManifest::load(&args.manifest)?;
    let epic = manifest.epic.clone();
    let record_path = EpicManifest::record_path(&args.manifest);
    let previous = if args.resume {
        ExecutionRecord::load(&record_path)?
    } else {
        None
    };
    let mut graph = manifest.into_graph(previous.as_ref())?;

    let implement_command = config.implement_command.as_deref().ok_or_else(|| {
        Error::Validation("no implement_command configured in config.toml".to_string())
    })?;
    let verify_command = config.verify_command.as_deref().ok_or_else(|| {
        Error::Validation("no verify_command configured in config.toml".to_string())
    })?;
    let implementer: Arc<dyn Implementer> = Arc::new(CommandImplementer::parse(implement_command)?);
    let verifier: Arc<dyn Verifier> = Arc::new(CommandVerifier::parse(verify_command)?);

    let repo = match args.repo {
        Some(repo) => repo,
        None => std::env::current_dir()?,
    };
    let mut pool_config = config.pool_config();
    let (workspaces, target_branch): (Arc<dyn WorkspaceProvider>, Option<String>) =
        if config.isolation {
            config.ensure_dirs()?;
            let manager = WorktreeManager::new(
                &repo,
                WorktreeSettings {
                    epic: epic.clone(),
                    worktree_dir: config.worktrees_dir()?,
                    integration: config.integration,
                    target_branch: config.target_branch.clone(),
                    copy_patterns: config.copy_patterns.clone(),
                },
            )?;
            let target = manager.target_branch().to_string();
            (Arc::new(manager), Some(target))
        } else {
            pool_config.max_concurrent = 1;
            (Arc::new(SharedWorkspace::new(&repo)), None)
        };

    elog!(
        "Running epic {} ({} tasks, max_concurrent={}, resume={})",
        epic,
        graph.len(),
        pool_config.max_concurrent,
        args.resume
    );

    let json = args.json;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<PoolEvent>();
        let pool =
            ExecutionPool::new(pool_config, implementer, verifier, workspaces)?.with_events(tx);

        let cancel = pool.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancelling: waiting for running tasks to stop...");
                cancel.cancel();
            }
        });

        // Keep the record on disk current while the pool runs
        let status_rx = pool.subscribe();
        let mut record = ExecutionRecord::new(&epic, target_branch);
        let recorder_path = record_path.clone();
        let recorder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !json {
                    println!("{}", event);
                }
                let status = status_rx.borrow().clone();
                record.update_from_status(&status);
                if let Err(e) = record.save(&recorder_path).await {
                    elog_warn!("Failed to save execution record: {}", e);
                }
            }
            record
        });

        let status = pool.run(&mut graph).await?;
        drop(pool);

        let mut record = recorder
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        record.update_from_graph(&graph, true);
        record.save(&record_path).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            println!();
            print!("{}", status);
        }
        elog!("Epic {} finished: success={}", epic, status.is_success());
        Ok::<bool, Error>(status.is_success())
    })
}
