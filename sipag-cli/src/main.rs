//! Thin CLI driver for the orchestration core (§6: "CLI exit codes — surface
//! of the loop driver"). The CLI front-end proper is out of scope for the
//! core (§1); this binary exists only to wire the core's traits to concrete,
//! filesystem/`gh`-backed implementations and start the loop.

mod fs_discovery;
mod session;
mod sync_hook;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sipag_core::code_host::GhCliCodeHost;
use sipag_core::cron::{CronJob, CronScheduler};
use sipag_core::orchestrator::{OrchestratorBuilder, OrchestratorConfig};
use sipag_core::pipeline::PipelineConfig;
use sipag_core::ports::CodeHostAdapter;
use sipag_core::store::{FileCommentStore, FileTrackingStore};

use fs_discovery::FsDiscoverySource;
use session::ShellSessionExecutor;
use sync_hook::ShellSyncHook;

#[derive(Parser)]
#[command(name = "sipag", about = "kanban-style AI worker orchestrator", version)]
struct Cli {
    /// Root of the work-item repository (contains the pipeline config and
    /// the epic/ticket/stage markdown tree).
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Path to the pipeline config YAML, relative to `--repo` if relative.
    #[arg(long, default_value = "sipag.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration loop until stopped (Ctrl-C) or, with `--once`,
    /// until one pass finds no further work.
    Start {
        #[arg(long)]
        once: bool,
    },
    /// Validate the pipeline config and exit.
    Validate,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let repo_root = cli.repo.canonicalize().unwrap_or(cli.repo.clone());
    let config_path = if cli.config.is_absolute() {
        cli.config.clone()
    } else {
        repo_root.join(&cli.config)
    };

    let pipeline = PipelineConfig::load(&config_path)?;

    match cli.command {
        Command::Validate => {
            println!(
                "pipeline config valid: {} phase(s), entry_phase={}",
                pipeline.phases.len(),
                pipeline.entry_phase
            );
            Ok(())
        }
        Command::Start { once } => {
            let max_parallel = pipeline.max_parallel();
            let idle_seconds: u64 = pipeline
                .resolve_default("WORKFLOW_IDLE_SECONDS", "10")
                .parse()
                .unwrap_or(10);
            let default_base_branch = pipeline.resolve_default("WORKFLOW_DEFAULT_BASE_BRANCH", "main");
            let mr_comment_poll = pipeline.mr_comment_poll;
            let discovery = Box::new(FsDiscoverySource::new(repo_root.clone()));
            let code_host = Box::new(GhCliCodeHost::new());
            let session_executor = std::sync::Arc::new(ShellSessionExecutor::new());
            let sync_hook = Box::new(ShellSyncHook::new());
            let tracking_store = Box::new(FileTrackingStore::new(repo_root.join(".sipag/tracking.json")));
            let comment_store = Box::new(FileCommentStore::new(repo_root.join(".sipag/comments.json")));

            let index_root = repo_root.clone();
            let id_to_path = Box::new(move |id: &sipag_core::workitem::WorkItemId| {
                fs_discovery::resolve_path(&index_root, id.as_str())
            });
            let resolver_root = repo_root.clone();
            let stage_statuses_by_resolver_phase = Box::new(move |status: &str| {
                fs_discovery::stages_with_status(&resolver_root, status)
            });

            let orchestrator = OrchestratorBuilder::new(
                OrchestratorConfig {
                    repo_root: repo_root.clone(),
                    max_parallel,
                    idle: Duration::from_secs(idle_seconds),
                },
                pipeline,
                discovery,
                code_host,
                session_executor,
                sync_hook,
                tracking_store,
                comment_store,
                id_to_path,
                stage_statuses_by_resolver_phase,
            )
            .build();

            // Chain manager scan and comment poller both run off the
            // `mr_comment_poll` cron job (§4.8-§4.10): the orchestrator
            // exposes them for an external scheduler rather than driving
            // them itself, so this is where the two are wired together.
            let poll_orchestrator = orchestrator.clone();
            let poll_repo_root = repo_root.clone();
            let poll_code_host = GhCliCodeHost::new();
            let job = CronJob {
                name: "mr_comment_poll".to_string(),
                enabled: mr_comment_poll.enabled,
                interval: Duration::from_secs(mr_comment_poll.interval_seconds),
                execute: Box::new(move || {
                    poll_orchestrator.run_chain_scan(&default_base_branch);

                    let stages = fs_discovery::pr_created_stages(&poll_repo_root, "PR Created")
                        .into_iter()
                        .filter_map(|(id, path, pr_url)| {
                            let count = match poll_code_host.get_pr_status(&pr_url) {
                                Ok(status) => i64::from(status.has_unresolved_comments),
                                Err(e) => {
                                    tracing::warn!(stage = %id, error = %e, "comment poll: failed to read PR status");
                                    return None;
                                }
                            };
                            Some((id, path, pr_url, count))
                        })
                        .collect::<Vec<_>>();
                    poll_orchestrator.poll_comments(&stages);
                }),
            };
            let scheduler = CronScheduler::start(vec![job]);

            let result = orchestrator.start(once);
            scheduler.stop();
            result
        }
    }
}
