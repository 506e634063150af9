use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use harness::classify::Classifier;
use harness::config::Config;
use harness::core::{
    CapabilityTier, ComplexityTier, ItemKind, Priority, RepositoryId, WorkItem, WorkState,
};
use harness::orchestration::{
    fan_out, CommandAgent, CommandReviewer, CommandVerifier, Collaborators, OrchestratorEvent,
    OrchestratorSettings, RepositoryContext, SessionOrchestrator, SessionOutcome,
};
use harness::scheduler::{Scheduler, SharedScheduler};
use harness::tracker::{
    recover_interrupted, sync_changes, untracked_items, IssueFilter, IssueTracker, LocalTracker,
};
use harness::vcs::GitVcs;
use harness::{spec, Result};

/// Longest title derived from a free-text description.
const TITLE_MAX_CHARS: usize = 72;

/// Harness - autonomous coding sessions driven from a work spec
#[derive(Parser, Debug)]
#[command(name = "harness")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    HARNESS_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to <state_dir>/harness.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default ~/.harness/harness.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Load a work spec and run sessions until nothing is runnable
    Start {
        /// Spec file (.toml, .json, or structured text)
        spec: PathBuf,

        /// Force the complexity tier of every item
        #[arg(long)]
        complexity: Option<ComplexityTier>,

        /// Force the agent capability tier
        #[arg(long)]
        capability: Option<CapabilityTier>,

        /// Stop after this many sessions
        #[arg(long)]
        max_sessions: Option<usize>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one session on a runnable item
    WorkOn {
        /// Item id, short id, or title
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Create an ad-hoc item and run a session on it
    CreateAndWork {
        /// What to do; the first line becomes the title
        description: String,

        #[arg(short = 'p', long)]
        priority: Option<u8>,

        #[arg(short = 'l', long = "label")]
        labels: Vec<String>,

        #[arg(long)]
        complexity: Option<ComplexityTier>,

        #[arg(long)]
        capability: Option<CapabilityTier>,

        #[arg(long)]
        json: bool,
    },

    /// List tracked items
    List {
        #[arg(long)]
        state: Option<WorkState>,

        #[arg(long)]
        repository: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Show item counts per state
    Progress {
        #[arg(long)]
        json: bool,
    },

    /// List blocked items and why they are blocked
    Blocked,

    /// Re-open a failed item
    Reopen { id: String },

    /// Cancel an item that is not running
    Cancel { id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.ensure_dirs()?;
    harness::log::init_with_debug(&config.state_dir()?, cli.debug);
    tracing::info!(command = ?cli.command, "harness starting");

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cli.command, config));
    if let Err(e) = &result {
        tracing::error!(error = %e, "command failed");
    }
    result
}

async fn run(command: Command, config: Config) -> Result<()> {
    let tracker = Arc::new(LocalTracker::open(&config.tracker_path()?).await?);
    match command {
        Command::Start {
            spec,
            complexity,
            capability,
            max_sessions,
            json,
        } => {
            run_start(
                &config,
                tracker,
                &spec,
                complexity,
                capability,
                max_sessions,
                json,
            )
            .await
        }
        Command::WorkOn { id, json } => run_work_on(&config, tracker, &id, json).await,
        Command::CreateAndWork {
            description,
            priority,
            labels,
            complexity,
            capability,
            json,
        } => {
            let item = WorkItem::new(&title_from(&description), description.trim())
                .with_priority(priority.map(Priority).unwrap_or_default())
                .with_labels(labels)
                .with_kind(ItemKind::AdHoc);
            run_create_and_work(&config, tracker, item, complexity, capability, json).await
        }
        Command::List {
            state,
            repository,
            json,
        } => {
            let filter = IssueFilter {
                state,
                repository: repository.map(RepositoryId::new),
                label: None,
            };
            let items = tracker.list(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("No items.");
            } else {
                for item in &items {
                    println!("{}", item.summary());
                }
            }
            Ok(())
        }
        Command::Progress { json } => {
            let scheduler = load_scheduler(&config, tracker.as_ref()).await?;
            let progress = scheduler.progress();
            if json {
                println!("{}", serde_json::to_string_pretty(&progress)?);
            } else {
                println!("{}", progress);
            }
            Ok(())
        }
        Command::Blocked => {
            let scheduler = load_scheduler(&config, tracker.as_ref()).await?;
            let blocked = scheduler.blocked();
            if blocked.is_empty() {
                println!("Nothing is blocked.");
            }
            for item in blocked {
                println!("{}", item.summary());
                match &item.blocked_reason {
                    Some(reason) => println!("    {}", reason),
                    None => println!("    waiting on discovered blockers"),
                }
            }
            Ok(())
        }
        Command::Reopen { id } => {
            let shared = load_scheduler(&config, tracker.as_ref()).await?.into_shared();
            let item_id = shared.read().await.find(&id)?.id;
            shared.write().await.reopen(&item_id)?;
            sync_changes(&shared, tracker.as_ref()).await?;
            if let Some(item) = shared.read().await.get(&item_id) {
                println!("Re-opened {}", item.summary());
            }
            Ok(())
        }
        Command::Cancel { id } => {
            let shared = load_scheduler(&config, tracker.as_ref()).await?.into_shared();
            let item_id = shared.read().await.find(&id)?.id;
            shared.write().await.cancel(&item_id)?;
            sync_changes(&shared, tracker.as_ref()).await?;
            println!("Cancelled {}", item_id.short());
            Ok(())
        }
    }
}

async fn run_start(
    config: &Config,
    tracker: Arc<LocalTracker>,
    spec_path: &Path,
    complexity: Option<ComplexityTier>,
    capability: Option<CapabilityTier>,
    max_sessions: Option<usize>,
    json: bool,
) -> Result<()> {
    let mut work = spec::load_path(spec_path)?;
    fan_out(&mut work, &config.routing_table());
    let highest = Classifier::with_override(complexity).classify_spec(&mut work);
    tracing::info!(
        spec = %work.title,
        items = work.items.len(),
        highest = %highest,
        "spec loaded"
    );

    let mut scheduler = load_scheduler(config, tracker.as_ref()).await?;
    let tracked: Vec<WorkItem> = scheduler.items().into_iter().cloned().collect();
    let fresh = untracked_items(&tracked, work.items.clone());
    let added = scheduler.extend(fresh)?;
    if !json {
        println!(
            "Loaded {:?}: {} items ({} new), highest tier {}",
            work.title,
            work.items.len(),
            added.len(),
            highest
        );
    }

    let shared = scheduler.into_shared();
    sync_changes(&shared, tracker.as_ref()).await?;
    let orchestrator = build_orchestrator(
        config,
        shared.clone(),
        tracker,
        work.requirements.clone(),
        complexity.or(work.complexity),
        capability,
    )
    .await?;
    let outcomes = run_with_events(orchestrator, json, |o| async move {
        o.run_until_idle(max_sessions).await
    })
    .await?;
    report(&shared, &outcomes, json).await
}

async fn run_work_on(config: &Config, tracker: Arc<LocalTracker>, id: &str, json: bool) -> Result<()> {
    let shared = load_scheduler(config, tracker.as_ref()).await?.into_shared();
    let item_id = shared.read().await.find(id)?.id;
    let orchestrator =
        build_orchestrator(config, shared.clone(), tracker, Vec::new(), None, None).await?;
    let outcome = run_with_events(orchestrator, json, |o| async move {
        o.work_on(&item_id).await
    })
    .await?;
    report(&shared, &[outcome], json).await
}

async fn run_create_and_work(
    config: &Config,
    tracker: Arc<LocalTracker>,
    mut item: WorkItem,
    complexity: Option<ComplexityTier>,
    capability: Option<CapabilityTier>,
    json: bool,
) -> Result<()> {
    item.repository = config.routing_table().route(&item);
    item.classification = Some(Classifier::with_override(complexity).classify_item(&item));

    let mut scheduler = load_scheduler(config, tracker.as_ref()).await?;
    let item_id = scheduler.add_item(item)?;
    let shared = scheduler.into_shared();
    sync_changes(&shared, tracker.as_ref()).await?;

    let orchestrator = build_orchestrator(
        config,
        shared.clone(),
        tracker,
        Vec::new(),
        complexity,
        capability,
    )
    .await?;
    let outcome = run_with_events(orchestrator, json, |o| async move {
        o.work_on(&item_id).await
    })
    .await?;
    report(&shared, &[outcome], json).await
}

/// Rebuild the scheduler from the tracker's records.
async fn load_scheduler(config: &Config, tracker: &LocalTracker) -> Result<Scheduler> {
    let mut items = tracker.list(&IssueFilter::all()).await?;
    let recovered = recover_interrupted(&mut items);
    for id in &recovered {
        if let Some(item) = items.iter().find(|item| &item.id == id) {
            tracing::warn!(item = %id.short(), "failing session interrupted by a previous run");
            tracker.save(item).await?;
        }
    }
    Scheduler::from_items(items, config.scheduler_policy())
}

async fn build_orchestrator(
    config: &Config,
    scheduler: SharedScheduler,
    tracker: Arc<LocalTracker>,
    requirements: Vec<String>,
    complexity: Option<ComplexityTier>,
    capability: Option<CapabilityTier>,
) -> Result<SessionOrchestrator> {
    let mut agent = CommandAgent::new(config.effective_command())?.with_args(config.agent.args.clone());
    for tier in [
        CapabilityTier::Light,
        CapabilityTier::Standard,
        CapabilityTier::Heavy,
    ] {
        agent = agent.with_model(tier, config.model_for(tier));
    }

    let collaborators = Collaborators {
        agent: Arc::new(agent),
        verifier: Arc::new(CommandVerifier::default()),
        reviewer: Arc::new(CommandReviewer::default()),
        vcs: Arc::new(GitVcs::new()),
        tracker,
    };
    let mut repositories = config.repository_contexts()?;
    if config.repositories.is_empty() {
        // Unconfigured: every repository the work names runs in the current directory
        let cwd = std::env::current_dir()?;
        for item in scheduler.read().await.items() {
            if !repositories.iter().any(|repo| repo.id == item.repository) {
                repositories.push(RepositoryContext::new(item.repository.clone(), cwd.clone()));
            }
        }
    }
    let settings = OrchestratorSettings {
        checkpoint: config.checkpoint_policy(),
        routing: config.routing_table(),
        repositories,
        requirements,
        complexity_override: complexity,
        capability_override: capability,
    };
    Ok(SessionOrchestrator::new(scheduler, collaborators, settings))
}

/// Run `f` while printing orchestrator events, unless output is JSON.
async fn run_with_events<F, Fut, T>(orchestrator: SessionOrchestrator, json: bool, f: F) -> Result<T>
where
    F: FnOnce(Arc<SessionOrchestrator>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    if json {
        return f(Arc::new(orchestrator)).await;
    }
    let (tx, mut rx) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });
    let result = f(Arc::new(orchestrator.with_events(tx))).await;
    let _ = printer.await;
    result
}

fn print_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::SessionStarted {
            item,
            repository,
            capability,
        } => println!("▶ {} started in {} ({})", item.short(), repository, capability),
        OrchestratorEvent::SessionFinished { item, state } => {
            println!("■ {} finished: {}", item.short(), state)
        }
        OrchestratorEvent::SelfHealScheduled { repository, item } => {
            println!("! baseline of {} broken, self-heal {} scheduled", repository, item.short())
        }
        OrchestratorEvent::CheckpointCompleted {
            checkpoint,
            findings,
            created,
        } => println!(
            "✓ checkpoint {}: {} findings, {} new items",
            checkpoint.short(),
            findings,
            created
        ),
        OrchestratorEvent::WorkDiscovered { item, from, blocker } => println!(
            "+ {} discovered by {}{}",
            item.short(),
            from.short(),
            if *blocker { " (blocker)" } else { "" }
        ),
    }
}

async fn report(scheduler: &SharedScheduler, outcomes: &[SessionOutcome], json: bool) -> Result<()> {
    let progress = scheduler.read().await.progress();
    if json {
        let output = serde_json::json!({
            "outcomes": outcomes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "progress": progress,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }
    println!();
    for outcome in outcomes {
        println!("  {}", outcome);
    }
    println!();
    println!("Progress: {}", progress);
    Ok(())
}

/// First line of a description, shortened to a title.
fn title_from(description: &str) -> String {
    let first = description.trim().lines().next().unwrap_or_default().trim();
    if first.chars().count() <= TITLE_MAX_CHARS {
        return first.to_string();
    }
    let mut title: String = first.chars().take(TITLE_MAX_CHARS - 3).collect();
    title.push_str("...");
    title
}
