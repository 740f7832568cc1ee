use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use foreman::config::Config;
use foreman::core::{load_plan, tasks_from_items, Task};
use foreman::git::GitOps;
use foreman::github::GhCli;
use foreman::guide::write_guide;
use foreman::orchestration::{
    plan, AgentConflictResolver, AgentFixer, AgentReviewer, ArchitectEnricher, ClaudeCli,
    Decomposer, EventSink, HaltReason, PipelineSettings, RunReport, RunSnapshot, Scheduler,
    SchedulerSettings, WorkerSettings,
};
use foreman::ports::{
    CodeAgent, Collaborators, Enricher, Hosting, VersionControl, WorkItemSource,
};
use foreman::{flog, flog_warn, Error, Result};

/// Events buffered between the scheduler and the console printer.
const EVENT_BUFFER: usize = 256;

const PRINTER_DRAIN: Duration = Duration::from_secs(2);

/// Foreman - runs a plan of coding tasks through agents, review and merge
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to <log_dir>/foreman.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ./foreman.toml, then ~/.foreman/foreman.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute tasks until they all settle
    Run(RunArgs),

    /// Print the snapshot of the current or last run
    Status,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Plan file (YAML or TOML) listing the tasks
    #[arg(long, conflicts_with_all = ["issues", "issue"])]
    pub plan: Option<PathBuf>,

    /// Take tasks from open issues carrying the ready label
    #[arg(long, conflicts_with = "issue")]
    pub issues: bool,

    /// Take a single issue by number
    #[arg(long)]
    pub issue: Option<u64>,

    /// Issue label marking work as ready (overrides config)
    #[arg(long)]
    pub label: Option<String>,

    /// Print the execution plan without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Stop after this priority tier settles
    #[arg(long)]
    pub max_priority: Option<u32>,

    /// Maximum number of concurrent executions
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Ask an architect agent for an implementation plan before each task
    #[arg(long)]
    pub architect: bool,

    /// Split vague ready issues into sub-issues before loading tasks
    #[arg(long, requires = "issues")]
    pub decompose: bool,

    /// Write a CLAUDE.md guide into the repository if it has none
    #[arg(long)]
    pub generate_claude_md: bool,

    /// Do not open follow-up issues for non-blocking review findings
    #[arg(long)]
    pub no_followups: bool,

    /// Mirror log records to stderr
    #[arg(long)]
    pub echo: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(n) = self.max_workers {
            config.max_workers = n;
        }
        if self.max_priority.is_some() {
            config.max_priority = self.max_priority;
        }
        if let Some(label) = &self.label {
            config.label = label.clone();
        }
        if self.no_followups {
            config.followups = false;
        }
    }

    fn from_issues(&self) -> bool {
        self.issues || self.issue.is_some()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run(args) => {
            args.apply(&mut config);
            config.validate()?;
            foreman::log::init_with_debug(&config.logs_dir(), cli.debug, args.echo);
            if cli.debug {
                flog!("Foreman starting (debug mode enabled)");
            } else {
                flog!("Foreman starting");
            }
            run(config, args)
        }
        Command::Status => run_status(&config),
    }
}

fn run(config: Config, args: RunArgs) -> Result<()> {
    let repo_path = std::env::current_dir()?;
    let git = GitOps::new(&repo_path)?.with_base(&config.base_branch, &config.remote);
    let repo_root = git.repo_path().to_path_buf();

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let gh = if args.from_issues() || !args.dry_run {
            Some(Arc::new(
                GhCli::new(&config.hosting_command, &repo_root, config.gh_timeout())?
                    .with_remote(&config.remote),
            ))
        } else {
            None
        };
        if args.generate_claude_md {
            if args.dry_run {
                flog!("Dry run: not writing a repository guide");
            } else if let Err(e) = write_guide(&repo_root, false) {
                flog_warn!("Could not write repository guide: {}", e);
            }
        }
        if args.decompose {
            match (&gh, args.dry_run) {
                (Some(gh), false) => decompose_ready(&config, gh.clone(), &repo_root).await?,
                _ => flog!("Dry run: not decomposing issues"),
            }
        }
        let tasks = load_tasks(&args, &config, gh.as_deref()).await?;
        flog!("Loaded {} task(s)", tasks.len());

        if args.dry_run {
            let report = plan(&tasks);
            print!("{}", report.render(&tasks, config.max_workers));
            return Ok(None);
        }
        let Some(gh) = gh else {
            return Err(Error::Config("hosting client unavailable".to_string()));
        };
        config.ensure_dirs()?;

        let collaborators = collaborators(&config, &args, git, gh, &repo_root)?;
        execute(tasks, collaborators, &config).await.map(Some)
    })?;

    let Some(report) = report else {
        return Ok(());
    };
    print_report(&report);
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn load_tasks(args: &RunArgs, config: &Config, gh: Option<&GhCli>) -> Result<Vec<Task>> {
    if let Some(path) = &args.plan {
        return load_plan(path);
    }
    let gh = gh.ok_or_else(|| Error::Config("hosting client unavailable".to_string()))?;
    if let Some(number) = args.issue {
        let item = gh.fetch_issue(number).await?;
        return Ok(tasks_from_items(&[item]));
    }
    if args.issues {
        return gh.fetch_tasks(&config.label).await;
    }
    Err(Error::Config(
        "one of --plan, --issues or --issue is required".to_string(),
    ))
}

/// Split vague ready issues into sub-issues. The parents lose the ready
/// label, so the task load that follows sees only the sub-issues.
async fn decompose_ready(config: &Config, gh: Arc<GhCli>, repo_root: &Path) -> Result<()> {
    let items = gh.list_ready_items(&config.label).await?;
    let agent: Arc<dyn CodeAgent> = Arc::new(ClaudeCli::new(&config.agent_command)?);
    let decomposer = Decomposer::new(
        agent,
        gh as Arc<dyn Hosting>,
        repo_root.to_path_buf(),
        &config.label,
        config.review_timeout(),
    );
    for (parent, children) in decomposer.run_pass(&items).await {
        let refs: Vec<String> = children.iter().map(|n| format!("#{}", n)).collect();
        println!("Decomposed #{} into {}", parent, refs.join(", "));
    }
    Ok(())
}

fn collaborators(
    config: &Config,
    args: &RunArgs,
    git: GitOps,
    gh: Arc<GhCli>,
    repo_root: &Path,
) -> Result<Collaborators> {
    let agent: Arc<dyn CodeAgent> = Arc::new(ClaudeCli::new(&config.agent_command)?);
    let vcs: Arc<dyn VersionControl> = Arc::new(git);
    let hosting: Arc<dyn Hosting> = gh.clone();

    let evaluator = AgentReviewer::new(
        agent.clone(),
        hosting.clone(),
        repo_root.to_path_buf(),
        config.review_timeout(),
    );
    let fixer = AgentFixer::new(
        agent.clone(),
        vcs.clone(),
        config.worktrees_dir(),
        config.allowed_tools.clone(),
        config.timeout(),
    );
    let resolver = AgentConflictResolver::new(
        agent.clone(),
        vcs.clone(),
        hosting.clone(),
        config.worktrees_dir(),
        config.timeout(),
    );
    let enricher: Option<Arc<dyn Enricher>> = args.architect.then(|| {
        Arc::new(ArchitectEnricher::new(
            agent.clone(),
            repo_root.to_path_buf(),
            config.review_timeout(),
        )) as Arc<dyn Enricher>
    });
    let source: Option<Arc<dyn WorkItemSource>> =
        args.from_issues().then(|| gh as Arc<dyn WorkItemSource>);

    Ok(Collaborators {
        agent,
        vcs,
        hosting,
        evaluator: Arc::new(evaluator),
        fixer: Arc::new(fixer),
        resolver: Arc::new(resolver),
        source,
        enricher,
    })
}

async fn execute(
    tasks: Vec<Task>,
    collaborators: Collaborators,
    config: &Config,
) -> Result<RunReport> {
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", event);
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flog_warn!("Interrupt received, stopping run");
            eprintln!("Interrupt received, stopping...");
            on_interrupt.cancel();
        }
    });

    let scheduler = Scheduler::new(
        tasks,
        collaborators,
        SchedulerSettings::from_config(config),
        WorkerSettings::from_config(config),
        PipelineSettings::from_config(config),
    )?
    .with_events(EventSink::new(tx))
    .with_cancellation(cancel);

    let report = scheduler.run().await;
    if tokio::time::timeout(PRINTER_DRAIN, printer).await.is_err() {
        flog_warn!("Event printer did not drain in time");
    }
    report
}

fn print_report(report: &RunReport) {
    println!();
    println!("Run finished: {}", report.halt);
    println!("  Completed: {}", report.completed.len());
    for (task_id, artifact) in &report.artifacts {
        println!("    {} -> {}", task_id, artifact.url);
    }
    println!("  Failed: {}", report.failed.len());
    for (task_id, error) in &report.failed {
        println!("    {}: {}", task_id, error);
    }
    if !report.unsettled.is_empty() {
        let ids: Vec<&str> = report.unsettled.iter().map(|id| id.as_str()).collect();
        if report.halt == HaltReason::MaxPriorityReached {
            println!("  Skipped beyond max priority: {}", ids.join(", "));
        } else {
            println!("  Not run: {}", ids.join(", "));
        }
    }
    let summary = &report.snapshot.summary;
    println!(
        "  Elapsed: {:.0}s, cost: ${:.2}, agent turns: {}",
        summary.total_elapsed_seconds, summary.total_cost_usd, summary.total_prompts
    );
}

fn run_status(config: &Config) -> Result<()> {
    let path = config.status_file();
    if !path.exists() {
        println!("No run status at {}", path.display());
        return Ok(());
    }
    let snapshot = RunSnapshot::load(&path)?;
    print!("{}", snapshot.to_json()?);
    Ok(())
}
