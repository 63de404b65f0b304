use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::{error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;

use wavecrowd::corpus::{Corpus, observe_corpus, read_groups};
use wavecrowd::marketplace::{HttpMarketplace, Marketplace};
use wavecrowd::scheduler::{
    Allocation, CompletionReconciler, EligibilityPool, RoundAllocator, TaskPublisher, WavePlan, provision_tokens,
};
use wavecrowd::screening::{ScreeningTest, read_questions};
use wavecrowd::store::StateStore;
use wavecrowd::WaveError;

fn setup_logging(level: Option<&str>) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wavecrowd")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("wavecrowd.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    // RUST_LOG wins over the configured level
    let env = env_logger::Env::default().default_filter_or(level.unwrap_or("info"));
    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn open_store(config: &Config) -> Result<StateStore> {
    StateStore::open(&config.store.path).context(format!("Failed to open state store {}", config.store.path.display()))
}

fn connect(config: &Config) -> Result<Arc<dyn Marketplace>> {
    let client = HttpMarketplace::new(config.marketplace.client_config()).context("Failed to create marketplace client")?;
    info!("Marketplace endpoint: {}", client.endpoint());
    Ok(Arc::new(client))
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Seed { documents, groups } => handle_seed_command(documents.as_deref(), groups.as_deref(), config),
        Commands::Provision => handle_provision_command(config).await,
        Commands::Run { dry_run } => handle_run_command(*dry_run, cli.is_verbose(), config).await,
        Commands::Reconcile => handle_reconcile_command(config).await,
        Commands::Status { events } => handle_status_command(*events, config),
        Commands::Screening {
            questions,
            out_questions,
            out_answers,
            count,
            seed,
        } => handle_screening_command(questions, out_questions, out_answers, *count, *seed),
    }
}

fn handle_seed_command(documents: Option<&Path>, groups: Option<&Path>, config: &Config) -> Result<()> {
    let documents = documents
        .or(config.corpus.documents_dir.as_deref())
        .ok_or_else(|| eyre!("No document directory: pass --documents or set corpus.documents_dir"))?;
    let groups = groups
        .or(config.corpus.groups_file.as_deref())
        .ok_or_else(|| eyre!("No groups file: pass --groups or set corpus.groups_file"))?;

    info!("Seeding from {} and {}", documents.display(), groups.display());
    let corpus = Corpus::load_dir(documents)?;
    let groups = read_groups(groups)?;
    let store = open_store(config)?;

    let report = observe_corpus(&store, &corpus, &groups, &config.rewards, config.corpus.max_group_size)?;

    println!(
        "{} {} new groups, {} pairs registered",
        "Seeded:".green(),
        report.new_groups,
        report.registered_pairs
    );
    if report.skipped_known > 0 {
        println!("  {} groups already registered", report.skipped_known);
    }
    if report.reversed_duplicates > 0 {
        println!(
            "  {} {} pairs were already registered in reverse order",
            "Warning:".yellow(),
            report.reversed_duplicates
        );
    }
    if report.skipped_oversize > 0 {
        println!(
            "  {} groups larger than {} documents skipped",
            report.skipped_oversize, config.corpus.max_group_size
        );
    }
    for rejected in &report.rejected {
        println!("  {} {} ({:?})", "Rejected:".yellow(), rejected.group, rejected.reason);
    }
    Ok(())
}

async fn handle_provision_command(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let marketplace = connect(config)?;
    let pool = provision_tokens(
        &store,
        marketplace.as_ref(),
        &config.retry.policy(),
        &config.eligibility.name_prefix,
        &config.eligibility.description,
    )
    .await?;

    println!("{}", "Eligibility tokens:".green());
    for index in 0..wavecrowd::scheduler::TOKEN_COUNT {
        if let Some(id) = pool.qualification_id(index) {
            println!("  {}{:02}  {}", config.eligibility.name_prefix, index, id);
        }
    }
    Ok(())
}

fn print_plan(plan: &WavePlan, verbose: bool) {
    println!(
        "{} wave {} ({} tasks: {} continuation, {} fresh), token {}{}",
        "Planned:".cyan(),
        plan.wave,
        plan.tasks.len(),
        plan.continuation_count(),
        plan.fresh_count(),
        plan.token_index,
        if plan.exclusive { ", exclusive" } else { "" }
    );
    for task in &plan.tasks {
        let kind = if task.continuation { "cont" } else { "new " };
        if verbose {
            println!(
                "  {} {}  rank {}  requests {}  reward {}  hash {}",
                kind,
                task.pair.pair_name,
                task.pair.group_rank,
                task.requested_assignments,
                task.pair.reward,
                task.pair.hash
            );
        } else {
            println!("  {} {}  requests {}", kind, task.pair.pair_name, task.requested_assignments);
        }
    }
}

async fn handle_run_command(dry_run: bool, verbose: bool, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let allocator = RoundAllocator::new(&store).with_config(config.allocator.allocator_config());

    if dry_run {
        config.validate()?;
        return match allocator.plan()? {
            Allocation::Outstanding(wave) => {
                println!(
                    "{} wave {} is still open ({}/{} tasks done)",
                    "Waiting:".yellow(),
                    wave.wave,
                    wave.completed_count,
                    wave.sent_count
                );
                Ok(())
            }
            Allocation::NoWorkAvailable => {
                println!("{}", "No work available".cyan());
                Ok(())
            }
            Allocation::Planned(plan) => {
                print_plan(&plan, verbose);
                println!("{}", "Dry run: nothing published".yellow());
                Ok(())
            }
        };
    }

    // Fail fast before anything reaches the marketplace
    let layout = config.validate_for_publishing()?;
    let pool = EligibilityPool::load(&store)?;
    let marketplace = connect(config)?;

    if let Some(progress) = allocator.seal_interrupted_wave()? {
        warn!("Sealed interrupted wave {}", progress.wave);
        println!(
            "{} interrupted wave {} sealed with {} tasks",
            "Recovered:".yellow(),
            progress.wave,
            progress.sent_count
        );
    }

    let plan = match allocator.plan()? {
        Allocation::Outstanding(wave) => {
            println!(
                "{} wave {} is still open ({}/{} tasks done)",
                "Waiting:".yellow(),
                wave.wave,
                wave.completed_count,
                wave.sent_count
            );
            return Ok(());
        }
        Allocation::NoWorkAvailable => {
            println!("{}", "No work available".cyan());
            return Ok(());
        }
        Allocation::Planned(plan) => plan,
    };
    print_plan(&plan, verbose);

    let publisher = TaskPublisher::new(&store, marketplace, pool, layout, config.publisher.clone())?
        .with_retry(config.retry.policy());
    let report = publisher.publish_wave(&plan).await?;

    println!(
        "{} wave {}: {} tasks scheduled",
        "Published:".green(),
        report.wave,
        report.published.len()
    );
    if verbose {
        for task in &report.published {
            println!("  {} -> {}", task.pair_name, task.external_task_id);
        }
    }
    Ok(())
}

async fn handle_reconcile_command(config: &Config) -> Result<()> {
    config.validate()?;
    let store = open_store(config)?;
    let marketplace = connect(config)?;

    let pool = if store.list_eligibility_tokens()?.is_empty() {
        None
    } else {
        Some(EligibilityPool::load(&store)?)
    };

    let report = CompletionReconciler::new(&store, marketplace, pool)
        .with_retry(config.retry.policy())
        .with_notifications(config.marketplace.notify_workers)
        .reconcile()
        .await?;

    println!(
        "{} {} assignments credited, {} skipped, {} tasks retired, {} waves closed",
        "Reconciled:".green(),
        report.credited,
        report.skipped(),
        report.retired,
        report.waves_closed
    );
    if report.award_failures > 0 {
        println!(
            "  {} {} token grants failed; they will be retried",
            "Warning:".yellow(),
            report.award_failures
        );
    }
    Ok(())
}

fn handle_status_command(events: usize, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let counts = store.pair_counts()?;

    println!("{}", "Pairs".bold());
    println!(
        "  total {}  unassigned {}  in progress {}  covered {}",
        counts.total, counts.unassigned, counts.in_progress, counts.covered
    );

    println!("{}", "Waves".bold());
    let waves = store.list_waves()?;
    if waves.is_empty() {
        println!("  none published");
    }
    for wave in &waves {
        let state = if wave.closed { "closed".green() } else { "open".yellow() };
        println!(
            "  {:<5} {}  {}/{} tasks  token {}  {} workers",
            wave.wave.to_string(),
            state,
            wave.completed_count,
            wave.sent_count,
            wave.token_index,
            wave.workers.len()
        );
    }

    let open_tasks = store.open_tasks()?;
    println!("{}", "Tasks".bold());
    println!(
        "  {} open, {} assignments credited",
        open_tasks.len(),
        store.credited_assignment_count()?
    );

    if events > 0 {
        println!("{}", "Recent events".bold());
        for event in store.recent_events(events)? {
            let when = chrono::DateTime::from_timestamp_millis(event.created_at)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            println!("  {}  {:<9} {}", when, event.kind, event.detail);
        }
    }
    Ok(())
}

fn handle_screening_command(
    questions: &Path,
    out_questions: &Path,
    out_answers: &Path,
    count: usize,
    seed: Option<u64>,
) -> Result<()> {
    let pool = read_questions(questions)?;
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let test = ScreeningTest::generate(&pool, count, &mut rng)?;
    test.write(out_questions, out_answers)?;

    println!(
        "{} {} of {} questions -> {}, {}",
        "Screening:".green(),
        test.questions.len(),
        pool.len(),
        out_questions.display(),
        out_answers.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging once the configured level is known
    setup_logging(config.log_level.as_deref()).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    if let Err(err) = run_application(&cli, &config).await {
        error!("Application failed: {:?}", err);
        if let Some(hint) = failure_hint(&err) {
            eprintln!("{} {}", "Hint:".yellow(), hint);
        }
        return Err(err.wrap_err("Application failed"));
    }

    Ok(())
}

/// Explain a failed command by its scheduler error category
fn failure_hint(err: &eyre::Report) -> Option<&'static str> {
    let wave_err = err.chain().find_map(|e| e.downcast_ref::<WaveError>())?;
    if wave_err.is_transient() {
        Some("the marketplace is unavailable; re-run later")
    } else if wave_err.is_fatal() {
        Some("fix the configuration or stored state before re-running")
    } else {
        None
    }
}
