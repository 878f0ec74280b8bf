//! Entrypoint (C20).
//!
//! Grounded in the teacher's `bin`/CLI split: `clap`-derived subcommands
//! over the shared [`CoreRuntime`], one-shot commands for operators and a
//! `run` loop for the scheduler driving continuous scans (spec.md §4.20).

use std::collections::HashMap;

use clap::{Parser, Subcommand};
use pricewatch_core::config::ConfigManager;
use pricewatch_core::domain::{Id, ScanJobKind};
use pricewatch_core::logging;
use pricewatch_core::metrics;
use pricewatch_core::runtime::CoreRuntime;
use pricewatch_core::scheduler::{select_due_categories, SchedulerParams};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pricewatch", version, about = "Multi-retailer price-anomaly scan core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop forever, ticking every `scheduler_interval_minutes`.
    Run,
    /// Scan a single category immediately, bypassing the scheduler's due check.
    ScanOnce {
        #[arg(long)]
        category_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_manager = ConfigManager::new()?;
    config_manager.initialize_on_first_run()?;
    let config = config_manager.load()?;

    let _log_guard = logging::init(&config.logging)?;
    if let Err(e) = metrics::install() {
        warn!(error = %e, "failed to install prometheus recorder, continuing without metrics");
    }

    let cli = Cli::parse();
    let runtime = CoreRuntime::bootstrap(config).await?;

    match cli.command {
        Command::Run => run_scheduler_loop(runtime).await,
        Command::ScanOnce { category_id } => scan_once(&runtime, Id(category_id)).await,
    }
}

async fn run_scheduler_loop(runtime: CoreRuntime) -> anyhow::Result<()> {
    let interval = chrono::Duration::minutes(runtime.config.scan.scheduler_interval_minutes.max(1));
    let params = SchedulerParams::default();

    info!(interval_minutes = interval.num_minutes(), "scheduler loop starting");

    loop {
        if let Err(e) = tick(&runtime, &params).await {
            error!(error = %e, "scheduler tick failed");
        }

        let sleep_for = interval.to_std().unwrap_or(std::time::Duration::from_secs(300));
        tokio::select! {
            () = tokio::time::sleep(sleep_for) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, stopping scheduler loop");
                return Ok(());
            }
        }
    }
}

async fn tick(runtime: &CoreRuntime, params: &SchedulerParams) -> anyhow::Result<()> {
    let categories = runtime.category_store.list_enabled().await?;
    let due = select_due_categories(categories, chrono::Utc::now(), &runtime.store_health, params);

    if due.is_empty() {
        return Ok(());
    }
    info!(count = due.len(), "categories due for scan");

    let mut exclusions_by_store: HashMap<String, Vec<_>> = HashMap::new();
    for store in due.iter().map(|c| c.store.clone()).collect::<std::collections::HashSet<_>>() {
        let rules = runtime.product_exclusion_store.list_for_store(&store).await?;
        exclusions_by_store.insert(store, rules);
    }

    let job = runtime.scan_job_store.create(ScanJobKind::Scheduled, due.len() as i64).await?;
    runtime.scan_job_store.mark_running(job.id).await?;

    let results = runtime
        .scan_engine
        .scan_many(due, &exclusions_by_store, runtime.category_repository.clone(), |result| {
            if let Some(err) = &result.error {
                warn!(category_id = %result.category_id, store = %result.store, error = %err, "category scan failed");
            } else {
                info!(
                    category_id = %result.category_id,
                    store = %result.store,
                    products = result.products_after_filter,
                    deals = result.deals.len(),
                    "category scan completed"
                );
            }
        })
        .await;

    runtime.scan_job_store.complete(job.id, &results).await?;

    for result in &results {
        for deal in &result.deals {
            match runtime.alert_pipeline.process(deal).await {
                Ok(outcome) => info!(sku = %deal.product.sku, outcome = ?outcome, "alert pipeline processed deal"),
                Err(e) => error!(sku = %deal.product.sku, error = %e, "alert pipeline failed"),
            }
        }
    }

    Ok(())
}

async fn scan_once(runtime: &CoreRuntime, category_id: Id) -> anyhow::Result<()> {
    let Some(category) = runtime.category_store.get(category_id).await? else {
        anyhow::bail!("category {category_id} not found");
    };
    let exclusions = runtime.product_exclusion_store.list_for_store(&category.store).await?;

    let job = runtime.scan_job_store.create(ScanJobKind::Manual, 1).await?;
    runtime.scan_job_store.mark_running(job.id).await?;

    let result = runtime.scan_engine.scan(&category, &exclusions).await;
    runtime.category_repository.record_scan_result(&result).await?;
    runtime.scan_job_store.complete(job.id, std::slice::from_ref(&result)).await?;

    info!(
        category_id = %result.category_id,
        products = result.products_after_filter,
        deals = result.deals.len(),
        "manual scan completed"
    );

    for deal in &result.deals {
        let outcome = runtime.alert_pipeline.process(deal).await?;
        info!(sku = %deal.product.sku, outcome = ?outcome, "alert pipeline processed deal");
    }

    Ok(())
}
