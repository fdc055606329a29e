use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use dotenv::dotenv;
use gradepipe::{
    Driver, Fetcher, GpaStore, MemoryStore, PipelineConfig, PipelineContext, PostgresStore,
    RunOptions, RunSummary,
};
use log::{LevelFilter, error, info, warn};

/// Fetch historical grade distributions and upsert them into `gpa_data`.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Maximum number of requests in flight.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Per-request timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Rows per upsert transaction.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Extra attempts for a batch that rolled back.
    #[arg(long)]
    retries: Option<u32>,
    /// Refetch every course, ignoring terms already stored.
    #[arg(long)]
    full: bool,
    /// Run the pipeline without writing to the database.
    #[arg(long)]
    dry_run: bool,
    /// Create the gpa_data table before running.
    #[arg(long)]
    init_schema: bool,
}

impl Cli {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency.max(1);
        }
        if let Some(secs) = self.timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size.max(1);
        }
        if let Some(retries) = self.retries {
            config.batch_retries = retries;
        }
    }
}

async fn run_with<S: GpaStore>(
    ctx: &PipelineContext,
    store: &S,
    cli: &Cli,
    interrupted: &AtomicBool,
) -> anyhow::Result<RunSummary> {
    let config = &ctx.config;
    info!("max concurrent requests: {}", config.concurrency);
    info!("bulk insert size: {} records", config.batch_size);

    let fetcher = Fetcher::new(
        &ctx.request_client,
        config.concurrency,
        config.request_timeout,
    );
    let options = RunOptions {
        batch_size: config.batch_size,
        batch_retries: config.batch_retries,
        full: cli.full,
        discover_newest_term: true,
    };
    let driver = Driver::new(store, fetcher, &ctx.year_extractor, options, interrupted);
    Ok(driver.run().await?)
}

async fn run(cli: Cli) -> anyhow::Result<RunSummary> {
    let mut config = PipelineConfig::new()?;
    cli.apply(&mut config);
    let ctx = PipelineContext::new(config)?;

    let store =
        PostgresStore::connect(&ctx.config.database_url, ctx.config.db_max_connections).await?;
    if cli.init_schema {
        store.init_schema().await?;
    }

    // The first Ctrl-C stops new requests and batches without cutting a
    // transaction short; a second one exits at once.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received, stopping after in-flight work (Ctrl-C again to abort)");
        flag.store(true, Ordering::SeqCst);
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("second interrupt, exiting");
            std::process::exit(130);
        }
    });

    if cli.dry_run {
        info!("dry run: rows are kept in memory");
        let items = store.work_items(cli.full).await?;
        let memory = MemoryStore::new(items);
        return run_with(&ctx, &memory, &cli, &interrupted).await;
    }
    run_with(&ctx, &store, &cli, &interrupted).await
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    match run(Cli::parse()).await {
        Ok(summary) => {
            println!("{summary}");
            if summary.batches_failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
