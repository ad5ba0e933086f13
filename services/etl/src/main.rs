//! IDA ETL - batch load of the IDA spreadsheets into the warehouse
//!
//! Usage:
//!   # Built-in 2019 open-data files:
//!   cargo run --bin etl
//!
//!   # From a sources file, one service only:
//!   cargo run --bin etl -- --sources config/sources.json --service SMP
//!
//!   # Parse and normalize without touching PostgreSQL:
//!   cargo run --bin etl -- --dry-run

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use uuid::Uuid;

use etl::config::{default_sources, load_sources_config, select_sources, Config, SourceFile};
use etl::fetcher::HttpFetcher;
use etl::loader::FactPolicy;
use etl::logging::init_logging;
use etl::memory::MemoryWarehouse;
use etl::pipeline::{Pipeline, RunReport};
use etl::warehouse::{PgWarehouse, Warehouse};

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Loads ANATEL IDA spreadsheets into the IDA data mart")]
struct Args {
    /// Path to sources config file (built-in list when omitted)
    #[arg(long)]
    sources: Option<PathBuf>,

    /// Only files tagged with this service (SMP, STFC, SCM)
    #[arg(long)]
    service: Option<String>,

    /// Only files for this year
    #[arg(long)]
    year: Option<i32>,

    /// Force re-download even if cached
    #[arg(long, default_value = "false")]
    force: bool,

    /// Dry run - load into memory instead of the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// What to do with facts that already exist
    #[arg(long, value_enum, default_value_t = FactPolicy::Skip)]
    fact_policy: FactPolicy,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;
    init_logging(config.json_logs);

    let run_id = Uuid::new_v4();
    info!(%run_id, dry_run = args.dry_run, "IDA ETL starting");

    let sources = match &args.sources {
        Some(path) => {
            let sources_config = load_sources_config(path)?;
            info!(path = %path.display(), version = %sources_config.version, "sources config loaded");
            sources_config.sources
        }
        None => default_sources(),
    };
    let sources = select_sources(sources, args.service.as_deref(), args.year);
    if sources.is_empty() {
        anyhow::bail!("No sources match the filter criteria");
    }

    let fetcher = HttpFetcher::new(&config, args.force).context("Failed to build HTTP client")?;

    let report = if args.dry_run {
        let warehouse = MemoryWarehouse::new();
        let report = run(&fetcher, &warehouse, args.fact_policy, run_id, &sources).await;
        info!(
            facts = warehouse.fact_count(),
            "dry run finished, nothing written to the database"
        );
        report
    } else {
        let db_url = config.require_db_url()?;
        let warehouse = PgWarehouse::connect(db_url, &config.db_schema)
            .await
            .context("Failed to connect to database")?;
        let missing = warehouse.missing_tables().await?;
        if !missing.is_empty() {
            anyhow::bail!("Warehouse schema incomplete, missing: {}", missing.join(", "));
        }
        let report = run(&fetcher, &warehouse, args.fact_policy, run_id, &sources).await;
        warehouse.close().await;
        report
    };

    if report.is_success() {
        if report.failed() > 0 {
            warn!(failed = report.failed(), "run finished with failed files");
        }
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn run(
    fetcher: &HttpFetcher,
    warehouse: &dyn Warehouse,
    policy: FactPolicy,
    run_id: Uuid,
    sources: &[SourceFile],
) -> RunReport {
    let report = Pipeline::new(fetcher, warehouse, policy)
        .run(run_id, sources)
        .await;
    report.log_summary();
    report
}
