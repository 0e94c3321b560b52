//! Forecourt CLI — fuel price aggregation commands.
//!
//! Commands:
//! - `import-prices` — run the staged batch import over price report CSVs
//! - `import-stations` — upsert station master data from a CSV
//! - `recompute-stats` — rebuild daily statistics, optionally narrowed
//! - `report-price` — fold a single live price report into its day bucket
//! - `show-station` — master data, latest prices and fleet standing

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use forecourt_core::domain::{DailyPriceAggregate, DailyPriceSnapshot, Fuel, StationId};
use forecourt_core::repo::{DailyPriceRepository, StationRepository, StatisticsRepository};
use forecourt_core::store::DocumentStore;
use forecourt_jobs::workflow::{ImportWorkflow, WorkflowReport};
use forecourt_jobs::EngineConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forecourt", about = "Forecourt CLI — fuel price aggregation engine")]
struct Cli {
    /// Path to the engine config file.
    #[arg(long, global = true, default_value = "forecourt.toml")]
    config: PathBuf,

    /// Data directory, overriding the config file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the staged batch import over price report CSV files or directories.
    ImportPrices {
        /// CSV files or directories to walk for .csv files. With no
        /// paths the stored buckets are re-aggregated without importing.
        paths: Vec<PathBuf>,

        /// Wipe the live buckets and statistics first.
        #[arg(long, default_value_t = false)]
        clear: bool,

        /// Resume an interrupted run instead of importing anything new.
        #[arg(long, default_value_t = false)]
        recover: bool,
    },
    /// Upsert station master data from a CSV file.
    ImportStations {
        /// Master data CSV.
        path: PathBuf,

        /// Delete all stations first.
        #[arg(long, default_value_t = false)]
        clear: bool,
    },
    /// Rebuild the daily statistics rows from the day buckets.
    RecomputeStats {
        /// Only this day (YYYY-MM-DD).
        #[arg(long)]
        day: Option<NaiveDate>,

        /// Only this fuel: diesel, e5 or e10.
        #[arg(long)]
        fuel: Option<Fuel>,

        /// Backfill missing opening prices first.
        #[arg(long, default_value_t = false)]
        repair_openings: bool,
    },
    /// Fold one live price report into its day bucket.
    ReportPrice {
        /// Station id.
        #[arg(long)]
        station: String,

        /// Fuel: diesel, e5 or e10.
        #[arg(long)]
        fuel: Fuel,

        /// Price in EUR.
        #[arg(long)]
        price: f64,

        /// Report time (YYYY-MM-DDTHH:MM:SS). Defaults to now.
        #[arg(long)]
        at: Option<NaiveDateTime>,
    },
    /// Show a station's master data, latest prices and fleet standing.
    ShowStation {
        /// Station id.
        id: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config {:?}", cli.config))?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    let store = DocumentStore::open(&config.data_dir)?;

    match cli.command {
        Commands::ImportPrices {
            paths,
            clear,
            recover,
        } => run_import_prices(&store, &config, paths, clear, recover),
        Commands::ImportStations { path, clear } => run_import_stations(&store, path, clear),
        Commands::RecomputeStats {
            day,
            fuel,
            repair_openings,
        } => run_recompute_stats(&store, &config, day, fuel, repair_openings),
        Commands::ReportPrice {
            station,
            fuel,
            price,
            at,
        } => run_report_price(&store, &config, station, fuel, price, at),
        Commands::ShowStation { id } => run_show_station(&store, id),
    }
}

fn run_import_prices(
    store: &DocumentStore,
    config: &EngineConfig,
    paths: Vec<PathBuf>,
    clear: bool,
    recover: bool,
) -> Result<()> {
    let workflow = ImportWorkflow::new(store, config);

    if recover {
        if !paths.is_empty() || clear {
            bail!("--recover resumes an interrupted run and takes no paths or --clear");
        }
        match workflow.recover()? {
            Some(report) => print_workflow_report(&report),
            None => println!("Nothing to recover."),
        }
        return Ok(());
    }

    let report = workflow.run(&paths, clear)?;
    print_workflow_report(&report);
    Ok(())
}

fn print_workflow_report(report: &WorkflowReport) {
    if let Some(collection) = &report.resumed_from {
        println!("Resumed interrupted run from {collection}");
    } else {
        println!(
            "Staged {} of {} rows from {} files ({} skipped)",
            report.import.imported, report.import.rows, report.import.files, report.import.skipped
        );
    }
    println!("Merged {} day buckets", report.buckets);
}

fn run_import_stations(store: &DocumentStore, path: PathBuf, clear: bool) -> Result<()> {
    let repo = StationRepository::new(store);
    if clear {
        let removed = repo.delete_all()?;
        println!("Deleted {removed} stations");
    }
    let outcome = forecourt_jobs::import::stations::import_stations(store, &path)?;
    println!(
        "Imported {} of {} stations ({} skipped)",
        outcome.imported, outcome.rows, outcome.skipped
    );
    Ok(())
}

fn run_recompute_stats(
    store: &DocumentStore,
    config: &EngineConfig,
    day: Option<NaiveDate>,
    fuel: Option<Fuel>,
    repair_openings: bool,
) -> Result<()> {
    if repair_openings {
        DailyPriceRepository::with_history_capacity(store, config.price_history_days)
            .backfill_missing_opening_prices()?;
        println!("Backfilled missing opening prices");
    }
    StatisticsRepository::new(store).recompute(day, fuel)?;
    let rows = StatisticsRepository::new(store).count()?;
    println!("Statistics recomputed ({rows} rows)");
    Ok(())
}

fn run_report_price(
    store: &DocumentStore,
    config: &EngineConfig,
    station: String,
    fuel: Fuel,
    price: f64,
    at: Option<NaiveDateTime>,
) -> Result<()> {
    let reported_at = at.unwrap_or_else(|| chrono::Local::now().naive_local());
    let repo = DailyPriceRepository::with_history_capacity(store, config.price_history_days);
    let bucket = repo.report_price(&StationId::new(station), fuel, price, reported_at)?;
    print_bucket(&bucket);
    Ok(())
}

fn print_bucket(bucket: &DailyPriceAggregate) {
    println!(
        "{} {} at {}",
        bucket.day,
        bucket.fuel.display_name(),
        bucket.station.name
    );
    println!(
        "  opening {}  closing {}  weighted {}",
        fmt_price(bucket.opening_price),
        fmt_price(bucket.closing_price),
        fmt_price(bucket.weighted_average_price)
    );
    println!(
        "  low {}  high {}  reports {}",
        fmt_price(bucket.lowest_price.as_ref().map(|p| p.price)),
        fmt_price(bucket.highest_price.as_ref().map(|p| p.price)),
        bucket.prices.len()
    );
}

fn run_show_station(store: &DocumentStore, id: String) -> Result<()> {
    let id = StationId::new(id);
    let Some(station) = StationRepository::new(store).find(&id)? else {
        bail!("unknown station {:?}", id.as_str());
    };

    println!("{} ({})", station.name, station.brand);
    println!(
        "  {} {}, {} {}",
        station.address.street,
        station.address.house_number,
        station.address.post_code,
        station.address.city
    );
    if let Some(location) = station.location {
        println!("  lat {:.5} lon {:.5}", location.latitude, location.longitude);
    }

    let stats = StatisticsRepository::new(store);
    for fuel in Fuel::ALL {
        let Some(snapshot) = station.latest_for(fuel) else {
            continue;
        };
        println!("{}: {}", fuel.display_name(), snapshot_line(snapshot));
        if let (Some(weighted), Some(fleet)) = (
            snapshot.weighted_average_price,
            stats.for_day_and_fuel(snapshot.day, fuel)?,
        ) {
            println!(
                "  fleet standing {} (fleet avg {})",
                fleet.band(weighted),
                fmt_price(Some(fleet.weighted_average_price))
            );
        }
    }
    Ok(())
}

fn snapshot_line(snapshot: &DailyPriceSnapshot) -> String {
    format!(
        "{} closing {} (low {}, high {}, weighted {})",
        snapshot.day,
        fmt_price(snapshot.closing_price),
        fmt_price(snapshot.lowest_price.as_ref().map(|p| p.price)),
        fmt_price(snapshot.highest_price.as_ref().map(|p| p.price)),
        fmt_price(snapshot.weighted_average_price)
    )
}

fn fmt_price(price: Option<f64>) -> String {
    match price {
        Some(price) => format!("{price:.3}"),
        None => "-".to_string(),
    }
}
