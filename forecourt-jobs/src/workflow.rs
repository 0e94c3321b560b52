//! The staged batch import workflow.
//!
//! A run moves through scratch collections so a crash never leaves the
//! live data half-written:
//!
//! 1. stage: CSV rows land in `priceReportImport_<token>`
//! 2. group: rows roll up into day buckets in `aggregatedPriceReports_<token>`
//! 3. merge: buckets merge into `dailyPrices` without disturbing days
//!    already maintained live, then openings are backfilled
//! 4. statistics and the station price cache are recomputed
//!
//! Each scratch collection is dropped once the next phase has read it,
//! so whichever scratch collection survives a crash names the phase to
//! resume from.

use crate::config::EngineConfig;
use crate::import::price_reports::stage_price_reports;
use crate::import::{ImportError, ImportOutcome};
use forecourt_core::pipeline::builders::{day_bucket_pipeline, price_data_pipeline};
use forecourt_core::pipeline::exec::aggregate;
use forecourt_core::pipeline::{PipelineError, Stage};
use forecourt_core::repo::{
    DailyPriceRepository, RepoError, StationRepository, StatisticsRepository, DAILY_PRICES,
    DAILY_STATISTICS, STATIONS,
};
use forecourt_core::store::{DocumentStore, StoreError};
use rand::Rng;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

pub const PRICE_IMPORT_PREFIX: &str = "priceReportImport_";
pub const AGGREGATED_PREFIX: &str = "aggregatedPriceReports_";

/// Errors from the import workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("several interrupted {kind} collections exist ({candidates:?}); drop the stale ones")]
    AmbiguousRecovery {
        kind: &'static str,
        candidates: Vec<String>,
    },

    #[error("an interrupted run left scratch collections behind ({candidates:?}); recover it first or drop them")]
    InterruptedRunExists { candidates: Vec<String> },
}

/// What one workflow run did.
#[derive(Debug, Clone, Default)]
pub struct WorkflowReport {
    /// Staging counters. Zeroed when resuming an interrupted run.
    pub import: ImportOutcome,
    /// Day buckets merged into the live collection.
    pub buckets: usize,
    /// Scratch collection an interrupted run was resumed from.
    pub resumed_from: Option<String>,
}

pub struct ImportWorkflow<'a> {
    store: &'a DocumentStore,
    config: &'a EngineConfig,
}

impl<'a> ImportWorkflow<'a> {
    pub fn new(store: &'a DocumentStore, config: &'a EngineConfig) -> Self {
        ImportWorkflow { store, config }
    }

    /// Runs a full import over the given CSV files and directories.
    /// With `clear`, the live buckets and statistics are wiped first.
    ///
    /// Refuses to start while scratch collections from an interrupted
    /// run exist, so they cannot be silently orphaned.
    pub fn run(&self, paths: &[PathBuf], clear: bool) -> Result<WorkflowReport, WorkflowError> {
        let mut leftovers = self.store.list_collections(PRICE_IMPORT_PREFIX)?;
        leftovers.extend(self.store.list_collections(AGGREGATED_PREFIX)?);
        if !leftovers.is_empty() {
            tracing::warn!(?leftovers, "refusing to start over an interrupted run");
            return Err(WorkflowError::InterruptedRunExists {
                candidates: leftovers,
            });
        }

        if clear {
            let buckets = self.store.delete_all(DAILY_PRICES)?;
            let stats = self.store.delete_all(DAILY_STATISTICS)?;
            tracing::info!(buckets, stats, "cleared live collections");
        }

        let staged = format!("{PRICE_IMPORT_PREFIX}{}", run_token());
        let import = timed("stage", || {
            Ok(stage_price_reports(
                self.store,
                &staged,
                paths,
                self.config.minimum_price,
            )?)
        })?;

        let buckets = self.finish_from_staged(&staged)?;
        Ok(WorkflowReport {
            import,
            buckets,
            resumed_from: None,
        })
    }

    /// Picks up an interrupted run from whatever scratch collection it
    /// left behind. Returns `None` when there is nothing to resume.
    pub fn recover(&self) -> Result<Option<WorkflowReport>, WorkflowError> {
        let staged = self.store.list_collections(PRICE_IMPORT_PREFIX)?;
        let aggregated = self.store.list_collections(AGGREGATED_PREFIX)?;

        match staged.as_slice() {
            [] => {}
            [name] => {
                // Buckets grouped from the same staged rows are stale
                // and will be rebuilt.
                for leftover in &aggregated {
                    self.store.drop_collection(leftover)?;
                }
                tracing::info!(collection = name.as_str(), "resuming from staged reports");
                let buckets = self.finish_from_staged(name)?;
                return Ok(Some(WorkflowReport {
                    import: ImportOutcome::default(),
                    buckets,
                    resumed_from: Some(name.clone()),
                }));
            }
            _ => {
                tracing::warn!(candidates = ?staged, "more than one staged scratch collection");
                return Err(WorkflowError::AmbiguousRecovery {
                    kind: "staged report",
                    candidates: staged,
                });
            }
        }

        match aggregated.as_slice() {
            [] => Ok(None),
            [name] => {
                tracing::info!(collection = name.as_str(), "resuming from grouped buckets");
                let buckets = self.finish_from_aggregated(name)?;
                Ok(Some(WorkflowReport {
                    import: ImportOutcome::default(),
                    buckets,
                    resumed_from: Some(name.clone()),
                }))
            }
            _ => {
                tracing::warn!(
                    candidates = ?aggregated,
                    "more than one grouped scratch collection"
                );
                Err(WorkflowError::AmbiguousRecovery {
                    kind: "grouped bucket",
                    candidates: aggregated,
                })
            }
        }
    }

    fn finish_from_staged(&self, staged: &str) -> Result<usize, WorkflowError> {
        let token = staged.strip_prefix(PRICE_IMPORT_PREFIX).unwrap_or(staged);
        let aggregated = format!("{AGGREGATED_PREFIX}{token}");

        timed("group", || {
            let mut pipeline = day_bucket_pipeline(STATIONS);
            pipeline.push(Stage::Out(aggregated.clone()));
            aggregate(self.store, staged, &pipeline)?;
            Ok(())
        })?;
        self.store.drop_collection(staged)?;

        self.finish_from_aggregated(&aggregated)
    }

    fn finish_from_aggregated(&self, aggregated: &str) -> Result<usize, WorkflowError> {
        let buckets = self.store.count(aggregated)?;
        timed("merge", || {
            aggregate(self.store, aggregated, &price_data_pipeline(DAILY_PRICES))?;
            Ok(())
        })?;
        self.store.drop_collection(aggregated)?;

        self.finalize()?;
        Ok(buckets)
    }

    /// The phases that always rerun: opening backfill, statistics,
    /// station price cache.
    fn finalize(&self) -> Result<(), WorkflowError> {
        let daily =
            DailyPriceRepository::with_history_capacity(self.store, self.config.price_history_days);
        timed("backfill-openings", || {
            Ok(daily.backfill_missing_opening_prices()?)
        })?;
        timed("statistics", || {
            Ok(StatisticsRepository::new(self.store).recompute(None, None)?)
        })?;
        timed("price-cache", || {
            Ok(StationRepository::new(self.store).refresh_price_cache(DAILY_PRICES)?)
        })
    }
}

fn timed<T>(
    phase: &'static str,
    f: impl FnOnce() -> Result<T, WorkflowError>,
) -> Result<T, WorkflowError> {
    let started = Instant::now();
    let out = f()?;
    tracing::info!(
        phase,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "phase complete"
    );
    Ok(out)
}

/// Scratch collections are name-spaced per run, so an interrupted run
/// stays recognizable.
fn run_token() -> String {
    let mut seed = [0u8; 16];
    rand::thread_rng().fill(&mut seed[..]);
    blake3::hash(&seed).to_hex()[..12].to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
