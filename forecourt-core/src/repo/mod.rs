//! Store-backed repositories over the engine's collections.
//!
//! Each repository borrows the [`DocumentStore`](crate::store::DocumentStore)
//! and exposes the typed operations of one collection. Write paths that
//! must be atomic (the single-report bucket update with its first-report
//! repair) run inside one collection lock; everything else composes the
//! pipeline builders.

pub mod daily_price;
pub mod station;
pub mod statistics;

pub use daily_price::DailyPriceRepository;
pub use station::StationRepository;
pub use statistics::StatisticsRepository;

use crate::domain::StationId;
use crate::pipeline::PipelineError;
use crate::store::StoreError;
use thiserror::Error;

/// Permanent collection holding one bucket per station, fuel and day.
pub const DAILY_PRICES: &str = "dailyPrices";
/// Station master data plus the latest-price cache.
pub const STATIONS: &str = "stations";
/// Fleet-wide and per-post-code daily statistics rows.
pub const DAILY_STATISTICS: &str = "dailyStatistics";

/// Days of per-fuel snapshot history kept on each station.
pub const LATEST_PRICE_HISTORY_DAYS: usize = 30;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("cannot decode {what}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode {what}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("station {0} is not registered")]
    UnknownStation(StationId),
}
