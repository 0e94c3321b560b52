//! Fleet-wide and regional statistics rows.

use super::{RepoError, DAILY_PRICES, DAILY_STATISTICS};
use crate::domain::{CompoundDailyAggregate, DailyFuelStatistics, Fuel};
use crate::pipeline::builders::{compound_latest_pipeline, daily_statistics_pipeline};
use crate::pipeline::exec::aggregate;
use crate::pipeline::{MatchCond, Stage};
use crate::store::{DocumentStore, Filter};
use chrono::NaiveDate;
use serde_json::{json, Value};

pub struct StatisticsRepository<'a> {
    store: &'a DocumentStore,
}

impl<'a> StatisticsRepository<'a> {
    pub fn new(store: &'a DocumentStore) -> Self {
        StatisticsRepository { store }
    }

    /// Recomputes the fleet-wide rows and the per-post-code rows from
    /// the day buckets, optionally narrowed to one day or fuel. Rows
    /// outside the narrowed slice are left alone.
    pub fn recompute(
        &self,
        day: Option<NaiveDate>,
        fuel: Option<Fuel>,
    ) -> Result<(), RepoError> {
        let mut prefilter = Filter::new();
        if let Some(day) = day {
            prefilter = prefilter.eq("day", json!(day.to_string()));
        }
        if let Some(fuel) = fuel {
            prefilter = prefilter.eq("fuel", json!(fuel.key()));
        }

        for per_post_code in [false, true] {
            let mut pipeline = daily_statistics_pipeline(per_post_code, DAILY_STATISTICS);
            if !prefilter.is_empty() {
                pipeline
                    .stages
                    .insert(0, Stage::Match(MatchCond::Query(prefilter.clone())));
            }
            aggregate(self.store, DAILY_PRICES, &pipeline)?;
        }
        Ok(())
    }

    /// The fleet-wide row for one day and fuel.
    pub fn for_day_and_fuel(
        &self,
        day: NaiveDate,
        fuel: Fuel,
    ) -> Result<Option<DailyFuelStatistics>, RepoError> {
        let filter = Filter::new()
            .eq("day", json!(day.to_string()))
            .eq("fuel", json!(fuel.key()))
            .missing("postCode");
        self.decode_one(self.store.find_one(DAILY_STATISTICS, &filter)?)
    }

    /// The regional row for one day, fuel and post code.
    pub fn for_post_code(
        &self,
        day: NaiveDate,
        fuel: Fuel,
        post_code: &str,
    ) -> Result<Option<DailyFuelStatistics>, RepoError> {
        let filter = Filter::new()
            .eq("day", json!(day.to_string()))
            .eq("fuel", json!(fuel.key()))
            .eq("postCode", json!(post_code));
        self.decode_one(self.store.find_one(DAILY_STATISTICS, &filter)?)
    }

    /// The newest statistics day with all fuels folded into one value.
    pub fn latest_compound(&self) -> Result<Option<CompoundDailyAggregate>, RepoError> {
        let docs = aggregate(self.store, DAILY_STATISTICS, &compound_latest_pipeline())?;
        match docs.into_iter().next() {
            None => Ok(None),
            Some(doc) => serde_json::from_value(doc)
                .map(Some)
                .map_err(|source| RepoError::Decode {
                    what: "compound daily aggregate",
                    source,
                }),
        }
    }

    pub fn count(&self) -> Result<usize, RepoError> {
        Ok(self.store.count(DAILY_STATISTICS)?)
    }

    pub fn delete_all(&self) -> Result<(), RepoError> {
        self.store.delete_all(DAILY_STATISTICS)?;
        Ok(())
    }

    fn decode_one(
        &self,
        doc: Option<Value>,
    ) -> Result<Option<DailyFuelStatistics>, RepoError> {
        match doc {
            None => Ok(None),
            Some(doc) => serde_json::from_value(doc)
                .map(Some)
                .map_err(|source| RepoError::Decode {
                    what: "daily statistics row",
                    source,
                }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
