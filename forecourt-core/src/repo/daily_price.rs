//! The bucket collection: one document per station, fuel and day.

use super::station::StationRepository;
use super::{RepoError, DAILY_PRICES, LATEST_PRICE_HISTORY_DAYS};
use crate::domain::{DailyPriceAggregate, Fuel, PriceEntry, RecordId, StationId};
use crate::pipeline::builders::{
    missing_opening_backfill_pipeline, opening_price_update, report_price_update,
    set_null_opening_price,
};
use crate::pipeline::exec::{aggregate, update_one, upsert_with_pipeline};
use crate::pipeline::expr::compare;
use crate::pipeline::{Expr, Stage};
use crate::store::filter::get_path;
use crate::store::{DocumentStore, Filter};
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use std::cmp::Ordering;

pub struct DailyPriceRepository<'a> {
    store: &'a DocumentStore,
    history_capacity: usize,
}

impl<'a> DailyPriceRepository<'a> {
    pub fn new(store: &'a DocumentStore) -> Self {
        Self::with_history_capacity(store, LATEST_PRICE_HISTORY_DAYS)
    }

    pub fn with_history_capacity(store: &'a DocumentStore, history_capacity: usize) -> Self {
        DailyPriceRepository {
            store,
            history_capacity,
        }
    }

    /// Folds one price report into its day bucket and returns the
    /// updated bucket.
    ///
    /// The bucket is created on first contact, carrying only its key
    /// fields; that state is detected by the missing station name and
    /// repaired in the same collection lock: the denormalized station
    /// identity is copied in and the opening price resolved from the
    /// latest earlier bucket (or recorded as an explicit null when the
    /// station has no earlier day for this fuel). Afterwards the
    /// station's latest-price cache picks up the new day snapshot.
    pub fn report_price(
        &self,
        station_id: &StationId,
        fuel: Fuel,
        price: f64,
        reported_at: NaiveDateTime,
    ) -> Result<DailyPriceAggregate, RepoError> {
        let stations = StationRepository::new(self.store);
        let station = stations
            .find(station_id)?
            .ok_or_else(|| RepoError::UnknownStation(station_id.clone()))?;

        let day = reported_at.date();
        let entry = PriceEntry {
            record_id: RecordId::random(),
            reported_at,
            price,
            previous_price: None,
            change: None,
        };
        let entry = serde_json::to_value(&entry).map_err(|source| RepoError::Encode {
            what: "price entry",
            source,
        })?;
        let filter = bucket_filter(station_id, fuel, day);

        let updated = self
            .store
            .with_collection_mut(DAILY_PRICES, |docs: &mut Vec<Value>| {
                let mut updated =
                    upsert_with_pipeline(docs, &filter, &report_price_update(&entry))?;

                if get_path(&updated, "station.name").is_none() {
                    let summary =
                        serde_json::to_value(station.summary()).map_err(|source| {
                            RepoError::Encode {
                                what: "station summary",
                                source,
                            }
                        })?;
                    let mut stages =
                        vec![Stage::Set(vec![("station".to_string(), Expr::Lit(summary))])];
                    match latest_earlier_closing(docs, station_id, fuel, day) {
                        Some(closing) => stages.extend(opening_price_update(closing)),
                        None => stages.extend(set_null_opening_price()),
                    }
                    if let Some(repaired) = update_one(docs, &filter, &stages)? {
                        updated = repaired;
                    }
                }
                Ok::<Value, RepoError>(updated)
            })?;

        let bucket: DailyPriceAggregate =
            serde_json::from_value(updated).map_err(|source| RepoError::Decode {
                what: "daily price bucket",
                source,
            })?;

        stations.apply_latest_snapshot(station_id, bucket.snapshot(), self.history_capacity)?;
        Ok(bucket)
    }

    pub fn find_bucket(
        &self,
        station_id: &StationId,
        fuel: Fuel,
        day: NaiveDate,
    ) -> Result<Option<DailyPriceAggregate>, RepoError> {
        match self
            .store
            .find_one(DAILY_PRICES, &bucket_filter(station_id, fuel, day))?
        {
            None => Ok(None),
            Some(doc) => decode(doc).map(Some),
        }
    }

    /// The most recent buckets for a station and fuel, newest first.
    pub fn last_days(
        &self,
        station_id: &StationId,
        fuel: Fuel,
        limit: usize,
    ) -> Result<Vec<DailyPriceAggregate>, RepoError> {
        let filter = Filter::new()
            .eq("station.id", json!(station_id.as_str()))
            .eq("fuel", json!(fuel.key()));
        let mut docs = self.store.find(DAILY_PRICES, &filter)?;
        docs.sort_by(|a, b| {
            compare(
                b.get("day").unwrap_or(&Value::Null),
                a.get("day").unwrap_or(&Value::Null),
            )
        });
        docs.truncate(limit);
        docs.into_iter().map(decode).collect()
    }

    pub fn count(&self) -> Result<usize, RepoError> {
        Ok(self.store.count(DAILY_PRICES)?)
    }

    /// Resolves opening prices for buckets that were imported before
    /// their previous day existed, repairing the first price entry and
    /// the weighted average along the way. Buckets whose opening is an
    /// explicit null are already settled and stay untouched.
    pub fn backfill_missing_opening_prices(&self) -> Result<(), RepoError> {
        let pipeline = missing_opening_backfill_pipeline(DAILY_PRICES);
        aggregate(self.store, DAILY_PRICES, &pipeline)?;
        Ok(())
    }
}

fn bucket_filter(station_id: &StationId, fuel: Fuel, day: NaiveDate) -> Filter {
    Filter::new()
        .eq("station.id", json!(station_id.as_str()))
        .eq("fuel", json!(fuel.key()))
        .eq("day", json!(day.to_string()))
}

/// Closing price of the latest bucket strictly before `day` for the
/// same station and fuel.
fn latest_earlier_closing(
    docs: &[Value],
    station_id: &StationId,
    fuel: Fuel,
    day: NaiveDate,
) -> Option<f64> {
    let station = json!(station_id.as_str());
    let fuel = json!(fuel.key());
    let day = json!(day.to_string());
    docs.iter()
        .filter(|doc| {
            get_path(doc, "station.id") == Some(&station)
                && doc.get("fuel") == Some(&fuel)
                && doc
                    .get("day")
                    .map_or(false, |d| compare(d, &day) == Ordering::Less)
        })
        .max_by(|a, b| {
            compare(
                a.get("day").unwrap_or(&Value::Null),
                b.get("day").unwrap_or(&Value::Null),
            )
        })
        .and_then(|doc| doc.get("closingPrice"))
        .and_then(Value::as_f64)
}

fn decode(doc: Value) -> Result<DailyPriceAggregate, RepoError> {
    serde_json::from_value(doc).map_err(|source| RepoError::Decode {
        what: "daily price bucket",
        source,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Station, StationAddress};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store_with_station() -> (TempDir, DocumentStore) {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let station = Station {
            id: StationId::new("s1"),
            name: "Station Nord".to_string(),
            brand: "NORD".to_string(),
            address: StationAddress {
                street: "Hauptstrasse".to_string(),
                house_number: "1".to_string(),
                post_code: "20095".to_string(),
                city: "Hamburg".to_string(),
            },
            location: None,
            latest_price: BTreeMap::new(),
            latest_prices: BTreeMap::new(),
        };
        StationRepository::new(&store)
            .upsert_master_data(vec![station])
            .unwrap();
        (dir, store)
    }

    fn at(day: &str, time: &str) -> NaiveDateTime {
        format!("{day}T{time}").parse().unwrap()
    }

    #[test]
    fn unknown_station_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let repo = DailyPriceRepository::new(&store);
        let err = repo
            .report_price(
                &StationId::new("ghost"),
                Fuel::E10,
                1.569,
                at("2024-11-19", "03:07:29"),
            )
            .unwrap_err();
        assert!(matches!(err, RepoError::UnknownStation(_)));
    }

    #[test]
    fn first_report_creates_a_bucket_with_identity_and_null_opening() {
        let (_dir, store) = store_with_station();
        let repo = DailyPriceRepository::new(&store);
        let bucket = repo
            .report_price(
                &StationId::new("s1"),
                Fuel::E10,
                1.569,
                at("2024-11-19", "03:07:29"),
            )
            .unwrap();

        assert!(bucket.has_station_identity());
        assert_eq!(bucket.station.name, "Station Nord");
        assert_eq!(bucket.station.post_code, "20095");
        assert_eq!(bucket.opening_price, None);
        assert_eq!(bucket.closing_price, Some(1.569));
        assert_eq!(bucket.prices.len(), 1);
        assert_eq!(bucket.prices[0].previous_price, None);

        // The stored document carries the explicit null marker.
        let raw = store
            .find_one(
                DAILY_PRICES,
                &bucket_filter(
                    &StationId::new("s1"),
                    Fuel::E10,
                    NaiveDate::from_ymd_opt(2024, 11, 19).unwrap(),
                ),
            )
            .unwrap()
            .unwrap();
        assert_eq!(raw["openingPrice"], Value::Null);
    }

    #[test]
    fn next_day_opens_at_the_previous_closing_price() {
        let (_dir, store) = store_with_station();
        let repo = DailyPriceRepository::new(&store);
        let s1 = StationId::new("s1");
        repo.report_price(&s1, Fuel::E10, 1.569, at("2024-11-19", "03:07:29"))
            .unwrap();
        repo.report_price(&s1, Fuel::E10, 1.529, at("2024-11-19", "21:00:00"))
            .unwrap();

        let bucket = repo
            .report_price(&s1, Fuel::E10, 1.499, at("2024-11-20", "04:00:00"))
            .unwrap();

        assert_eq!(bucket.opening_price, Some(1.529));
        assert_eq!(bucket.prices[0].previous_price, Some(1.529));
        let change = bucket.prices[0].change.unwrap();
        assert!((change + 0.03).abs() < 1e-9);
    }

    #[test]
    fn reports_update_the_station_cache() {
        let (_dir, store) = store_with_station();
        let repo = DailyPriceRepository::new(&store);
        let s1 = StationId::new("s1");
        repo.report_price(&s1, Fuel::E10, 1.569, at("2024-11-19", "03:07:29"))
            .unwrap();
        repo.report_price(&s1, Fuel::E10, 1.499, at("2024-11-20", "04:00:00"))
            .unwrap();

        let station = StationRepository::new(&store)
            .find(&s1)
            .unwrap()
            .unwrap();
        let latest = station.latest_for(Fuel::E10).unwrap();
        assert_eq!(latest.day.to_string(), "2024-11-20");
        assert_eq!(latest.closing_price, Some(1.499));
        assert_eq!(station.history_for(Fuel::E10).len(), 2);
    }

    #[test]
    fn last_days_returns_newest_buckets_first() {
        let (_dir, store) = store_with_station();
        let repo = DailyPriceRepository::new(&store);
        let s1 = StationId::new("s1");
        for day in ["2024-11-17", "2024-11-19", "2024-11-18"] {
            repo.report_price(&s1, Fuel::Diesel, 1.6, at(day, "12:00:00"))
                .unwrap();
        }
        repo.report_price(&s1, Fuel::E5, 1.8, at("2024-11-19", "12:00:00"))
            .unwrap();

        let buckets = repo.last_days(&s1, Fuel::Diesel, 2).unwrap();
        let days: Vec<String> = buckets.iter().map(|b| b.day.to_string()).collect();
        assert_eq!(days, vec!["2024-11-19", "2024-11-18"]);
    }

    #[test]
    fn backfill_fills_openings_left_behind_by_batch_imports() {
        let (_dir, store) = store_with_station();
        store
            .insert_many(
                DAILY_PRICES,
                vec![
                    json!({
                        "station": { "id": "s1", "name": "Station Nord" },
                        "fuel": "e5", "day": "2024-11-18",
                        "openingPrice": null, "closingPrice": 1.599,
                        "prices": [],
                    }),
                    json!({
                        "station": { "id": "s1", "name": "Station Nord" },
                        "fuel": "e5", "day": "2024-11-20",
                        "closingPrice": 1.569,
                        "weightedAveragePrice": 1.569,
                        "prices": [{
                            "recordId": "r1",
                            "reportedAt": "2024-11-20T03:07:29",
                            "price": 1.569,
                        }],
                    }),
                ],
            )
            .unwrap();

        let repo = DailyPriceRepository::new(&store);
        repo.backfill_missing_opening_prices().unwrap();

        let s1 = StationId::new("s1");
        let later = repo
            .find_bucket(&s1, Fuel::E5, NaiveDate::from_ymd_opt(2024, 11, 20).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(later.opening_price, Some(1.599));
        // The repair also rewrites the first entry and the weighted
        // average against the found opening: 11249s at 1.599, then
        // 1.569 until midnight.
        assert_eq!(later.prices[0].previous_price, Some(1.599));
        assert!((later.prices[0].change.unwrap() + 0.03).abs() < 1e-9);
        assert_eq!(later.weighted_average_price, Some(1.573));
        assert_eq!(later.station.name, "Station Nord");

        // The settled bucket keeps its explicit null.
        let earlier = store
            .find_one(
                DAILY_PRICES,
                &bucket_filter(&s1, Fuel::E5, NaiveDate::from_ymd_opt(2024, 11, 18).unwrap()),
            )
            .unwrap()
            .unwrap();
        assert_eq!(earlier["openingPrice"], Value::Null);
        assert_eq!(earlier["closingPrice"], json!(1.599));
    }
}
