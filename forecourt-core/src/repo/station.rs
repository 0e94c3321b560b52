//! Station master data and the per-station price cache.

use super::{RepoError, LATEST_PRICE_HISTORY_DAYS, STATIONS};
use crate::domain::{DailyPriceSnapshot, Station, StationId};
use crate::pipeline::builders::latest_prices_per_station_pipeline;
use crate::pipeline::exec::aggregate;
use crate::store::{DocumentStore, Filter};
use serde_json::{json, Value};

pub struct StationRepository<'a> {
    store: &'a DocumentStore,
}

impl<'a> StationRepository<'a> {
    pub fn new(store: &'a DocumentStore) -> Self {
        StationRepository { store }
    }

    pub fn find(&self, id: &StationId) -> Result<Option<Station>, RepoError> {
        let filter = Filter::new().eq("id", json!(id.as_str()));
        match self.store.find_one(STATIONS, &filter)? {
            None => Ok(None),
            Some(doc) => decode(doc).map(Some),
        }
    }

    pub fn count(&self) -> Result<usize, RepoError> {
        Ok(self.store.count(STATIONS)?)
    }

    /// Inserts or replaces master data for the given stations. An
    /// existing station keeps its latest-price cache; only the master
    /// fields are overwritten.
    pub fn upsert_master_data(&self, incoming: Vec<Station>) -> Result<usize, RepoError> {
        let count = incoming.len();
        self.store
            .with_collection_mut(STATIONS, |docs: &mut Vec<Value>| {
                for station in &incoming {
                    let mut value = encode(station)?;
                    let id = json!(station.id.as_str());
                    match docs
                        .iter_mut()
                        .find(|doc| doc.get("id") == Some(&id))
                    {
                        Some(existing) => {
                            for cache_field in ["latestPrice", "latestPrices"] {
                                if let Some(cached) = existing.get(cache_field) {
                                    value[cache_field] = cached.clone();
                                }
                            }
                            *existing = value;
                        }
                        None => docs.push(value),
                    }
                }
                Ok(count)
            })
    }

    pub fn delete_all(&self) -> Result<usize, RepoError> {
        Ok(self.store.delete_all(STATIONS)?)
    }

    /// Folds one freshly recomputed day snapshot into the station's
    /// cache. A station that disappeared since the report was accepted
    /// is left alone.
    pub fn apply_latest_snapshot(
        &self,
        id: &StationId,
        snapshot: DailyPriceSnapshot,
        capacity: usize,
    ) -> Result<(), RepoError> {
        let wanted = json!(id.as_str());
        self.store
            .with_collection_mut(STATIONS, |docs: &mut Vec<Value>| {
                if let Some(doc) = docs.iter_mut().find(|doc| doc.get("id") == Some(&wanted)) {
                    let mut station: Station = decode(doc.clone())?;
                    station.apply_snapshot(snapshot, capacity);
                    *doc = encode(&station)?;
                }
                Ok(())
            })
    }

    /// Rebuilds every station's latest-price cache from the bucket
    /// collection in one pass.
    pub fn refresh_price_cache(&self, buckets: &str) -> Result<(), RepoError> {
        let pipeline = latest_prices_per_station_pipeline(LATEST_PRICE_HISTORY_DAYS, STATIONS);
        aggregate(self.store, buckets, &pipeline)?;
        Ok(())
    }
}

fn decode(doc: Value) -> Result<Station, RepoError> {
    serde_json::from_value(doc).map_err(|source| RepoError::Decode {
        what: "station",
        source,
    })
}

fn encode(station: &Station) -> Result<Value, RepoError> {
    serde_json::to_value(station).map_err(|source| RepoError::Encode {
        what: "station",
        source,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Fuel, StationAddress};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store() -> (TempDir, DocumentStore) {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn station(id: &str, name: &str) -> Station {
        Station {
            id: StationId::new(id),
            name: name.to_string(),
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
        }
    }

    fn snapshot(day: &str) -> DailyPriceSnapshot {
        DailyPriceSnapshot {
            fuel: Fuel::E5,
            day: day.parse::<NaiveDate>().unwrap(),
            opening_price: None,
            closing_price: Some(1.7),
            lowest_price: None,
            highest_price: None,
            weighted_average_price: Some(1.7),
        }
    }

    #[test]
    fn find_round_trips_through_the_store() {
        let (_dir, store) = store();
        let repo = StationRepository::new(&store);
        repo.upsert_master_data(vec![station("s1", "Station Nord")])
            .unwrap();

        let found = repo.find(&StationId::new("s1")).unwrap().unwrap();
        assert_eq!(found.name, "Station Nord");
        assert!(repo.find(&StationId::new("nope")).unwrap().is_none());
    }

    #[test]
    fn reimport_preserves_the_price_cache() {
        let (_dir, store) = store();
        let repo = StationRepository::new(&store);
        repo.upsert_master_data(vec![station("s1", "Station Nord")])
            .unwrap();
        repo.apply_latest_snapshot(&StationId::new("s1"), snapshot("2024-11-19"), 30)
            .unwrap();

        // Master data import runs again with a renamed station.
        repo.upsert_master_data(vec![station("s1", "Station Nord Renamed")])
            .unwrap();

        let found = repo.find(&StationId::new("s1")).unwrap().unwrap();
        assert_eq!(found.name, "Station Nord Renamed");
        assert_eq!(
            found.latest_for(Fuel::E5).unwrap().closing_price,
            Some(1.7)
        );
        assert_eq!(found.history_for(Fuel::E5).len(), 1);
    }

    #[test]
    fn snapshot_for_unknown_station_is_a_no_op() {
        let (_dir, store) = store();
        let repo = StationRepository::new(&store);
        repo.apply_latest_snapshot(&StationId::new("ghost"), snapshot("2024-11-19"), 30)
            .unwrap();
        assert_eq!(repo.count().unwrap(), 0);
    }

    #[test]
    fn cache_refresh_builds_per_fuel_maps_from_buckets() {
        let (_dir, store) = store();
        let repo = StationRepository::new(&store);
        repo.upsert_master_data(vec![station("s1", "Station Nord")])
            .unwrap();
        store
            .insert_many(
                "buckets",
                vec![
                    serde_json::json!({
                        "station": { "id": "s1" }, "fuel": "e5", "day": "2024-11-18",
                        "closingPrice": 1.6, "weightedAveragePrice": 1.6,
                    }),
                    serde_json::json!({
                        "station": { "id": "s1" }, "fuel": "e5", "day": "2024-11-19",
                        "closingPrice": 1.7, "weightedAveragePrice": 1.7,
                    }),
                    serde_json::json!({
                        "station": { "id": "s1" }, "fuel": "diesel", "day": "2024-11-19",
                        "closingPrice": 1.5, "weightedAveragePrice": 1.5,
                    }),
                ],
            )
            .unwrap();

        repo.refresh_price_cache("buckets").unwrap();

        let found = repo.find(&StationId::new("s1")).unwrap().unwrap();
        assert_eq!(found.latest_for(Fuel::E5).unwrap().closing_price, Some(1.7));
        assert_eq!(found.latest_for(Fuel::Diesel).unwrap().closing_price, Some(1.5));
        let days: Vec<String> = found
            .history_for(Fuel::E5)
            .iter()
            .map(|s| s.day.to_string())
            .collect();
        assert_eq!(days, vec!["2024-11-19", "2024-11-18"]);
    }
}
