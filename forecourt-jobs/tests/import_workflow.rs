//! End-to-end runs of the staged import workflow against fixture CSVs.

use chrono::NaiveDate;
use forecourt_core::domain::{Fuel, StationId};
use forecourt_core::repo::{
    DailyPriceRepository, StationRepository, StatisticsRepository, DAILY_PRICES,
};
use forecourt_core::store::{DocumentStore, Filter};
use forecourt_jobs::import::stations::import_stations;
use forecourt_jobs::workflow::{
    ImportWorkflow, WorkflowError, AGGREGATED_PREFIX, PRICE_IMPORT_PREFIX,
};
use forecourt_jobs::EngineConfig;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const STATIONS_CSV: &str = "\
uuid,name,brand,street,house_number,post_code,city,latitude,longitude
s1,STATION NORD,NORD,HAUPTSTRASSE,1,20095,HAMBURG,53.55,9.99
s2,STATION SUED,SUED,SENDLINGER STR.,2,80331,MUENCHEN,48.13,11.57
";

const PRICES_DAY_1: &str = "\
date,station_uuid,diesel,e5,e10,dieselchange,e5change,e10change
2024-11-19 03:07:29+01,s1,1.609,1.689,1.569,0,0,1
2024-11-19 06:07:29+01,s1,1.609,1.689,1.629,0,0,1
2024-11-19 08:00:00+01,s1,1.609,1.689,9.999,0,0,0
2024-11-19 12:00:00+01,s2,1.709,1.789,1.669,1,0,0
2024-11-19 13:00:00+01,s1,0.001,1.689,1.629,1,0,0
2024-11-19 14:00:00+01,ghost,1.509,1.589,1.469,0,0,1
";

const PRICES_DAY_2: &str = "\
date,station_uuid,diesel,e5,e10,dieselchange,e5change,e10change
2024-11-20 04:00:00+01,s1,1.609,1.689,1.499,0,0,1
2024-11-20 10:00:00+01,s1,1.609,1.689,1.579,0,0,1
";

fn fixture(dir: &Path) -> (DocumentStore, PathBuf) {
    let csv_dir = dir.join("csv/2024/11");
    fs::create_dir_all(&csv_dir).unwrap();
    fs::write(csv_dir.join("19.csv"), PRICES_DAY_1).unwrap();
    fs::write(csv_dir.join("20.csv"), PRICES_DAY_2).unwrap();
    let stations_csv = dir.join("stations.csv");
    fs::write(&stations_csv, STATIONS_CSV).unwrap();

    let store = DocumentStore::open(dir.join("data")).unwrap();
    import_stations(&store, &stations_csv).unwrap();
    (store, dir.join("csv"))
}

fn day(text: &str) -> NaiveDate {
    text.parse().unwrap()
}

#[test]
fn full_import_builds_buckets_statistics_and_cache() {
    let dir = TempDir::new().unwrap();
    let (store, csv_root) = fixture(dir.path());
    let config = EngineConfig::default();
    let workflow = ImportWorkflow::new(&store, &config);

    let report = workflow.run(&[csv_root], false).unwrap();
    assert_eq!(report.import.files, 2);
    assert_eq!(report.import.rows, 8);
    // Changed cells above the floor, ghost included; the 0.001 diesel
    // is junk.
    assert_eq!(report.import.imported, 6);
    assert_eq!(report.import.skipped, 1);
    // s1/e10 on two days, s2/diesel on one, ghost dropped by the join.
    assert_eq!(report.buckets, 3);
    assert!(report.resumed_from.is_none());

    let daily = DailyPriceRepository::new(&store);
    let s1 = StationId::new("s1");

    let day1 = daily
        .find_bucket(&s1, Fuel::E10, day("2024-11-19"))
        .unwrap()
        .unwrap();
    assert_eq!(day1.station.name, "Station Nord");
    assert_eq!(day1.station.post_code, "20095");
    assert_eq!(day1.prices.len(), 2);
    assert_eq!(day1.opening_price, None);
    assert_eq!(day1.closing_price, Some(1.629));
    assert_eq!(day1.lowest_price.as_ref().unwrap().price, 1.569);
    assert_eq!(day1.highest_price.as_ref().unwrap().price, 1.629);
    assert_eq!(day1.prices[0].previous_price, None);
    assert_eq!(day1.prices[0].change, None);
    assert_eq!(day1.prices[1].previous_price, Some(1.569));
    assert!((day1.prices[1].change.unwrap() - 0.06).abs() < 1e-9);
    // Midnight to 03:07:29 then to 06:07:29 at 1.569, the rest at 1.629.
    assert_eq!(day1.weighted_average_price, Some(1.614));

    let day2 = daily
        .find_bucket(&s1, Fuel::E10, day("2024-11-20"))
        .unwrap()
        .unwrap();
    assert_eq!(day2.opening_price, Some(1.629));
    assert_eq!(day2.prices[0].previous_price, Some(1.629));
    assert!((day2.prices[0].change.unwrap() + 0.13).abs() < 1e-9);
    assert_eq!(day2.closing_price, Some(1.579));
    assert_eq!(day2.weighted_average_price, Some(1.567));

    // The first day keeps an explicit null opening after the backfill.
    let raw = store
        .find_one(
            DAILY_PRICES,
            &Filter::new()
                .eq("station.id", json!("s1"))
                .eq("fuel", json!("e10"))
                .eq("day", json!("2024-11-19")),
        )
        .unwrap()
        .unwrap();
    assert_eq!(raw["openingPrice"], serde_json::Value::Null);

    // Unknown stations never become buckets.
    let ghost = store
        .find(DAILY_PRICES, &Filter::new().eq("station.id", json!("ghost")))
        .unwrap();
    assert!(ghost.is_empty());

    // Statistics cover both fuels, fleet-wide and per post code.
    let stats = StatisticsRepository::new(&store);
    let e10 = stats
        .for_day_and_fuel(day("2024-11-19"), Fuel::E10)
        .unwrap()
        .unwrap();
    assert_eq!(e10.num_stations, 1);
    assert_eq!(e10.weighted_average_price, 1.614);
    assert!(stats
        .for_post_code(day("2024-11-19"), Fuel::Diesel, "80331")
        .unwrap()
        .is_some());
    let compound = stats.latest_compound().unwrap().unwrap();
    assert_eq!(compound.day, day("2024-11-20"));
    assert!(compound.for_fuel(Fuel::E10).is_some());
    assert!(compound.for_fuel(Fuel::Diesel).is_none());

    // The station cache is rebuilt from the merged buckets.
    let station = StationRepository::new(&store).find(&s1).unwrap().unwrap();
    let latest = station.latest_for(Fuel::E10).unwrap();
    assert_eq!(latest.day, day("2024-11-20"));
    assert_eq!(latest.closing_price, Some(1.579));
    assert_eq!(station.history_for(Fuel::E10).len(), 2);

    // No scratch collections survive a clean run.
    assert!(store.list_collections(PRICE_IMPORT_PREFIX).unwrap().is_empty());
    assert!(store.list_collections(AGGREGATED_PREFIX).unwrap().is_empty());
}

#[test]
fn merge_keeps_buckets_already_maintained_live() {
    let dir = TempDir::new().unwrap();
    let (store, csv_root) = fixture(dir.path());
    let config = EngineConfig::default();

    // A live report beats the batch to the same bucket.
    let daily = DailyPriceRepository::new(&store);
    let s1 = StationId::new("s1");
    daily
        .report_price(&s1, Fuel::E10, 1.111, "2024-11-19T02:00:00".parse().unwrap())
        .unwrap();

    ImportWorkflow::new(&store, &config)
        .run(&[csv_root], false)
        .unwrap();

    let bucket = daily
        .find_bucket(&s1, Fuel::E10, day("2024-11-19"))
        .unwrap()
        .unwrap();
    assert_eq!(bucket.prices.len(), 1);
    assert_eq!(bucket.closing_price, Some(1.111));

    // Days the live path has not seen still merge in.
    assert!(daily
        .find_bucket(&s1, Fuel::E10, day("2024-11-20"))
        .unwrap()
        .is_some());
}

#[test]
fn clear_wipes_live_data_before_importing() {
    let dir = TempDir::new().unwrap();
    let (store, csv_root) = fixture(dir.path());
    let config = EngineConfig::default();
    let daily = DailyPriceRepository::new(&store);
    let s1 = StationId::new("s1");
    daily
        .report_price(&s1, Fuel::Diesel, 1.999, "2024-10-01T12:00:00".parse().unwrap())
        .unwrap();

    ImportWorkflow::new(&store, &config)
        .run(&[csv_root], true)
        .unwrap();

    assert!(daily
        .find_bucket(&s1, Fuel::Diesel, day("2024-10-01"))
        .unwrap()
        .is_none());
    assert!(daily
        .find_bucket(&s1, Fuel::E10, day("2024-11-19"))
        .unwrap()
        .is_some());
}

#[test]
fn recovery_resumes_from_staged_reports() {
    let dir = TempDir::new().unwrap();
    let (store, _) = fixture(dir.path());
    let config = EngineConfig::default();

    // A crashed run left its staged rows behind.
    store
        .insert_many(
            &format!("{PRICE_IMPORT_PREFIX}deadbeef0000"),
            vec![json!({
                "recordId": "aaaaaaaaaaaa",
                "stationId": "s1",
                "fuel": "e10",
                "price": 1.489,
                "reportedAt": "2024-11-21T06:00:00",
            })],
        )
        .unwrap();

    let workflow = ImportWorkflow::new(&store, &config);
    let report = workflow.recover().unwrap().unwrap();
    assert_eq!(report.buckets, 1);
    assert_eq!(
        report.resumed_from.as_deref(),
        Some("priceReportImport_deadbeef0000")
    );

    let bucket = DailyPriceRepository::new(&store)
        .find_bucket(&StationId::new("s1"), Fuel::E10, day("2024-11-21"))
        .unwrap()
        .unwrap();
    assert_eq!(bucket.closing_price, Some(1.489));
    assert_eq!(bucket.weighted_average_price, Some(1.489));

    assert!(store.list_collections(PRICE_IMPORT_PREFIX).unwrap().is_empty());
    assert!(store.list_collections(AGGREGATED_PREFIX).unwrap().is_empty());
    assert!(workflow.recover().unwrap().is_none());
}

#[test]
fn recovery_resumes_from_grouped_buckets() {
    let dir = TempDir::new().unwrap();
    let (store, _) = fixture(dir.path());
    let config = EngineConfig::default();

    // A crash after grouping: staged rows dropped, buckets not merged.
    store
        .insert_many(
            &format!("{AGGREGATED_PREFIX}deadbeef0000"),
            vec![json!({
                "station": { "id": "s1", "name": "Station Nord", "brand": "NORD", "postCode": "20095" },
                "fuel": "e10",
                "day": "2024-11-21",
                "closingPrice": 1.481,
                "lowestPrice": { "recordId": "bbbbbbbbbbbb", "reportedAt": "2024-11-21T06:00:00", "price": 1.481 },
                "highestPrice": { "recordId": "bbbbbbbbbbbb", "reportedAt": "2024-11-21T06:00:00", "price": 1.481 },
                "prices": [
                    { "recordId": "bbbbbbbbbbbb", "reportedAt": "2024-11-21T06:00:00", "price": 1.481, "previousPrice": null },
                ],
            })],
        )
        .unwrap();

    let report = ImportWorkflow::new(&store, &config)
        .recover()
        .unwrap()
        .unwrap();
    assert_eq!(report.buckets, 1);

    let bucket = DailyPriceRepository::new(&store)
        .find_bucket(&StationId::new("s1"), Fuel::E10, day("2024-11-21"))
        .unwrap()
        .unwrap();
    assert_eq!(bucket.weighted_average_price, Some(1.481));
    assert!(store.list_collections(AGGREGATED_PREFIX).unwrap().is_empty());
}

#[test]
fn several_interrupted_runs_refuse_to_guess() {
    let dir = TempDir::new().unwrap();
    let (store, _) = fixture(dir.path());
    let config = EngineConfig::default();
    for token in ["aaaa", "bbbb"] {
        store
            .insert_one(
                &format!("{PRICE_IMPORT_PREFIX}{token}"),
                json!({ "stationId": "s1" }),
            )
            .unwrap();
    }

    let err = ImportWorkflow::new(&store, &config).recover().unwrap_err();
    match err {
        WorkflowError::AmbiguousRecovery { candidates, .. } => {
            assert_eq!(candidates.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn a_fresh_run_refuses_while_scratch_remains() {
    let dir = TempDir::new().unwrap();
    let (store, csv_root) = fixture(dir.path());
    let config = EngineConfig::default();
    store
        .insert_one(
            &format!("{AGGREGATED_PREFIX}cafecafe0000"),
            json!({ "fuel": "e10" }),
        )
        .unwrap();

    let err = ImportWorkflow::new(&store, &config)
        .run(&[csv_root], false)
        .unwrap_err();
    match err {
        WorkflowError::InterruptedRunExists { candidates } => {
            assert_eq!(candidates, vec![format!("{AGGREGATED_PREFIX}cafecafe0000")]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn a_run_without_paths_recomputes_from_the_stored_buckets() {
    let dir = TempDir::new().unwrap();
    let (store, csv_root) = fixture(dir.path());
    let config = EngineConfig::default();
    let workflow = ImportWorkflow::new(&store, &config);
    workflow.run(&[csv_root], false).unwrap();

    let stats = StatisticsRepository::new(&store);
    stats.delete_all().unwrap();

    let report = workflow.run(&[], false).unwrap();
    assert_eq!(report.import.files, 0);
    assert_eq!(report.import.rows, 0);
    assert_eq!(report.buckets, 0);
    assert!(stats.count().unwrap() > 0);
    assert!(store.list_collections(PRICE_IMPORT_PREFIX).unwrap().is_empty());
    assert!(store.list_collections(AGGREGATED_PREFIX).unwrap().is_empty());
}
