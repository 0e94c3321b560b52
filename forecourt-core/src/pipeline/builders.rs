//! Builders for the engine's aggregation pipelines.
//!
//! Everything the engine computes is expressed here as pipeline data:
//! the day-bucket rollup over staged price reports, the merge-phase
//! enrichment (opening prices, per-entry changes, weighted averages),
//! the daily statistics rollups, the station price cache rebuild and
//! the single-bucket update pipelines used when one price report
//! arrives. The builders stay collection-agnostic; callers pass the
//! collection names they stage into and merge from.

use super::{Accumulator, Expr, MatchCond, MergePolicy, Pipeline, SortOrder, Stage};
use crate::store::Filter;
use serde_json::{json, Value};

pub const SECONDS_IN_DAY: i64 = 86_400;

/// Percentile points reported by the daily statistics rollup.
pub const PERCENTILE_POINTS: [(&str, f64); 4] =
    [("p50", 0.5), ("p90", 0.9), ("p95", 0.95), ("p99", 0.99)];

/// Paths identifying one day bucket; merges and upserts key on these.
pub fn bucket_key_paths() -> Vec<String> {
    vec!["station.id".into(), "fuel".into(), "day".into()]
}

// ─── Expression shorthands ───────────────────────────────────────────────────

fn field(path: &str) -> Expr {
    Expr::field(path)
}

fn var(name: &str) -> Expr {
    Expr::var(name)
}

fn lit(value: impl Into<Value>) -> Expr {
    Expr::Lit(value.into())
}

fn object(fields: Vec<(&str, Expr)>) -> Expr {
    Expr::Object(
        fields
            .into_iter()
            .map(|(name, expr)| (name.to_string(), expr))
            .collect(),
    )
}

fn array(items: Vec<Expr>) -> Expr {
    Expr::Array(items)
}

fn get_field(name: &str, input: Expr) -> Expr {
    Expr::GetField {
        field: name.to_string(),
        input: Box::new(input),
    }
}

fn cond(when: Expr, then: Expr, otherwise: Expr) -> Expr {
    Expr::Cond {
        cond: Box::new(when),
        then: Box::new(then),
        otherwise: Box::new(otherwise),
    }
}

fn if_null(primary: Expr, fallback: Expr) -> Expr {
    Expr::IfNull(Box::new(primary), Box::new(fallback))
}

fn eq(a: Expr, b: Expr) -> Expr {
    Expr::Eq(Box::new(a), Box::new(b))
}

fn ne(a: Expr, b: Expr) -> Expr {
    Expr::Ne(Box::new(a), Box::new(b))
}

fn lt(a: Expr, b: Expr) -> Expr {
    Expr::Lt(Box::new(a), Box::new(b))
}

fn gt(a: Expr, b: Expr) -> Expr {
    Expr::Gt(Box::new(a), Box::new(b))
}

fn subtract(a: Expr, b: Expr) -> Expr {
    Expr::Subtract(Box::new(a), Box::new(b))
}

fn divide(a: Expr, b: Expr) -> Expr {
    Expr::Divide(Box::new(a), Box::new(b))
}

fn first(input: Expr) -> Expr {
    Expr::First(Box::new(input))
}

fn last(input: Expr) -> Expr {
    Expr::Last(Box::new(input))
}

fn size(input: Expr) -> Expr {
    Expr::Size(Box::new(input))
}

fn slice(input: Expr, count: Expr) -> Expr {
    Expr::Slice {
        input: Box::new(input),
        count: Box::new(count),
    }
}

fn map_over(input: Expr, body: Expr) -> Expr {
    Expr::Map {
        input: Box::new(input),
        body: Box::new(body),
    }
}

fn sort_array(input: Expr, by: &str, order: SortOrder) -> Expr {
    Expr::SortArray {
        input: Box::new(input),
        by: by.to_string(),
        order,
    }
}

fn set(assignments: Vec<(&str, Expr)>) -> Stage {
    Stage::Set(
        assignments
            .into_iter()
            .map(|(path, expr)| (path.to_string(), expr))
            .collect(),
    )
}

// ─── Day bucket rollup ───────────────────────────────────────────────────────

/// Rolls staged price report rows up into one bucket per station, fuel
/// and day: entries sorted by report time, closing and extreme prices,
/// the station summary joined in, and per-entry previous prices.
pub fn day_bucket_pipeline(stations: &str) -> Pipeline {
    let mut pipeline = Pipeline::new(vec![
        set(vec![("day", Expr::DateTrunc(Box::new(field("reportedAt"))))]),
        group_reports_by_station_day_fuel(),
        reshape_grouped_reports(),
        add_extreme_values(),
    ]);
    pipeline = pipeline.then(lookup_station(stations));
    pipeline.push(add_previous_price_to_list());
    pipeline
}

fn group_reports_by_station_day_fuel() -> Stage {
    Stage::Group {
        id: object(vec![
            ("station", field("stationId")),
            ("day", field("day")),
            ("fuel", field("fuel")),
        ]),
        fields: vec![(
            "prices".to_string(),
            Accumulator::Push(object(vec![
                ("recordId", field("recordId")),
                ("reportedAt", field("reportedAt")),
                ("price", field("price")),
            ])),
        )],
    }
}

fn reshape_grouped_reports() -> Stage {
    Stage::ReplaceWith(object(vec![
        ("day", field("_id.day")),
        ("station", object(vec![("id", field("_id.station"))])),
        ("fuel", field("_id.fuel")),
        (
            "prices",
            sort_array(field("prices"), "reportedAt", SortOrder::Asc),
        ),
        (
            "pricesByPrice",
            sort_array(field("prices"), "price", SortOrder::Asc),
        ),
    ]))
}

fn add_extreme_values() -> Stage {
    set(vec![
        ("closingPrice", get_field("price", last(field("prices")))),
        ("lowestPrice", first(field("pricesByPrice"))),
        ("highestPrice", last(field("pricesByPrice"))),
        ("pricesByPrice", Expr::Remove),
    ])
}

/// Joins the owning station onto each bucket as a flat summary and
/// drops buckets whose station is unknown.
fn lookup_station(stations: &str) -> Vec<Stage> {
    vec![
        Stage::Lookup {
            from: stations.to_string(),
            local_field: "station.id".to_string(),
            foreign_field: "id".to_string(),
            let_vars: Vec::new(),
            pipeline: vec![
                set(vec![("postCode", field("address.postCode"))]),
                Stage::Project(vec![
                    "id".to_string(),
                    "name".to_string(),
                    "brand".to_string(),
                    "postCode".to_string(),
                ]),
            ],
            as_field: "station".to_string(),
        },
        set(vec![("station", first(field("station")))]),
        Stage::Match(MatchCond::Cond(ne(field("station"), lit(Value::Null)))),
    ]
}

fn add_previous_price_to_list() -> Stage {
    set(vec![(
        "prices",
        merge_objects_in_lists(vec![
            field("prices"),
            shifted_price_list(field("prices")),
        ]),
    )])
}

/// Zips the input lists pairwise, padding the shorter with nulls, and
/// merges each pair into one object.
fn merge_objects_in_lists(inputs: Vec<Expr>) -> Expr {
    map_over(
        Expr::Zip {
            inputs,
            longest: true,
        },
        Expr::MergeObjects(vec![var("this")]),
    )
}

fn exclude_last_element(input: Expr) -> Expr {
    slice(input.clone(), subtract(size(input), lit(1)))
}

fn previous_price_object(previous: Expr) -> Expr {
    object(vec![("previousPrice", previous)])
}

/// `[{previousPrice: null}, {previousPrice: prices[0].price}, ...]`,
/// one element short of the input so the zip pads the last entry.
fn shifted_price_list(prices: Expr) -> Expr {
    Expr::ConcatArrays(vec![
        array(vec![previous_price_object(lit(Value::Null))]),
        map_over(
            exclude_last_element(prices),
            previous_price_object(var("this.price")),
        ),
    ])
}

// ─── Merge-phase enrichment ──────────────────────────────────────────────────

/// Carries each bucket's closing price forward as the next day's
/// opening price, fills the gaps that leaves in the per-entry previous
/// prices, computes changes and the weighted average, then merges the
/// finished buckets into `into` without disturbing buckets that
/// already exist there.
pub fn price_data_pipeline(into: &str) -> Pipeline {
    let mut pipeline = Pipeline::new(vec![
        add_previous_closing_price(),
        add_missing_opening_price_to_list(),
        compute_change_in_price_list(),
    ]);
    pipeline = pipeline.then(weighted_average_stages());
    pipeline.push(Stage::Merge {
        into: into.to_string(),
        on: bucket_key_paths(),
        when_matched: MergePolicy::KeepExisting,
    });
    pipeline
}

fn add_previous_closing_price() -> Stage {
    Stage::WindowShift {
        partition_by: vec!["station.id".to_string(), "fuel".to_string()],
        sort_by: vec![("day".to_string(), SortOrder::Asc)],
        target: "openingPrice".to_string(),
        source: field("closingPrice"),
        by: -1,
    }
}

fn add_missing_opening_price_to_list() -> Stage {
    set(vec![(
        "prices",
        map_over(
            field("prices"),
            Expr::MergeObjects(vec![
                var("this"),
                previous_price_object(if_null(var("this.previousPrice"), field("openingPrice"))),
            ]),
        ),
    )])
}

fn compute_change_in_price_list() -> Stage {
    set(vec![(
        "prices",
        map_over(
            field("prices"),
            Expr::MergeObjects(vec![
                var("this"),
                object(vec![(
                    "change",
                    subtract(var("this.price"), var("this.previousPrice")),
                )]),
            ]),
        ),
    )])
}

/// The three stages computing a bucket's time-weighted average price.
///
/// A scratch list pairs every price with the moment the next report
/// superseded it; the first element runs from midnight at the opening
/// price (or the first reported price when no opening is known) and
/// the last runs until the following midnight. Each price weighted by
/// its validity in seconds, summed, divided by the length of a day and
/// rounded to three decimals.
pub fn weighted_average_stages() -> Vec<Stage> {
    let opening_or_first_price = if_null(
        field("openingPrice"),
        get_field("price", first(field("prices"))),
    );

    vec![
        set(vec![(
            "weightedAveragePrices",
            merge_objects_in_lists(vec![
                Expr::ConcatArrays(vec![
                    array(vec![object(vec![
                        ("reportedAt", field("day")),
                        ("price", opening_or_first_price),
                    ])]),
                    field("prices"),
                ]),
                Expr::ConcatArrays(vec![
                    map_over(
                        field("prices"),
                        object(vec![("validUntil", var("this.reportedAt"))]),
                    ),
                    array(vec![object(vec![(
                        "validUntil",
                        Expr::DateAddDays(Box::new(field("day")), 1),
                    )])]),
                ]),
            ]),
        )]),
        set(vec![(
            "weightedAveragePrices",
            map_over(
                field("weightedAveragePrices"),
                object(vec![
                    (
                        "seconds",
                        Expr::DateDiffSeconds {
                            start: Box::new(var("this.reportedAt")),
                            end: Box::new(var("this.validUntil")),
                        },
                    ),
                    ("price", var("this.price")),
                ]),
            ),
        )]),
        set(vec![
            (
                "weightedAveragePrice",
                Expr::Round(
                    Box::new(divide(
                        Expr::Reduce {
                            input: Box::new(field("weightedAveragePrices")),
                            initial: Box::new(lit(0)),
                            body: Box::new(Expr::Add(vec![
                                var("value"),
                                Expr::Multiply(vec![var("this.seconds"), var("this.price")]),
                            ])),
                        },
                        lit(SECONDS_IN_DAY),
                    )),
                    3,
                ),
            ),
            ("weightedAveragePrices", Expr::Remove),
        ]),
    ]
}

// ─── Single-report bucket updates ────────────────────────────────────────────

/// Update pipeline applied when one price report lands in its bucket:
/// seeds the list fields on a fresh document, appends the entry with
/// its previous price and change, maintains closing and extreme
/// prices, and recomputes the weighted average.
pub fn report_price_update(entry: &Value) -> Vec<Stage> {
    let entry = lit(entry.clone());
    let latest_price = get_field("price", last(field("prices")));

    let mut stages = vec![
        seed_empty_bucket(),
        set(vec![
            (
                "prices",
                Expr::ConcatArrays(vec![
                    field("prices"),
                    array(vec![Expr::MergeObjects(vec![
                        entry.clone(),
                        object(vec![
                            ("previousPrice", latest_price.clone()),
                            (
                                "change",
                                subtract(get_field("price", entry.clone()), latest_price),
                            ),
                        ]),
                    ])]),
                ]),
            ),
            ("closingPrice", get_field("price", entry.clone())),
            (
                "lowestPrice",
                conditionally_update_extreme(entry.clone(), "lowestPrice", lt),
            ),
            (
                "highestPrice",
                conditionally_update_extreme(entry, "highestPrice", gt),
            ),
        ]),
    ];
    stages.extend(weighted_average_stages());
    stages
}

/// Defaults the list fields so the update stages can assume they exist;
/// fields already on the document win.
fn seed_empty_bucket() -> Stage {
    Stage::ReplaceWith(Expr::MergeObjects(vec![
        object(vec![
            ("prices", lit(json!([]))),
            ("lowestPrice", lit(Value::Null)),
            ("highestPrice", lit(Value::Null)),
        ]),
        Expr::Root,
    ]))
}

fn conditionally_update_extreme(
    entry: Expr,
    extreme_field: &str,
    better: fn(Expr, Expr) -> Expr,
) -> Expr {
    cond(
        Expr::Or(vec![
            eq(field(extreme_field), lit(Value::Null)),
            better(
                get_field("price", entry.clone()),
                field(&format!("{extreme_field}.price")),
            ),
        ]),
        entry,
        field(extreme_field),
    )
}

/// Rebuilds the price list with the first entry's previous price and
/// change taken from `previous`.
fn rewrite_first_entry_against(previous: Expr) -> Expr {
    Expr::Let {
        vars: vec![
            ("firstPrice".to_string(), first(field("prices"))),
            (
                "remainingPrices".to_string(),
                slice(field("prices"), subtract(lit(1), size(field("prices")))),
            ),
        ],
        body: Box::new(Expr::ConcatArrays(vec![
            array(vec![Expr::MergeObjects(vec![
                var("firstPrice"),
                object(vec![
                    ("previousPrice", previous.clone()),
                    (
                        "change",
                        subtract(get_field("price", var("firstPrice")), previous),
                    ),
                ]),
            ])]),
            var("remainingPrices"),
        ])),
    }
}

/// Update pipeline run after a previous-day bucket turned up for a
/// freshly created bucket: rewrites the first entry against the
/// previous closing price, records the opening price and recomputes
/// the weighted average.
pub fn opening_price_update(previous_closing: f64) -> Vec<Stage> {
    let mut stages = vec![set(vec![
        ("prices", rewrite_first_entry_against(lit(previous_closing))),
        ("openingPrice", lit(previous_closing)),
    ])];
    stages.extend(weighted_average_stages());
    stages
}

/// Marks a bucket as having no earlier bucket to open from.
pub fn set_null_opening_price() -> Vec<Stage> {
    vec![set(vec![("openingPrice", lit(Value::Null))])]
}

/// Backfills opening prices for buckets imported before their previous
/// day existed: looks the latest earlier bucket up per station and
/// fuel and takes its closing price, or records an explicit null when
/// there is none. A found opening also rewrites the first price
/// entry's previous price and change and recomputes the weighted
/// average, the same repair the live path runs on a fresh bucket.
pub fn missing_opening_backfill_pipeline(buckets: &str) -> Pipeline {
    let mut stages = vec![
        Stage::Match(MatchCond::Query(Filter::new().missing("openingPrice"))),
        Stage::Lookup {
            from: buckets.to_string(),
            local_field: "station.id".to_string(),
            foreign_field: "station.id".to_string(),
            let_vars: vec![
                ("fuel".to_string(), field("fuel")),
                ("day".to_string(), field("day")),
            ],
            pipeline: vec![
                Stage::Match(MatchCond::Cond(Expr::And(vec![
                    eq(field("fuel"), var("fuel")),
                    lt(field("day"), var("day")),
                ]))),
                Stage::Sort(vec![("day".to_string(), SortOrder::Desc)]),
                Stage::Limit(1),
            ],
            as_field: "previousDay".to_string(),
        },
        set(vec![(
            "openingPrice",
            cond(
                gt(size(field("previousDay")), lit(0)),
                get_field("closingPrice", first(field("previousDay"))),
                lit(Value::Null),
            ),
        )]),
        set(vec![(
            "prices",
            cond(
                Expr::And(vec![
                    ne(field("openingPrice"), lit(Value::Null)),
                    gt(size(field("prices")), lit(0)),
                ]),
                rewrite_first_entry_against(field("openingPrice")),
                field("prices"),
            ),
        )]),
    ];
    stages.extend(weighted_average_stages());
    // The whole station summary rides along: the merge writes fields
    // wholesale, so projecting only the id would strip the bucket's
    // denormalized identity.
    stages.push(Stage::Project(vec![
        "station".to_string(),
        "fuel".to_string(),
        "day".to_string(),
        "openingPrice".to_string(),
        "prices".to_string(),
        "weightedAveragePrice".to_string(),
    ]));
    stages.push(Stage::Merge {
        into: buckets.to_string(),
        on: bucket_key_paths(),
        when_matched: MergePolicy::Merge,
    });
    Pipeline::new(stages)
}

// ─── Daily statistics ────────────────────────────────────────────────────────

/// Rolls buckets up into per-day, per-fuel statistics and replaces the
/// matching rows in `into`. With `per_post_code` the rollup fans out
/// by the station's post code instead and skips stations without one.
pub fn daily_statistics_pipeline(per_post_code: bool, into: &str) -> Pipeline {
    let mut id_fields = vec![("day", field("day")), ("fuel", field("fuel"))];
    let mut stages = Vec::new();
    if per_post_code {
        stages.push(Stage::Match(MatchCond::Cond(ne(
            field("station.postCode"),
            lit(Value::Null),
        ))));
        id_fields.push(("postCode", field("station.postCode")));
    }

    stages.push(Stage::Group {
        id: object(id_fields),
        fields: vec![
            (
                "numStations".to_string(),
                Accumulator::Count,
            ),
            (
                "numChanges".to_string(),
                Accumulator::Avg(size(field("prices"))),
            ),
            (
                "lowestPrice".to_string(),
                Accumulator::Min(field("lowestPrice.price")),
            ),
            (
                "highestPrice".to_string(),
                Accumulator::Max(field("highestPrice.price")),
            ),
            (
                "weightedAveragePrice".to_string(),
                Accumulator::Avg(field("weightedAveragePrice")),
            ),
            (
                "percentiles".to_string(),
                Accumulator::Percentiles {
                    input: field("weightedAveragePrice"),
                    points: PERCENTILE_POINTS
                        .iter()
                        .map(|&(label, q)| (label.to_string(), q))
                        .collect(),
                },
            ),
        ],
    });
    stages.push(Stage::ReplaceWith(Expr::MergeObjects(vec![
        field("_id"),
        Expr::Root,
    ])));
    stages.push(Stage::Unset(vec!["_id".to_string()]));
    stages.push(Stage::Merge {
        into: into.to_string(),
        on: vec!["day".into(), "fuel".into(), "postCode".into()],
        when_matched: MergePolicy::Replace,
    });
    Pipeline::new(stages)
}

/// Latest statistics across all fuels folded into one document:
/// `{day, diesel: {...}, e5: {...}, e10: {...}}`.
pub fn compound_latest_pipeline() -> Pipeline {
    Pipeline::new(vec![
        Stage::Match(MatchCond::Query(Filter::new().missing("postCode"))),
        Stage::Group {
            id: field("day"),
            fields: vec![(
                "fuels".to_string(),
                Accumulator::Push(object(vec![("k", field("fuel")), ("v", Expr::Root)])),
            )],
        },
        Stage::Sort(vec![("_id".to_string(), SortOrder::Desc)]),
        Stage::Limit(1),
        Stage::ReplaceWith(Expr::MergeObjects(vec![
            object(vec![("day", field("_id"))]),
            Expr::ArrayToObject(Box::new(field("fuels"))),
        ])),
    ])
}

// ─── Station price cache ─────────────────────────────────────────────────────

/// Rebuilds every station's latest-price cache from the buckets: per
/// station and fuel the newest bucket snapshot plus the `cap` newest
/// snapshots, keyed by fuel, merged onto the station documents.
pub fn latest_prices_per_station_pipeline(cap: usize, into: &str) -> Pipeline {
    Pipeline::new(vec![
        Stage::Sort(vec![
            ("fuel".to_string(), SortOrder::Asc),
            ("day".to_string(), SortOrder::Desc),
        ]),
        Stage::Group {
            id: object(vec![
                ("station", field("station.id")),
                ("fuel", field("fuel")),
            ]),
            fields: vec![
                (
                    "latestPrice".to_string(),
                    Accumulator::First(bucket_snapshot()),
                ),
                (
                    "latestPrices".to_string(),
                    Accumulator::FirstN(bucket_snapshot(), cap),
                ),
            ],
        },
        Stage::Group {
            id: field("_id.station"),
            fields: vec![
                (
                    "latestPrice".to_string(),
                    Accumulator::Push(object(vec![
                        ("k", field("_id.fuel")),
                        ("v", field("latestPrice")),
                    ])),
                ),
                (
                    "latestPrices".to_string(),
                    Accumulator::Push(object(vec![
                        ("k", field("_id.fuel")),
                        ("v", field("latestPrices")),
                    ])),
                ),
            ],
        },
        set(vec![
            ("latestPrice", Expr::ArrayToObject(Box::new(field("latestPrice")))),
            (
                "latestPrices",
                Expr::ArrayToObject(Box::new(field("latestPrices"))),
            ),
            ("id", field("_id")),
        ]),
        Stage::Unset(vec!["_id".to_string()]),
        Stage::Merge {
            into: into.to_string(),
            on: vec!["id".to_string()],
            when_matched: MergePolicy::Merge,
        },
    ])
}

/// The compact per-day view cached on stations; everything but the
/// entry list and the station summary.
fn bucket_snapshot() -> Expr {
    object(vec![
        ("fuel", field("fuel")),
        ("day", field("day")),
        ("openingPrice", field("openingPrice")),
        ("closingPrice", field("closingPrice")),
        ("lowestPrice", field("lowestPrice")),
        ("highestPrice", field("highestPrice")),
        ("weightedAveragePrice", field("weightedAveragePrice")),
    ])
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::exec::transform;
    use serde_json::json;

    fn weighted_average(doc: Value) -> Value {
        let out = transform(vec![doc], &weighted_average_stages()).unwrap();
        assert!(
            out[0].get("weightedAveragePrices").is_none(),
            "scratch list must not survive"
        );
        out[0]["weightedAveragePrice"].clone()
    }

    #[test]
    fn weighted_average_of_a_single_price_is_that_price() {
        let doc = json!({
            "day": "2024-11-19",
            "prices": [{ "reportedAt": "2024-11-19T03:07:29", "price": 1.234 }],
        });
        assert_eq!(weighted_average(doc), json!(1.234));
    }

    #[test]
    fn weighted_average_uses_the_opening_price_from_midnight() {
        let doc = json!({
            "day": "2024-11-19",
            "openingPrice": 1.236,
            "prices": [{ "reportedAt": "2024-11-19T12:00:00", "price": 1.234 }],
        });
        assert_eq!(weighted_average(doc), json!(1.235));
    }

    #[test]
    fn weighted_average_weights_each_price_by_its_validity() {
        let doc = json!({
            "day": "2024-11-19",
            "openingPrice": 1.230,
            "prices": [
                { "reportedAt": "2024-11-19T06:00:00", "price": 1.232 },
                { "reportedAt": "2024-11-19T12:00:00", "price": 1.234 },
                { "reportedAt": "2024-11-19T18:00:00", "price": 1.236 },
            ],
        });
        assert_eq!(weighted_average(doc), json!(1.233));
    }

    #[test]
    fn weighted_average_ignores_an_explicit_null_opening() {
        let doc = json!({
            "day": "2024-11-19",
            "openingPrice": null,
            "prices": [{ "reportedAt": "2024-11-19T09:00:00", "price": 1.234 }],
        });
        assert_eq!(weighted_average(doc), json!(1.234));
    }

    #[test]
    fn exclude_last_element_drops_exactly_one() {
        let docs = vec![json!({ "xs": [0, 1, 2, 3] })];
        let stages = [set(vec![("xs", exclude_last_element(field("xs")))])];
        let out = transform(docs, &stages).unwrap();
        assert_eq!(out[0]["xs"], json!([0, 1, 2]));
    }

    #[test]
    fn report_price_update_seeds_a_fresh_bucket() {
        let entry = json!({
            "recordId": "r1",
            "reportedAt": "2024-11-19T03:07:29",
            "price": 1.569,
        });
        let doc = json!({
            "station": { "id": "s1" },
            "fuel": "e10",
            "day": "2024-11-19",
        });
        let out = transform(vec![doc], &report_price_update(&entry)).unwrap();
        let bucket = &out[0];

        assert_eq!(bucket["closingPrice"], json!(1.569));
        assert_eq!(bucket["lowestPrice"]["price"], json!(1.569));
        assert_eq!(bucket["highestPrice"]["price"], json!(1.569));
        assert_eq!(bucket["prices"].as_array().unwrap().len(), 1);
        // No earlier entry, so no previous price and no change.
        assert!(bucket["prices"][0].get("previousPrice").is_none());
        assert!(bucket["prices"][0].get("change").is_none());
        assert_eq!(bucket["weightedAveragePrice"], json!(1.569));
    }

    #[test]
    fn report_price_update_tracks_extremes_and_changes() {
        let first = json!({ "recordId": "r1", "reportedAt": "2024-11-19T03:00:00", "price": 1.569 });
        let second = json!({ "recordId": "r2", "reportedAt": "2024-11-19T06:00:00", "price": 1.629 });
        let third = json!({ "recordId": "r3", "reportedAt": "2024-11-19T09:00:00", "price": 1.529 });

        let doc = json!({ "station": { "id": "s1" }, "fuel": "e10", "day": "2024-11-19" });
        let out = transform(vec![doc], &report_price_update(&first)).unwrap();
        let out = transform(out, &report_price_update(&second)).unwrap();
        let out = transform(out, &report_price_update(&third)).unwrap();
        let bucket = &out[0];

        assert_eq!(bucket["closingPrice"], json!(1.529));
        assert_eq!(bucket["lowestPrice"]["recordId"], json!("r3"));
        assert_eq!(bucket["highestPrice"]["recordId"], json!("r2"));
        let second_entry = &bucket["prices"][1];
        assert_eq!(second_entry["previousPrice"], json!(1.569));
        assert!((second_entry["change"].as_f64().unwrap() - 0.06).abs() < 1e-9);
    }

    #[test]
    fn opening_price_update_rewrites_the_first_entry() {
        let doc = json!({
            "station": { "id": "s1" },
            "fuel": "e10",
            "day": "2024-11-20",
            "openingPrice": null,
            "closingPrice": 1.529,
            "prices": [
                { "recordId": "r1", "reportedAt": "2024-11-20T04:00:00", "price": 1.529 },
            ],
        });
        let out = transform(vec![doc], &opening_price_update(1.569)).unwrap();
        let bucket = &out[0];

        assert_eq!(bucket["openingPrice"], json!(1.569));
        let entry = &bucket["prices"][0];
        assert_eq!(entry["previousPrice"], json!(1.569));
        assert!((entry["change"].as_f64().unwrap() + 0.04).abs() < 1e-9);
    }

    #[test]
    fn statistics_rollup_groups_by_day_and_fuel() {
        let bucket = |station: &str, fuel: &str, low: f64, high: f64, avg: f64| {
            json!({
                "day": "2024-11-19",
                "fuel": fuel,
                "station": { "id": station, "postCode": "20095" },
                "prices": [{}, {}],
                "lowestPrice": { "price": low },
                "highestPrice": { "price": high },
                "weightedAveragePrice": avg,
            })
        };
        let docs = vec![
            bucket("s1", "e5", 1.5, 1.7, 1.6),
            bucket("s2", "e5", 1.4, 1.8, 1.5),
            bucket("s1", "diesel", 1.2, 1.3, 1.25),
        ];

        // Everything except the final merge runs store-free.
        let pipeline = daily_statistics_pipeline(false, "unused");
        let stages = &pipeline.stages[..pipeline.stages.len() - 1];
        let mut rows = transform(docs, stages).unwrap();
        rows.sort_by(|a, b| a["fuel"].as_str().cmp(&b["fuel"].as_str()));

        assert_eq!(rows.len(), 2);
        let e5 = &rows[1];
        assert_eq!(e5["day"], json!("2024-11-19"));
        assert_eq!(e5["fuel"], json!("e5"));
        assert_eq!(e5["numStations"], json!(2u64));
        assert_eq!(e5["numChanges"], json!(2.0));
        assert_eq!(e5["lowestPrice"], json!(1.4));
        assert_eq!(e5["highestPrice"], json!(1.8));
        assert!((e5["weightedAveragePrice"].as_f64().unwrap() - 1.55).abs() < 1e-9);
        assert!(e5["percentiles"]["p50"].is_number());
        assert!(e5.get("_id").is_none());
    }

    #[test]
    fn per_post_code_rollup_skips_stations_without_one() {
        let docs = vec![
            json!({
                "day": "2024-11-19",
                "fuel": "e5",
                "station": { "id": "s1", "postCode": "20095" },
                "prices": [{}],
                "lowestPrice": { "price": 1.5 },
                "highestPrice": { "price": 1.7 },
                "weightedAveragePrice": 1.6,
            }),
            json!({
                "day": "2024-11-19",
                "fuel": "e5",
                "station": { "id": "s2" },
                "prices": [{}],
                "lowestPrice": { "price": 1.4 },
                "highestPrice": { "price": 1.8 },
                "weightedAveragePrice": 1.5,
            }),
        ];
        let pipeline = daily_statistics_pipeline(true, "unused");
        let stages = &pipeline.stages[..pipeline.stages.len() - 1];
        let rows = transform(docs, stages).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["postCode"], json!("20095"));
        assert_eq!(rows[0]["numStations"], json!(1u64));
    }

    #[test]
    fn compound_pipeline_folds_the_latest_day_by_fuel() {
        let row = |day: &str, fuel: &str, avg: f64| {
            json!({
                "day": day,
                "fuel": fuel,
                "numStations": 1u64,
                "numChanges": 1.0,
                "lowestPrice": avg,
                "highestPrice": avg,
                "weightedAveragePrice": avg,
                "percentiles": { "p50": avg, "p90": avg, "p95": avg, "p99": avg },
            })
        };
        let mut regional = row("2024-11-19", "e5", 9.9);
        regional["postCode"] = json!("20095");

        let docs = vec![
            row("2024-11-18", "e5", 1.5),
            row("2024-11-19", "e5", 1.6),
            row("2024-11-19", "diesel", 1.3),
            regional,
        ];
        let out = transform(docs, &compound_latest_pipeline().stages).unwrap();

        assert_eq!(out.len(), 1);
        let compound = &out[0];
        assert_eq!(compound["day"], json!("2024-11-19"));
        assert_eq!(compound["e5"]["weightedAveragePrice"], json!(1.6));
        assert_eq!(compound["diesel"]["weightedAveragePrice"], json!(1.3));
        assert!(compound.get("e10").is_none());
    }

    #[test]
    fn backfill_targets_only_buckets_without_an_opening() {
        let pipeline = missing_opening_backfill_pipeline("dailyPrices");
        let match_stage = &pipeline.stages[0];
        let docs = vec![
            json!({ "day": "2024-11-19", "openingPrice": null }),
            json!({ "day": "2024-11-20", "openingPrice": 1.5 }),
            json!({ "day": "2024-11-21" }),
        ];
        let out = transform(docs, std::slice::from_ref(match_stage)).unwrap();
        // Explicit null means "no previous day"; only the truly
        // missing field qualifies.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["day"], json!("2024-11-21"));
    }
}
