//! Forecourt Core — domain types, document store, aggregation pipelines,
//! repositories.
//!
//! This crate contains the heart of the price aggregation engine:
//! - Domain types (fuels, stations, price records, day buckets, statistics)
//! - An embedded JSON document store with per-collection locking
//! - A declarative aggregation pipeline language and its executor
//! - The pipeline builders encoding the pricing semantics (day buckets,
//!   opening/closing chain, time-weighted daily averages, percentiles)
//! - Repositories tying pipelines to collections

pub mod domain;
pub mod pipeline;
pub mod repo;
pub mod store;
