//! CSV ingestion for the two market transparency feeds: price reports
//! and station master data.

pub mod price_reports;
pub mod stations;

use forecourt_core::repo::RepoError;
use forecourt_core::store::StoreError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the import layer.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("cannot read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse CSV file {path:?}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("CSV file {path:?} is missing column {column:?}")]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error("cannot encode staged row")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Counters from one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// CSV files read.
    pub files: usize,
    /// CSV rows seen.
    pub rows: usize,
    /// Documents staged or upserted.
    pub imported: usize,
    /// Rows or row cells dropped as junk.
    pub skipped: usize,
}

impl ImportOutcome {
    pub fn absorb(&mut self, other: ImportOutcome) {
        self.files += other.files;
        self.rows += other.rows;
        self.imported += other.imported;
        self.skipped += other.skipped;
    }
}
