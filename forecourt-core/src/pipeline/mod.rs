//! Declarative aggregation pipelines.
//!
//! A pipeline is data: a list of [`Stage`] values describing transforms
//! over JSON documents, composed by the builders in [`builders`] and run
//! by [`exec`] against a [`DocumentStore`](crate::store::DocumentStore)
//! collection or a plain document list. Keeping the stages inert makes
//! every aggregate computation unit-testable without touching disk.

pub mod builders;
pub mod exec;
pub mod expr;
pub mod quantile;

pub use expr::Expr;
pub use quantile::QuantileSketch;

use crate::store::{Filter, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("expected {expected} in {context}")]
    TypeMismatch {
        expected: &'static str,
        context: &'static str,
    },

    #[error("unknown variable ${0}")]
    UnknownVariable(String),

    #[error("cannot parse {0:?} as a date")]
    BadDate(String),

    #[error("division by zero")]
    DivideByZero,

    #[error("stage produced a non-object document")]
    NotAnObject,

    #[error("{0} stage needs a store-backed pipeline")]
    RequiresStore(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// What to do with an incoming document that matches an existing one
/// during a [`Stage::Merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Overlay the incoming fields onto the existing document.
    Merge,
    /// Replace the existing document wholesale.
    Replace,
    /// Keep the existing document untouched.
    KeepExisting,
}

/// Per-group accumulator used by [`Stage::Group`].
#[derive(Debug, Clone)]
pub enum Accumulator {
    First(Expr),
    FirstN(Expr, usize),
    Last(Expr),
    Push(Expr),
    Min(Expr),
    Max(Expr),
    Avg(Expr),
    Sum(Expr),
    Count,
    /// Approximate percentile estimation over a numeric expression,
    /// emitted as an object keyed by the given labels.
    Percentiles {
        input: Expr,
        points: Vec<(String, f64)>,
    },
}

/// Document filter for a [`Stage::Match`].
#[derive(Debug, Clone)]
pub enum MatchCond {
    /// Plain field conditions, including missing-field tests.
    Query(Filter),
    /// An arbitrary expression evaluated per document.
    Cond(Expr),
}

/// One pipeline stage. Documents flow through stages in order; `Merge`
/// and `Out` are terminal and write to a named collection instead of
/// passing documents on.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(MatchCond),
    /// Evaluates every expression against the incoming document, then
    /// applies the results; an expression that comes up missing removes
    /// the field. Paths may be dotted.
    Set(Vec<(String, Expr)>),
    /// Keeps only the listed dot-paths.
    Project(Vec<String>),
    Unset(Vec<String>),
    ReplaceWith(Expr),
    Group {
        id: Expr,
        fields: Vec<(String, Accumulator)>,
    },
    Sort(Vec<(String, SortOrder)>),
    Limit(usize),
    /// Left outer join: for every incoming document, collect documents
    /// from `from` whose `foreign_field` equals `local_field`, run them
    /// through the sub-pipeline with `let_vars` bound, and store the
    /// result list under `as_field`.
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        let_vars: Vec<(String, Expr)>,
        pipeline: Vec<Stage>,
        as_field: String,
    },
    /// Windowed shift: partitions documents, orders each partition, and
    /// sets `target` on every document to `source` evaluated on the
    /// document `by` positions away (removing `target` at the edges).
    WindowShift {
        partition_by: Vec<String>,
        sort_by: Vec<(String, SortOrder)>,
        target: String,
        source: Expr,
        by: i64,
    },
    Merge {
        into: String,
        on: Vec<String>,
        when_matched: MergePolicy,
    },
    /// Replaces the contents of the named collection with the result set.
    Out(String),
}

/// An ordered list of stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Pipeline { stages }
    }

    /// Appends another stage list, for composing builder outputs.
    pub fn then(mut self, stages: Vec<Stage>) -> Self {
        self.stages.extend(stages);
        self
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }
}

impl From<Vec<Stage>> for Pipeline {
    fn from(stages: Vec<Stage>) -> Self {
        Pipeline::new(stages)
    }
}
