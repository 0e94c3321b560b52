//! Forecourt Jobs — batch ingestion and maintenance.
//!
//! - CSV importers for the price report and station master data feeds
//! - The staged import workflow with crash recovery
//! - Engine configuration

pub mod config;
pub mod import;
pub mod workflow;

pub use config::EngineConfig;
pub use import::{ImportError, ImportOutcome};
pub use workflow::{ImportWorkflow, WorkflowError, WorkflowReport};
