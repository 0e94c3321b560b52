//! Fuel grades tracked by the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fuel grade of a price report.
///
/// Serialized with the short lowercase names used by the report feeds
/// (`diesel`, `e5`, `e10`), which also serve as per-fuel document keys and
/// CSV column prefixes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Fuel {
    Diesel,
    E5,
    E10,
}

impl Fuel {
    pub const ALL: [Fuel; 3] = [Fuel::Diesel, Fuel::E5, Fuel::E10];

    /// Lowercase key used in documents and CSV column names.
    pub fn key(self) -> &'static str {
        match self {
            Fuel::Diesel => "diesel",
            Fuel::E5 => "e5",
            Fuel::E10 => "e10",
        }
    }

    /// Human-facing label.
    pub fn display_name(self) -> &'static str {
        match self {
            Fuel::Diesel => "Diesel",
            Fuel::E5 => "E5",
            Fuel::E10 => "E10",
        }
    }
}

impl fmt::Display for Fuel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Error for fuel names that are not part of the closed set.
#[derive(Debug, thiserror::Error)]
#[error("unknown fuel {0:?} (expected diesel, e5 or e10)")]
pub struct UnknownFuel(String);

impl FromStr for Fuel {
    type Err = UnknownFuel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "diesel" => Ok(Fuel::Diesel),
            "e5" => Ok(Fuel::E5),
            "e10" => Ok(Fuel::E10),
            _ => Err(UnknownFuel(s.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
