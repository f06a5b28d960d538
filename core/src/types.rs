//! Shared primitive types used across the entire simulation.

use serde::{Deserialize, Serialize};

/// A simulated trading year. Year 0 is the bootstrap year.
pub type Year = u32;

/// ISO-style country code as it appears in the assumption files.
pub type CountryId = String;

/// The canonical run identifier.
pub type RunId = String;

/// Dense arena index of an actor or geography inside one country.
pub type ActorIdx = u32;

/// Per-country sequence number of a relationship edge.
pub type EdgeId = u64;

/// The three relationship kinds tracked by the evolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    /// Farmer sells to middleman.
    F2M,
    /// Middleman sells to exporter.
    M2E,
    /// Middleman buys in a geography.
    M2G,
}

impl EdgeType {
    pub fn code(&self) -> &'static str {
        match self {
            Self::F2M => "F2M",
            Self::M2E => "M2E",
            Self::M2G => "M2G",
        }
    }
}

/// Actor kinds, used for audit rows and id formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Farmer,
    Middleman,
    Exporter,
}

impl ActorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Farmer => "farmer",
            Self::Middleman => "middleman",
            Self::Exporter => "exporter",
        }
    }
}
