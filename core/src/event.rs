//! Run events, persisted to the `event_log` table.
//!
//! Events are an audit trail only. Nothing in the simulation reads them
//! back, so they never influence outputs.

use crate::{
    error::SimResult,
    geography::CoverageShortfall,
    types::{CountryId, RunId, Year},
};
use serde::{Deserialize, Serialize};

/// Every event emitted during a run.
/// Variants may be added, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEvent {
    // ── Engine events ──────────────────────────────
    RunStarted {
        run_id:     RunId,
        seed:       u64,
        year_count: u32,
        countries:  usize,
    },

    // ── Country lifecycle ──────────────────────────
    CountryStarted {
        country_id: CountryId,
        farmers:    u64,
        middlemen:  u32,
        exporters:  u32,
    },
    CountryCompleted {
        country_id:    CountryId,
        years_written: u32,
    },
    CountryFailed {
        country_id: CountryId,
        reason:     String,
    },
    CountryCancelled {
        country_id:     CountryId,
        last_full_year: Option<Year>,
    },

    // ── Year events ────────────────────────────────
    CoverageShortfall {
        country_id: CountryId,
        year:       Year,
        shortfall:  CoverageShortfall,
    },
    YearWritten {
        country_id:      CountryId,
        year:            Year,
        flows:           u64,
        edges:           u64,
        total_volume_kg: f64,
        eu_share:        f64,
    },
    /// A completed partition was found and replayed without rewriting.
    YearReplayed {
        country_id: CountryId,
        year:       Year,
    },
}

impl SimEvent {
    /// Stable name used for the `event_type` column.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::CountryStarted { .. } => "country_started",
            Self::CountryCompleted { .. } => "country_completed",
            Self::CountryFailed { .. } => "country_failed",
            Self::CountryCancelled { .. } => "country_cancelled",
            Self::CoverageShortfall { .. } => "coverage_shortfall",
            Self::YearWritten { .. } => "year_written",
            Self::YearReplayed { .. } => "year_replayed",
        }
    }

    pub fn country_id(&self) -> Option<&str> {
        match self {
            Self::RunStarted { .. } => None,
            Self::CountryStarted { country_id, .. }
            | Self::CountryCompleted { country_id, .. }
            | Self::CountryFailed { country_id, .. }
            | Self::CountryCancelled { country_id, .. }
            | Self::CoverageShortfall { country_id, .. }
            | Self::YearWritten { country_id, .. }
            | Self::YearReplayed { country_id, .. } => Some(country_id.as_str()),
        }
    }

    pub fn year(&self) -> Option<Year> {
        match self {
            Self::CoverageShortfall { year, .. }
            | Self::YearWritten { year, .. }
            | Self::YearReplayed { year, .. } => Some(*year),
            _ => None,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub country_id: Option<CountryId>,
    pub year:       Option<Year>,
    pub component:  String,
    pub event_type: String,
    pub payload:    String, // JSON-serialized SimEvent
}

impl EventLogEntry {
    pub fn new(run_id: &str, component: &str, event: &SimEvent) -> SimResult<Self> {
        Ok(Self {
            id:         None,
            run_id:     run_id.to_string(),
            country_id: event.country_id().map(str::to_string),
            year:       event.year(),
            component:  component.to_string(),
            event_type: event.event_type().to_string(),
            payload:    serde_json::to_string(event)?,
        })
    }

    pub fn event(&self) -> SimResult<SimEvent> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}
