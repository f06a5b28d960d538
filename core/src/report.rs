//! End-of-run report: one outcome and one set of counters per country.

use crate::types::{CountryId, RunId, Year};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CountryOutcome {
    Succeeded,
    Failed { reason: String },
    Cancelled,
}

impl CountryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Counters accumulated over every year a country simulated, replayed
/// years included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountryCounters {
    pub farmers:             u64,
    pub middlemen:           u64,
    pub exporters:           u64,
    pub edges_formed:        u64,
    pub edges_terminated:    u64,
    pub flows:               u64,
    pub total_volume_kg:     f64,
    pub eu_volume_kg:        f64,
    pub coverage_shortfalls: u64,
    pub under_connected:     u64,
}

impl CountryCounters {
    pub fn eu_share(&self) -> f64 {
        if self.total_volume_kg > 0.0 {
            self.eu_volume_kg / self.total_volume_kg
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryReport {
    pub country_id:    CountryId,
    pub outcome:       CountryOutcome,
    pub counters:      CountryCounters,
    /// Partitions written by this run; replayed years are not listed.
    pub years_written:  Vec<Year>,
    pub years_replayed: Vec<Year>,
}

impl CountryReport {
    pub fn new(country_id: &str) -> Self {
        Self {
            country_id:     country_id.to_string(),
            outcome:        CountryOutcome::Succeeded,
            counters:       CountryCounters::default(),
            years_written:  Vec::new(),
            years_replayed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id:     RunId,
    pub seed:       u64,
    pub year_count: u32,
    pub countries:  BTreeMap<CountryId, CountryReport>,
}

impl RunReport {
    pub fn country(&self, country_id: &str) -> Option<&CountryReport> {
        self.countries.get(country_id)
    }

    pub fn succeeded(&self) -> usize {
        self.countries.values().filter(|c| c.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.countries
            .values()
            .filter(|c| matches!(c.outcome, CountryOutcome::Failed { .. }))
            .count()
    }

    /// Counters summed over every country.
    pub fn totals(&self) -> CountryCounters {
        let mut t = CountryCounters::default();
        for c in self.countries.values().map(|c| &c.counters) {
            t.farmers += c.farmers;
            t.middlemen += c.middlemen;
            t.exporters += c.exporters;
            t.edges_formed += c.edges_formed;
            t.edges_terminated += c.edges_terminated;
            t.flows += c.flows;
            t.total_volume_kg += c.total_volume_kg;
            t.eu_volume_kg += c.eu_volume_kg;
            t.coverage_shortfalls += c.coverage_shortfalls;
            t.under_connected += c.under_connected;
        }
        t
    }
}
