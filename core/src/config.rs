use crate::{
    error::{SimError, SimResult},
    types::CountryId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

// ── Run-level configuration ────────────────────────────────────────

/// Distribution exporters draw their eu_preference from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EuPreferenceDistribution {
    Uniform { low: f64, high: f64 },
    Beta { alpha: f64, beta: f64 },
}

impl Default for EuPreferenceDistribution {
    fn default() -> Self {
        Self::Uniform { low: 0.0, high: 1.0 }
    }
}

impl EuPreferenceDistribution {
    fn validate(&self) -> SimResult<()> {
        match *self {
            Self::Uniform { low, high } => {
                if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
                    return Err(SimError::RandomSource(format!(
                        "eu_preference uniform bounds must satisfy 0 <= low <= high <= 1, got [{low}, {high}]"
                    )));
                }
            }
            Self::Beta { alpha, beta } => {
                if !(alpha > 0.0 && alpha.is_finite() && beta > 0.0 && beta.is_finite()) {
                    return Err(SimError::RandomSource(format!(
                        "eu_preference beta parameters must be positive, got alpha={alpha} beta={beta}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Production-percentile cut-offs for the number of plots a farmer works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotThresholds {
    pub low_percentile: f64,
    pub low_plots: u8,
    pub high_percentile: f64,
    pub high_plots: u8,
}

impl Default for PlotThresholds {
    fn default() -> Self {
        Self {
            low_percentile: 0.2,
            low_plots: 1,
            high_percentile: 0.8,
            high_plots: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Sigma of the per-farmer log-normal production draw.
    pub production_sigma: f64,
    pub plot_thresholds: PlotThresholds,
    pub min_middlemen_per_area: usize,
    pub min_middlemen_per_geography: usize,
    /// Continuation bonus per year an edge has been active.
    pub continuation_step: f64,
    /// Ceiling on the accumulated continuation bonus.
    pub continuation_cap: f64,
    /// Relative tolerance for per-farmer volume conservation.
    pub conservation_tolerance: f64,
    pub eu_preference: EuPreferenceDistribution,
    /// Country workers running at once. 0 means one per available core.
    pub worker_threads: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            production_sigma: 0.5,
            plot_thresholds: PlotThresholds::default(),
            min_middlemen_per_area: 4,
            min_middlemen_per_geography: 2,
            continuation_step: 0.1,
            continuation_cap: 0.3,
            conservation_tolerance: 1e-6,
            eu_preference: EuPreferenceDistribution::default(),
            worker_threads: 0,
        }
    }
}

impl SimConfig {
    /// Load `sim_config.json` from the data directory, falling back to defaults
    /// when the file is absent. Missing keys take their default value.
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/sim_config.json");
        if !Path::new(&path).exists() {
            log::info!("{path} not found, using default simulation config");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: SimConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Small, fast configuration for tests.
    pub fn default_test() -> Self {
        Self {
            worker_threads: 2,
            ..Self::default()
        }
    }

    /// Run-wide checks. A bad random-source setting would make every
    /// country irreproducible, so it aborts the run before any work starts.
    pub fn validate(&self) -> SimResult<()> {
        self.eu_preference.validate()?;
        if !(self.production_sigma >= 0.0 && self.production_sigma.is_finite()) {
            return Err(SimError::RandomSource(format!(
                "production_sigma must be a finite non-negative number, got {}",
                self.production_sigma
            )));
        }
        let t = &self.plot_thresholds;
        if !(0.0 <= t.low_percentile && t.low_percentile < t.high_percentile && t.high_percentile <= 1.0)
            || t.low_plots > t.high_plots
        {
            return Err(SimError::InvalidRun(format!("invalid plot thresholds: {t:?}")));
        }
        if !(self.conservation_tolerance > 0.0) {
            return Err(SimError::InvalidRun(format!(
                "conservation_tolerance must be positive, got {}",
                self.conservation_tolerance
            )));
        }
        if self.continuation_step < 0.0 || self.continuation_cap < 0.0 {
            return Err(SimError::InvalidRun(
                "continuation step and cap must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

// ── Country and geography input records ───────────────────────────

/// Per-country assumption record, one entry of `countries.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryAssumptions {
    pub country_id: CountryId,
    pub n_middlemen: u32,
    pub n_exporters: u32,
    pub eu_target_kg: f64,
    pub loyalty_base: f64,
    pub switch_rate: f64,
    #[serde(default = "default_geography_change_rate")]
    pub geography_change_rate: f64,
    pub max_buyers_per_farmer: u32,
    pub max_exporters_per_middleman: u32,
}

fn default_geography_change_rate() -> f64 {
    0.10
}

impl CountryAssumptions {
    pub fn validate(&self) -> SimResult<()> {
        let id = self.country_id.as_str();
        if id.trim().is_empty() {
            return Err(SimError::data_integrity(id, "country_id is empty"));
        }
        if self.n_middlemen == 0 {
            return Err(SimError::data_integrity(id, "n_middlemen must be at least 1"));
        }
        if self.n_exporters == 0 {
            return Err(SimError::data_integrity(id, "n_exporters must be at least 1"));
        }
        if self.max_buyers_per_farmer == 0 || self.max_exporters_per_middleman == 0 {
            return Err(SimError::data_integrity(id, "fan-out caps must be at least 1"));
        }
        if !(self.eu_target_kg >= 0.0 && self.eu_target_kg.is_finite()) {
            return Err(SimError::data_integrity(
                id,
                format!("eu_target_kg must be finite and non-negative, got {}", self.eu_target_kg),
            ));
        }
        for (name, value) in [
            ("loyalty_base", self.loyalty_base),
            ("switch_rate", self.switch_rate),
            ("geography_change_rate", self.geography_change_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SimError::data_integrity(
                    id,
                    format!("{name} must lie in [0, 1], got {value}"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryCrop {
    Arabica,
    Robusta,
    Mixed,
}

impl PrimaryCrop {
    /// Classify by arabica share of total production.
    pub fn from_production(arabica_kg: f64, robusta_kg: f64) -> Self {
        let total = arabica_kg + robusta_kg;
        let arabica_ratio = if total > 0.0 { arabica_kg / total } else { 0.0 };
        if arabica_ratio >= 0.8 {
            Self::Arabica
        } else if arabica_ratio <= 0.2 {
            Self::Robusta
        } else {
            Self::Mixed
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Arabica => "arabica",
            Self::Robusta => "robusta",
            Self::Mixed => "mixed",
        }
    }
}

/// One row of `geographies.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeographyRecord {
    pub geo_id: String,
    pub country_id: CountryId,
    pub region_id: String,
    pub est_farmers: f64,
    pub production_arabica_kg: f64,
    pub production_robusta_kg: f64,
    #[serde(default)]
    pub primary_crop: Option<PrimaryCrop>,
    #[serde(default)]
    pub centroid_lat: Option<f64>,
    #[serde(default)]
    pub centroid_lon: Option<f64>,
}

impl GeographyRecord {
    pub fn total_production_kg(&self) -> f64 {
        self.production_arabica_kg + self.production_robusta_kg
    }

    pub fn validate(&self) -> SimResult<()> {
        let id = self.country_id.as_str();
        if self.geo_id.trim().is_empty() {
            return Err(SimError::data_integrity(id, "geography with empty geo_id"));
        }
        if self.region_id.trim().is_empty() {
            return Err(SimError::data_integrity(
                id,
                format!("geography {} has no region_id", self.geo_id),
            ));
        }
        for (name, value) in [
            ("est_farmers", self.est_farmers),
            ("production_arabica_kg", self.production_arabica_kg),
            ("production_robusta_kg", self.production_robusta_kg),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(SimError::data_integrity(
                    id,
                    format!("geography {} has invalid {name}: {value}", self.geo_id),
                ));
            }
        }
        Ok(())
    }
}

// ── Assumption set ────────────────────────────────────────────────

/// Everything the engine reads about its countries, validated per country.
/// Read-only once loaded; shared by all country workers.
#[derive(Debug, Clone, Default)]
pub struct AssumptionSet {
    countries: BTreeMap<CountryId, CountryAssumptions>,
    geographies: BTreeMap<CountryId, Vec<GeographyRecord>>,
    /// Records that failed to parse, keyed by the country they belong to.
    rejected: BTreeMap<CountryId, Vec<String>>,
}

/// Validated inputs for a single country.
#[derive(Debug, Clone)]
pub struct CountryInputs {
    pub assumptions: CountryAssumptions,
    pub geographies: Vec<GeographyRecord>,
}

impl AssumptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `countries.json` and `geographies.csv` from the data directory.
    /// Malformed rows are kept aside and surface as a DataIntegrity error
    /// for their country only.
    pub fn load(data_dir: &str) -> SimResult<Self> {
        let mut set = Self::new();

        let countries_path = format!("{data_dir}/countries.json");
        let content = std::fs::read_to_string(&countries_path)?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&content)?;
        for row in rows {
            let country = row
                .get("country_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            match (country, serde_json::from_value::<CountryAssumptions>(row)) {
                (_, Ok(record)) => set.insert_country(record),
                (Some(country), Err(e)) => set.reject(&country, format!("country record: {e}")),
                (None, Err(e)) => log::warn!("{countries_path}: skipping record without country_id: {e}"),
            }
        }

        let geo_path = format!("{data_dir}/geographies.csv");
        let mut reader = csv::Reader::from_path(&geo_path)?;
        let headers = reader.headers()?.clone();
        let country_col = headers.iter().position(|h| h == "country_id");
        for (line, result) in reader.records().enumerate() {
            let record = result?;
            let country = country_col.and_then(|i| record.get(i)).map(str::to_string);
            match (country, record.deserialize::<GeographyRecord>(Some(&headers))) {
                (_, Ok(geo)) => set.insert_geography(geo),
                (Some(country), Err(e)) => {
                    set.reject(&country, format!("geography row {}: {e}", line + 2))
                }
                (None, Err(e)) => log::warn!("{geo_path}: skipping row {} without country_id: {e}", line + 2),
            }
        }

        log::info!(
            "loaded assumptions for {} countries, {} geographies",
            set.countries.len(),
            set.geographies.values().map(Vec::len).sum::<usize>()
        );
        Ok(set)
    }

    pub fn insert_country(&mut self, record: CountryAssumptions) {
        self.countries.insert(record.country_id.clone(), record);
    }

    pub fn insert_geography(&mut self, record: GeographyRecord) {
        self.geographies
            .entry(record.country_id.clone())
            .or_default()
            .push(record);
    }

    fn reject(&mut self, country: &str, reason: String) {
        self.rejected.entry(country.to_string()).or_default().push(reason);
    }

    pub fn country_ids(&self) -> Vec<CountryId> {
        self.countries.keys().cloned().collect()
    }

    /// Validated inputs for one country, or the DataIntegrity error that
    /// keeps it from running.
    pub fn country_inputs(&self, country_id: &str) -> SimResult<CountryInputs> {
        if let Some(reasons) = self.rejected.get(country_id) {
            return Err(SimError::data_integrity(country_id, reasons.join("; ")));
        }
        let assumptions = self
            .countries
            .get(country_id)
            .cloned()
            .ok_or_else(|| SimError::data_integrity(country_id, "no assumption record"))?;
        assumptions.validate()?;

        let geographies = self.geographies.get(country_id).cloned().unwrap_or_default();
        if geographies.is_empty() {
            return Err(SimError::data_integrity(country_id, "no geography records"));
        }
        let mut seen = BTreeSet::new();
        for geo in &geographies {
            geo.validate()?;
            if !seen.insert(geo.geo_id.as_str()) {
                return Err(SimError::data_integrity(
                    country_id,
                    format!("duplicate geo_id {}", geo.geo_id),
                ));
            }
        }
        Ok(CountryInputs {
            assumptions,
            geographies,
        })
    }
}
