//! Actor generation: farmers, middlemen and exporters for one country.
//!
//! Traits are drawn exactly once here and never touched again.
//! Actors live in dense arenas indexed by `ActorIdx`; string ids are
//! derived from the index when rows are written out.

use crate::{
    config::{CountryAssumptions, CountryInputs, EuPreferenceDistribution, PrimaryCrop, SimConfig},
    error::{SimError, SimResult},
    rng::SubsystemRng,
    types::{ActorIdx, CountryId},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geography {
    pub geo_id:        String,
    pub area:          ActorIdx,
    pub num_farmers:   u32,
    pub production_kg: f64,
    pub primary_crop:  PrimaryCrop,
    pub centroid_lat:  Option<f64>,
    pub centroid_lon:  Option<f64>,
}

/// A producing area: the group of geographies sharing a region id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducingArea {
    pub region_id:   String,
    pub geographies: Vec<ActorIdx>,
    pub num_farmers: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Farmer {
    pub geography:     ActorIdx,
    /// Position of the farmer inside its geography, used for its id.
    pub ordinal:       u32,
    pub production_kg: f64,
    pub loyalty:       f64,
    pub num_plots:     u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Middleman {
    pub competitiveness: f64,
    pub loyalty:         f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Exporter {
    pub competitiveness: f64,
    pub eu_preference:   f64,
    pub loyalty:         f64,
}

/// All actors of one country. Immutable after generation.
#[derive(Debug, Clone)]
pub struct CountryActors {
    pub country_id:  CountryId,
    pub assumptions: CountryAssumptions,
    pub areas:       Vec<ProducingArea>,
    pub geographies: Vec<Geography>,
    pub farmers:     Vec<Farmer>,
    pub middlemen:   Vec<Middleman>,
    pub exporters:   Vec<Exporter>,
    /// Farmers are stored contiguously per geography.
    farmer_ranges:   Vec<Range<u32>>,
    total_production_kg: f64,
}

impl CountryActors {
    pub fn farmer_id(&self, idx: ActorIdx) -> String {
        let f = &self.farmers[idx as usize];
        format!("{}_F{:06}", self.geographies[f.geography as usize].geo_id, f.ordinal)
    }

    pub fn middleman_id(&self, idx: ActorIdx) -> String {
        format!("{}_M{:06}", self.country_id, idx)
    }

    pub fn exporter_id(&self, idx: ActorIdx) -> String {
        format!("{}_E{:06}", self.country_id, idx)
    }

    pub fn geography_id(&self, idx: ActorIdx) -> &str {
        &self.geographies[idx as usize].geo_id
    }

    pub fn farmers_in(&self, geography: ActorIdx) -> Range<u32> {
        self.farmer_ranges[geography as usize].clone()
    }

    /// Sum of all farmer production; equals the sum of producing geographies.
    pub fn total_production_kg(&self) -> f64 {
        self.total_production_kg
    }

    pub fn total_farmers(&self) -> u64 {
        self.farmers.len() as u64
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub struct ActorFactory<'a> {
    config: &'a SimConfig,
}

impl<'a> ActorFactory<'a> {
    pub fn new(config: &'a SimConfig) -> Self {
        Self { config }
    }

    pub fn generate(&self, inputs: &CountryInputs, rng: &mut SubsystemRng) -> SimResult<CountryActors> {
        let assumptions = &inputs.assumptions;
        let country_id = assumptions.country_id.clone();

        let mut area_index: BTreeMap<&str, ActorIdx> = BTreeMap::new();
        let mut areas: Vec<ProducingArea> = Vec::new();
        let mut geographies = Vec::new();
        let mut farmers = Vec::new();
        let mut farmer_ranges = Vec::new();

        for record in &inputs.geographies {
            let production_kg = record.total_production_kg();
            let num_farmers = record.est_farmers.round();
            if num_farmers < 1.0 || production_kg < 1.0 {
                log::debug!(
                    "country={country_id} actors: skipping non-producing geography {}",
                    record.geo_id
                );
                continue;
            }
            if num_farmers > u32::MAX as f64 {
                return Err(SimError::data_integrity(
                    &country_id,
                    format!("geography {} farmer estimate {num_farmers} is out of range", record.geo_id),
                ));
            }
            let num_farmers = num_farmers as u32;

            let area = *area_index.entry(record.region_id.as_str()).or_insert_with(|| {
                areas.push(ProducingArea {
                    region_id:   record.region_id.clone(),
                    geographies: Vec::new(),
                    num_farmers: 0,
                });
                (areas.len() - 1) as ActorIdx
            });
            let geo_idx = geographies.len() as ActorIdx;
            areas[area as usize].geographies.push(geo_idx);
            areas[area as usize].num_farmers += num_farmers as u64;

            geographies.push(Geography {
                geo_id: record.geo_id.clone(),
                area,
                num_farmers,
                production_kg,
                primary_crop: record.primary_crop.unwrap_or_else(|| {
                    PrimaryCrop::from_production(record.production_arabica_kg, record.production_robusta_kg)
                }),
                centroid_lat: record.centroid_lat,
                centroid_lon: record.centroid_lon,
            });

            let start = farmers.len() as u32;
            farmers.extend(self.farmers_for_geography(geo_idx, num_farmers, production_kg, rng)?);
            farmer_ranges.push(start..farmers.len() as u32);
        }

        if geographies.is_empty() {
            return Err(SimError::data_integrity(&country_id, "no producing geographies"));
        }

        let middlemen = (0..assumptions.n_middlemen)
            .map(|_| Middleman {
                competitiveness: rng.next_f64(),
                loyalty:         rng.next_f64(),
            })
            .collect::<Vec<_>>();

        let mut exporters = Vec::with_capacity(assumptions.n_exporters as usize);
        for _ in 0..assumptions.n_exporters {
            let competitiveness = rng.next_f64();
            let eu_preference = self.draw_eu_preference(rng)?;
            exporters.push(Exporter {
                competitiveness,
                eu_preference,
                loyalty: rng.next_f64(),
            });
        }

        let total_production_kg = geographies.iter().map(|g| g.production_kg).sum();

        log::info!(
            "country={country_id} actors: {} geographies in {} areas, {} farmers, {} middlemen, {} exporters",
            geographies.len(),
            areas.len(),
            farmers.len(),
            middlemen.len(),
            exporters.len()
        );

        Ok(CountryActors {
            country_id,
            assumptions: assumptions.clone(),
            areas,
            geographies,
            farmers,
            middlemen,
            exporters,
            farmer_ranges,
            total_production_kg,
        })
    }

    /// Log-normal production around the geography mean, rescaled by one
    /// factor so the farmers' total matches the geography exactly.
    fn farmers_for_geography(
        &self,
        geography: ActorIdx,
        num_farmers: u32,
        production_kg: f64,
        rng: &mut SubsystemRng,
    ) -> SimResult<Vec<Farmer>> {
        let n = num_farmers as usize;
        let mu = (production_kg / num_farmers as f64).ln();
        let mut production = Vec::with_capacity(n);
        for _ in 0..n {
            production.push(rng.lognormal(mu, self.config.production_sigma)?);
        }
        let drawn: f64 = production.iter().sum();
        let factor = production_kg / drawn;
        for p in &mut production {
            *p *= factor;
        }

        // Rank by production to place each farmer on the plot scale.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|a, b| production[*a].total_cmp(&production[*b]));
        let mut percentile = vec![0.0; n];
        for (rank, idx) in order.into_iter().enumerate() {
            percentile[idx] = rank as f64 / n as f64;
        }

        let farmers = (0..n)
            .map(|i| Farmer {
                geography,
                ordinal: i as u32,
                production_kg: production[i],
                loyalty: rng.next_f64(),
                num_plots: self.num_plots(percentile[i], rng),
            })
            .collect();
        Ok(farmers)
    }

    fn num_plots(&self, percentile: f64, rng: &mut SubsystemRng) -> u8 {
        let t = &self.config.plot_thresholds;
        if percentile <= t.low_percentile {
            return t.low_plots;
        }
        if percentile >= t.high_percentile {
            return t.high_plots;
        }
        let p_extra = (percentile - t.low_percentile) / (t.high_percentile - t.low_percentile);
        let extra = (0..t.high_plots - t.low_plots)
            .filter(|_| rng.chance(p_extra))
            .count() as u8;
        t.low_plots + extra
    }

    fn draw_eu_preference(&self, rng: &mut SubsystemRng) -> SimResult<f64> {
        let value = match self.config.eu_preference {
            EuPreferenceDistribution::Uniform { low, high } => rng.uniform(low, high),
            EuPreferenceDistribution::Beta { alpha, beta } => rng.beta(alpha, beta)?,
        };
        Ok(value.clamp(0.0, 1.0))
    }
}
