//! Yearly trade-flow allocation.
//!
//! farmer production → Dirichlet split over routable middlemen
//!                    → each middleman's Dirichlet split over its exporters
//!                    → one EU/non-EU draw per (farmer, middleman, exporter).
//!
//! Farmers are allocated in parallel. Each farmer draws from its own
//! stream forked off the year's flow stream, so the output does not
//! depend on thread count or scheduling.

use crate::{
    actors::{CountryActors, Exporter},
    config::SimConfig,
    error::{SimError, SimResult},
    relationships::{Adjacency, RelationshipLedger},
    rng::SubsystemRng,
    types::{ActorIdx, EdgeType, Year},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeFlow {
    /// Position of the flow inside its (country, year) partition.
    pub flow_id:    u64,
    pub year:       Year,
    pub farmer:     ActorIdx,
    pub middleman:  ActorIdx,
    pub exporter:   ActorIdx,
    pub amount_kg:  f64,
    pub sold_to_eu: bool,
}

#[derive(Debug, Clone, Default)]
pub struct YearFlows {
    pub flows:           Vec<TradeFlow>,
    pub total_volume_kg: f64,
    pub eu_volume_kg:    f64,
    /// Farmers with production but no route to any exporter this year.
    pub unrouted:        Vec<ActorIdx>,
}

impl YearFlows {
    pub fn eu_share(&self) -> f64 {
        if self.total_volume_kg > 0.0 {
            self.eu_volume_kg / self.total_volume_kg
        } else {
            0.0
        }
    }
}

/// `min(eu_preference, (eu_target / total_production) × (1 + 0.1 × (eu_preference − 0.5)))`
/// clipped to [0, 1].
pub fn eu_probability(exporter: &Exporter, eu_target_kg: f64, total_production_kg: f64) -> f64 {
    if total_production_kg <= 0.0 {
        return 0.0;
    }
    let pressure = (eu_target_kg / total_production_kg) * (1.0 + 0.1 * (exporter.eu_preference - 0.5));
    exporter.eu_preference.min(pressure).clamp(0.0, 1.0)
}

pub struct TradeFlowGenerator<'a> {
    actors: &'a CountryActors,
    config: &'a SimConfig,
}

impl<'a> TradeFlowGenerator<'a> {
    pub fn new(actors: &'a CountryActors, config: &'a SimConfig) -> Self {
        Self { actors, config }
    }

    pub fn generate(
        &self,
        ledger: &RelationshipLedger,
        year: Year,
        split_rng: &mut SubsystemRng,
        farmer_rng: &SubsystemRng,
    ) -> SimResult<YearFlows> {
        let actors = self.actors;
        let buyers = ledger.adjacency(EdgeType::F2M, actors.farmers.len());
        let outlets = ledger.adjacency(EdgeType::M2E, actors.middlemen.len());

        // One split per middleman per year, aligned with its exporter list.
        let splits: Vec<Vec<f64>> = (0..actors.middlemen.len() as ActorIdx)
            .map(|m| split_rng.dirichlet_uniform(outlets.degree(m)))
            .collect();

        let total_production = actors.total_production_kg();
        let eu_p: Vec<f64> = actors
            .exporters
            .iter()
            .map(|e| eu_probability(e, actors.assumptions.eu_target_kg, total_production))
            .collect();

        let per_farmer: Vec<Vec<TradeFlow>> = actors
            .farmers
            .par_iter()
            .enumerate()
            .map(|(f, _)| {
                let mut rng = farmer_rng.fork(f as u64);
                self.allocate_farmer(f as ActorIdx, year, &buyers, &outlets, &splits, &eu_p, &mut rng)
            })
            .collect::<SimResult<_>>()?;

        let mut out = YearFlows::default();
        for (f, flows) in per_farmer.into_iter().enumerate() {
            if flows.is_empty() {
                out.unrouted.push(f as ActorIdx);
                continue;
            }
            for mut flow in flows {
                flow.flow_id = out.flows.len() as u64;
                out.total_volume_kg += flow.amount_kg;
                if flow.sold_to_eu {
                    out.eu_volume_kg += flow.amount_kg;
                }
                out.flows.push(flow);
            }
        }

        log::debug!(
            "country={} year={year} trade: {} flows, {:.0} kg, eu share {:.3}, {} farmers unrouted",
            actors.country_id,
            out.flows.len(),
            out.total_volume_kg,
            out.eu_share(),
            out.unrouted.len()
        );
        if !out.unrouted.is_empty() {
            log::warn!(
                "country={} year={year} trade: {} farmers have no route to an exporter",
                actors.country_id,
                out.unrouted.len()
            );
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate_farmer(
        &self,
        f: ActorIdx,
        year: Year,
        buyers: &Adjacency,
        outlets: &Adjacency,
        splits: &[Vec<f64>],
        eu_p: &[f64],
        rng: &mut SubsystemRng,
    ) -> SimResult<Vec<TradeFlow>> {
        let production = self.actors.farmers[f as usize].production_kg;
        let routable: Vec<ActorIdx> = buyers
            .partners(f)
            .iter()
            .copied()
            .filter(|m| outlets.degree(*m) > 0)
            .collect();
        if routable.is_empty() {
            return Ok(Vec::new());
        }

        let mut flows = Vec::new();
        let mut allocated = 0.0;
        for (m, share) in routable.iter().zip(rng.dirichlet_uniform(routable.len())) {
            let to_middleman = production * share;
            for (e, e_share) in outlets.partners(*m).iter().zip(&splits[*m as usize]) {
                let amount_kg = to_middleman * e_share;
                if amount_kg <= 0.0 {
                    continue;
                }
                let sold_to_eu = rng.chance(eu_p[*e as usize]);
                allocated += amount_kg;
                flows.push(TradeFlow {
                    flow_id: 0,
                    year,
                    farmer: f,
                    middleman: *m,
                    exporter: *e,
                    amount_kg,
                    sold_to_eu,
                });
            }
        }

        if (allocated - production).abs() > self.config.conservation_tolerance * production {
            return Err(SimError::VolumeConservation {
                country: self.actors.country_id.clone(),
                year,
                farmer_id: self.actors.farmer_id(f),
                allocated,
                production,
            });
        }
        Ok(flows)
    }
}
