//! Middleman coverage of producing areas and geographies.
//!
//! Year 0 builds coverage from scratch; every later year each middleman
//! keeps its geographies with probability `1 - geography_change_rate`
//! and is otherwise re-placed on its own. Minimum coverage is restored
//! after every pass.

use crate::{
    actors::CountryActors,
    config::SimConfig,
    rng::SubsystemRng,
    types::ActorIdx,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which geographies each middleman buys in this year.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Coverage {
    by_middleman: Vec<BTreeSet<ActorIdx>>,
    home_area:    Vec<Option<ActorIdx>>,
}

impl Coverage {
    pub fn empty(n_middlemen: usize) -> Self {
        Self {
            by_middleman: vec![BTreeSet::new(); n_middlemen],
            home_area:    vec![None; n_middlemen],
        }
    }

    pub fn geographies_of(&self, middleman: ActorIdx) -> &BTreeSet<ActorIdx> {
        &self.by_middleman[middleman as usize]
    }

    pub fn home_area(&self, middleman: ActorIdx) -> Option<ActorIdx> {
        self.home_area[middleman as usize]
    }

    /// Middlemen per geography, each list in ascending middleman order.
    pub fn middlemen_by_geography(&self, n_geographies: usize) -> Vec<Vec<ActorIdx>> {
        let mut by_geo = vec![Vec::new(); n_geographies];
        for (m, geos) in self.by_middleman.iter().enumerate() {
            for g in geos {
                by_geo[*g as usize].push(m as ActorIdx);
            }
        }
        by_geo
    }

    /// Every (middleman, geography) pair, ordered by middleman then geography.
    pub fn pairs(&self) -> impl Iterator<Item = (ActorIdx, ActorIdx)> + '_ {
        self.by_middleman
            .iter()
            .enumerate()
            .flat_map(|(m, geos)| geos.iter().map(move |g| (m as ActorIdx, *g)))
    }

    pub fn middlemen_in_area(&self, actors: &CountryActors, area: ActorIdx) -> BTreeSet<ActorIdx> {
        let geos = &actors.areas[area as usize].geographies;
        self.by_middleman
            .iter()
            .enumerate()
            .filter(|(_, covered)| geos.iter().any(|g| covered.contains(g)))
            .map(|(m, _)| m as ActorIdx)
            .collect()
    }

    pub fn pair_count(&self) -> usize {
        self.by_middleman.iter().map(BTreeSet::len).sum()
    }
}

/// Minimum coverage that could not be met because the pool was too small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum CoverageShortfall {
    Area { region_id: String, assigned: usize, required: usize },
    Geography { geo_id: String, assigned: usize, required: usize },
}

pub struct GeographyAssigner<'a> {
    actors: &'a CountryActors,
    config: &'a SimConfig,
}

impl<'a> GeographyAssigner<'a> {
    pub fn new(actors: &'a CountryActors, config: &'a SimConfig) -> Self {
        Self { actors, config }
    }

    /// Year-0 coverage: seed every area, spread the rest by farmer weight,
    /// then expand each middleman across geographies of its area.
    pub fn initial(&self, rng: &mut SubsystemRng) -> (Coverage, Vec<CoverageShortfall>) {
        let n_middlemen = self.actors.middlemen.len();
        let mut coverage = Coverage::empty(n_middlemen);
        let mut pool: Vec<ActorIdx> = (0..n_middlemen as ActorIdx).collect();

        for area in 0..self.actors.areas.len() {
            let take = self.config.min_middlemen_per_area.min(pool.len());
            for _ in 0..take {
                let picked = pool.swap_remove(rng.pick_index(pool.len()));
                coverage.home_area[picked as usize] = Some(area as ActorIdx);
            }
        }

        pool.sort_unstable();
        for m in pool {
            coverage.home_area[m as usize] = Some(self.draw_area(rng));
        }

        for m in 0..n_middlemen as ActorIdx {
            if let Some(area) = coverage.home_area[m as usize] {
                self.place_in_area(&mut coverage, m, area, rng);
            }
        }

        let shortfalls = self.enforce_minimums(&mut coverage);
        (coverage, shortfalls)
    }

    /// Coverage for year y > 0 derived from last year's.
    pub fn reassign(&self, previous: &Coverage, rng: &mut SubsystemRng) -> (Coverage, Vec<CoverageShortfall>) {
        let change_rate = self.actors.assumptions.geography_change_rate;
        let mut coverage = previous.clone();
        let mut moved = 0usize;

        for m in 0..self.actors.middlemen.len() as ActorIdx {
            if !rng.chance(change_rate) {
                continue;
            }
            coverage.by_middleman[m as usize].clear();
            let area = self.draw_area(rng);
            coverage.home_area[m as usize] = Some(area);
            self.place_in_area(&mut coverage, m, area, rng);
            moved += 1;
        }

        log::debug!(
            "country={} geography: {moved} middlemen re-placed",
            self.actors.country_id
        );

        let shortfalls = self.enforce_minimums(&mut coverage);
        (coverage, shortfalls)
    }

    fn draw_area(&self, rng: &mut SubsystemRng) -> ActorIdx {
        let weights: Vec<f64> = self.actors.areas.iter().map(|a| a.num_farmers as f64).collect();
        rng.weighted_index(&weights) as ActorIdx
    }

    /// `max(1, floor(|geos| × competitiveness))` geographies of the area,
    /// drawn by farmer weight without replacement.
    fn place_in_area(&self, coverage: &mut Coverage, m: ActorIdx, area: ActorIdx, rng: &mut SubsystemRng) {
        let geos = &self.actors.areas[area as usize].geographies;
        let competitiveness = self.actors.middlemen[m as usize].competitiveness;
        let count = ((geos.len() as f64 * competitiveness).floor() as usize).clamp(1, geos.len());
        let weights: Vec<f64> = geos
            .iter()
            .map(|g| self.actors.geographies[*g as usize].num_farmers as f64)
            .collect();
        for g in rng.choose_weighted(geos, &weights, count) {
            coverage.by_middleman[m as usize].insert(g);
        }
    }

    /// Top up areas and geographies below their minimum with the most
    /// competitive middlemen available, nearest pool first.
    fn enforce_minimums(&self, coverage: &mut Coverage) -> Vec<CoverageShortfall> {
        let actors = self.actors;
        let min_area = self.config.min_middlemen_per_area;
        let min_geo = self.config.min_middlemen_per_geography;
        let mut shortfalls = Vec::new();

        let by_competitiveness: Vec<ActorIdx> = {
            let mut order: Vec<ActorIdx> = (0..actors.middlemen.len() as ActorIdx).collect();
            order.sort_by(|a, b| {
                actors.middlemen[*b as usize]
                    .competitiveness
                    .total_cmp(&actors.middlemen[*a as usize].competitiveness)
                    .then(a.cmp(b))
            });
            order
        };

        for (area_idx, area) in actors.areas.iter().enumerate() {
            let present = coverage.middlemen_in_area(actors, area_idx as ActorIdx);
            if present.len() >= min_area {
                continue;
            }
            let mut assigned = present.len();
            let mut geo_counts = coverage.middlemen_by_geography(actors.geographies.len());
            for m in by_competitiveness.iter().filter(|m| !present.contains(*m)) {
                if assigned >= min_area {
                    break;
                }
                // Thinnest geography of the area, most farmers on ties.
                let Some(&target) = area.geographies.iter().min_by(|a, b| {
                    geo_counts[**a as usize].len().cmp(&geo_counts[**b as usize].len()).then(
                        actors.geographies[**b as usize]
                            .num_farmers
                            .cmp(&actors.geographies[**a as usize].num_farmers),
                    )
                }) else {
                    break;
                };
                coverage.by_middleman[*m as usize].insert(target);
                geo_counts[target as usize].push(*m);
                assigned += 1;
            }
            if assigned < min_area {
                shortfalls.push(CoverageShortfall::Area {
                    region_id: area.region_id.clone(),
                    assigned,
                    required: min_area,
                });
            }
        }

        let mut by_geo = coverage.middlemen_by_geography(actors.geographies.len());
        for (geo_idx, geo) in actors.geographies.iter().enumerate() {
            if by_geo[geo_idx].len() >= min_geo {
                continue;
            }
            let area_members = coverage.middlemen_in_area(actors, geo.area);
            let (local, remote): (Vec<ActorIdx>, Vec<ActorIdx>) = by_competitiveness
                .iter()
                .copied()
                .filter(|m| !by_geo[geo_idx].contains(m))
                .partition(|m| area_members.contains(m));
            for m in local.into_iter().chain(remote) {
                if by_geo[geo_idx].len() >= min_geo {
                    break;
                }
                coverage.by_middleman[m as usize].insert(geo_idx as ActorIdx);
                by_geo[geo_idx].push(m);
            }
            if by_geo[geo_idx].len() < min_geo {
                shortfalls.push(CoverageShortfall::Geography {
                    geo_id: geo.geo_id.clone(),
                    assigned: by_geo[geo_idx].len(),
                    required: min_geo,
                });
            }
        }

        for shortfall in &shortfalls {
            log::warn!(
                "country={} geography: coverage constraint unmet, middleman pool too small: {shortfall:?}",
                actors.country_id
            );
        }
        shortfalls
    }
}
