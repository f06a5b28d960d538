//! Relationship ledger and the year-over-year edge state machine.
//!
//! Edge lifecycle: Forming → Active → Terminated.
//!   - An edge is Forming during the year it is created.
//!   - It becomes Active at the start of the next year.
//!   - Terminated is final; a successor is always a new edge with a new id.
//!
//! Only live edges are held in memory. An edge terminated in year y is
//! kept until that year's snapshot is taken, then dropped.

use crate::{
    actors::CountryActors,
    config::SimConfig,
    geography::Coverage,
    rng::SubsystemRng,
    types::{ActorIdx, ActorKind, EdgeId, EdgeType, Year},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ── Edges ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    Forming,
    Active,
    Terminated,
}

impl EdgeState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Forming => "forming",
            Self::Active => "active",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id:           EdgeId,
    pub edge_type:    EdgeType,
    pub source:       ActorIdx,
    pub target:       ActorIdx,
    pub start_year:   Year,
    pub end_year:     Option<Year>,
    pub years_active: u32,
    pub state:        EdgeState,
}

impl Edge {
    fn new(id: EdgeId, edge_type: EdgeType, source: ActorIdx, target: ActorIdx, year: Year) -> Self {
        Self {
            id,
            edge_type,
            source,
            target,
            start_year: year,
            end_year: None,
            years_active: 0,
            state: EdgeState::Forming,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state != EdgeState::Terminated
    }

    fn promote(&mut self) {
        if self.state == EdgeState::Forming {
            self.state = EdgeState::Active;
        }
    }

    fn survive(&mut self) {
        debug_assert!(self.is_live(), "terminated edge {} cannot survive", self.id);
        self.state = EdgeState::Active;
        self.years_active += 1;
    }

    fn terminate(&mut self, year: Year) {
        self.state = EdgeState::Terminated;
        self.end_year = Some(year);
    }
}

/// `P(continue) = base_loyalty + min(cap, years_active × step)`, clipped to [0, 1].
pub fn continuation_probability(base_loyalty: f64, years_active: u32, step: f64, cap: f64) -> f64 {
    (base_loyalty + (years_active as f64 * step).min(cap)).clamp(0.0, 1.0)
}

// ── Adjacency ────────────────────────────────────────────────────────────────

/// Compressed adjacency: partners of each source in edge-id order.
#[derive(Debug, Clone, Default)]
pub struct Adjacency {
    offsets: Vec<usize>,
    targets: Vec<ActorIdx>,
}

impl Adjacency {
    pub fn from_edges<'e>(n_sources: usize, edges: impl Iterator<Item = &'e Edge> + Clone) -> Self {
        let mut offsets = vec![0usize; n_sources + 1];
        for e in edges.clone() {
            offsets[e.source as usize + 1] += 1;
        }
        for i in 0..n_sources {
            offsets[i + 1] += offsets[i];
        }
        let mut cursor = offsets.clone();
        let mut targets = vec![0; offsets[n_sources]];
        for e in edges {
            let slot = &mut cursor[e.source as usize];
            targets[*slot] = e.target;
            *slot += 1;
        }
        Self { offsets, targets }
    }

    pub fn partners(&self, source: ActorIdx) -> &[ActorIdx] {
        let s = source as usize;
        &self.targets[self.offsets[s]..self.offsets[s + 1]]
    }

    pub fn degree(&self, source: ActorIdx) -> usize {
        self.partners(source).len()
    }

    pub fn sources(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }
}

// ── Ledger ───────────────────────────────────────────────────────────────────

/// All live edges of one country plus the edges terminated this year.
#[derive(Debug, Clone, Default)]
pub struct RelationshipLedger {
    next_id:             EdgeId,
    farmer_middleman:    Vec<Edge>,
    middleman_exporter:  Vec<Edge>,
    middleman_geography: Vec<Edge>,
    terminated:          Vec<Edge>,
}

impl RelationshipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edges(&self, edge_type: EdgeType) -> &[Edge] {
        match edge_type {
            EdgeType::F2M => &self.farmer_middleman,
            EdgeType::M2E => &self.middleman_exporter,
            EdgeType::M2G => &self.middleman_geography,
        }
    }

    fn edges_mut(&mut self, edge_type: EdgeType) -> &mut Vec<Edge> {
        match edge_type {
            EdgeType::F2M => &mut self.farmer_middleman,
            EdgeType::M2E => &mut self.middleman_exporter,
            EdgeType::M2G => &mut self.middleman_geography,
        }
    }

    pub fn form(&mut self, edge_type: EdgeType, source: ActorIdx, target: ActorIdx, year: Year) -> EdgeId {
        let id = self.next_id;
        self.next_id += 1;
        self.edges_mut(edge_type).push(Edge::new(id, edge_type, source, target, year));
        id
    }

    /// Year boundary: every edge formed last year is now Active.
    pub fn promote(&mut self) {
        for edges in [
            &mut self.farmer_middleman,
            &mut self.middleman_exporter,
            &mut self.middleman_geography,
        ] {
            edges.iter_mut().for_each(Edge::promote);
        }
    }

    /// One Bernoulli continuation draw per Active edge, in edge-id order.
    /// Returns the (source, target) pairs that were dropped.
    pub fn continue_edges(
        &mut self,
        edge_type: EdgeType,
        year: Year,
        rng: &mut SubsystemRng,
        mut probability: impl FnMut(&Edge) -> f64,
    ) -> Vec<(ActorIdx, ActorIdx)> {
        let mut dropped = Vec::new();
        let edges = self.edges_mut(edge_type);
        for edge in edges.iter_mut().filter(|e| e.state == EdgeState::Active) {
            if rng.chance(probability(&*edge)) {
                edge.survive();
            } else {
                edge.terminate(year);
                dropped.push((edge.source, edge.target));
            }
        }
        self.sweep(edge_type);
        dropped
    }

    /// Move terminated edges of one type out of the live set.
    fn sweep(&mut self, edge_type: EdgeType) {
        let edges = std::mem::take(self.edges_mut(edge_type));
        let (live, ended): (Vec<Edge>, Vec<Edge>) = edges.into_iter().partition(Edge::is_live);
        *self.edges_mut(edge_type) = live;
        self.terminated.extend(ended);
    }

    pub fn adjacency(&self, edge_type: EdgeType, n_sources: usize) -> Adjacency {
        Adjacency::from_edges(n_sources, self.edges(edge_type).iter())
    }

    pub fn live_count(&self, edge_type: EdgeType) -> usize {
        self.edges(edge_type).len()
    }

    /// Every edge that existed during the current year, in id order:
    /// the live set plus edges terminated this year.
    pub fn year_snapshot(&self) -> Vec<Edge> {
        let mut all: Vec<Edge> = self
            .farmer_middleman
            .iter()
            .chain(&self.middleman_exporter)
            .chain(&self.middleman_geography)
            .chain(&self.terminated)
            .cloned()
            .collect();
        all.sort_by_key(|e| e.id);
        all
    }

    /// Drop this year's terminated edges once they have been written.
    pub fn finish_year(&mut self) {
        self.terminated.clear();
    }
}

// ── Evolver ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionStats {
    pub formed:          u64,
    pub terminated:      u64,
    /// Actors left without any outbound edge this year.
    pub under_connected: Vec<(ActorKind, ActorIdx)>,
}

impl EvolutionStats {
    pub fn merge(&mut self, other: EvolutionStats) {
        self.formed += other.formed;
        self.terminated += other.terminated;
        self.under_connected.extend(other.under_connected);
    }
}

pub struct RelationshipEvolver<'a> {
    actors: &'a CountryActors,
    config: &'a SimConfig,
}

impl<'a> RelationshipEvolver<'a> {
    pub fn new(actors: &'a CountryActors, config: &'a SimConfig) -> Self {
        Self { actors, config }
    }

    /// Year 0: geography edges from the initial coverage, then every farmer
    /// and middleman draws its first partners.
    pub fn initialize(
        &self,
        ledger: &mut RelationshipLedger,
        coverage: &Coverage,
        farmer_rng: &mut SubsystemRng,
        exporter_rng: &mut SubsystemRng,
    ) -> EvolutionStats {
        let year = 0;
        let mut stats = self.apply_coverage(ledger, coverage, year);
        let caps = self.caps();

        let by_geo = coverage.middlemen_by_geography(self.actors.geographies.len());
        for (f, farmer) in self.actors.farmers.iter().enumerate() {
            let eligible = &by_geo[farmer.geography as usize];
            for m in draw_partners(farmer_rng, eligible, caps.buyers, caps.buyers, |_, _| true) {
                ledger.form(EdgeType::F2M, f as ActorIdx, m, year);
                stats.formed += 1;
            }
        }

        let all_exporters: Vec<ActorIdx> = (0..self.actors.exporters.len() as ActorIdx).collect();
        for m in 0..self.actors.middlemen.len() as ActorIdx {
            let accept = self.exporter_acceptance(m, true);
            for e in draw_partners(exporter_rng, &all_exporters, caps.exporters, caps.exporters, accept) {
                ledger.form(EdgeType::M2E, m, e, year);
                stats.formed += 1;
            }
        }

        stats.under_connected = self.under_connected(ledger);
        self.log_stats(year, &stats, ledger);
        stats
    }

    /// Year y > 0 for trading edges, using last year's coverage.
    pub fn advance(
        &self,
        ledger: &mut RelationshipLedger,
        coverage: &Coverage,
        year: Year,
        farmer_rng: &mut SubsystemRng,
        exporter_rng: &mut SubsystemRng,
    ) -> EvolutionStats {
        ledger.promote();
        let mut stats = EvolutionStats::default();
        self.evolve_farmer_edges(ledger, coverage, year, farmer_rng, &mut stats);
        self.evolve_exporter_edges(ledger, year, exporter_rng, &mut stats);
        stats.under_connected = self.under_connected(ledger);
        self.log_stats(year, &stats, ledger);
        stats
    }

    /// Reconcile geography edges with this year's coverage: retained pairs
    /// age, dropped pairs terminate, new pairs form.
    pub fn apply_coverage(&self, ledger: &mut RelationshipLedger, coverage: &Coverage, year: Year) -> EvolutionStats {
        let mut stats = EvolutionStats::default();
        let mut existing = BTreeSet::new();
        for edge in ledger.edges_mut(EdgeType::M2G).iter_mut() {
            if coverage.geographies_of(edge.source).contains(&edge.target) {
                edge.survive();
                existing.insert((edge.source, edge.target));
            } else {
                edge.terminate(year);
                stats.terminated += 1;
            }
        }
        ledger.sweep(EdgeType::M2G);

        for (m, g) in coverage.pairs() {
            if !existing.contains(&(m, g)) {
                ledger.form(EdgeType::M2G, m, g, year);
                stats.formed += 1;
            }
        }
        stats
    }

    fn evolve_farmer_edges(
        &self,
        ledger: &mut RelationshipLedger,
        coverage: &Coverage,
        year: Year,
        rng: &mut SubsystemRng,
        stats: &mut EvolutionStats,
    ) {
        let actors = self.actors;
        let n_farmers = actors.farmers.len();
        let cap = self.caps().buyers;
        let by_geo = coverage.middlemen_by_geography(actors.geographies.len());

        // Farmers without any buyer try once more each year.
        let before = ledger.adjacency(EdgeType::F2M, n_farmers);
        for (f, farmer) in actors.farmers.iter().enumerate() {
            if before.degree(f as ActorIdx) > 0 {
                continue;
            }
            let eligible = &by_geo[farmer.geography as usize];
            for m in draw_partners(rng, eligible, 1, cap, |_, _| true) {
                ledger.form(EdgeType::F2M, f as ActorIdx, m, year);
                stats.formed += 1;
            }
        }

        let (step, step_cap) = (self.config.continuation_step, self.config.continuation_cap);
        let dropped = ledger.continue_edges(EdgeType::F2M, year, rng, |edge| {
            let base = (actors.farmers[edge.source as usize].loyalty
                + actors.middlemen[edge.target as usize].loyalty)
                / 2.0;
            continuation_probability(base, edge.years_active, step, step_cap)
        });
        stats.terminated += dropped.len() as u64;

        let after = ledger.adjacency(EdgeType::F2M, n_farmers);
        for (f, lost) in group_by_source(dropped) {
            let mut partners = after.partners(f).to_vec();
            let geo = actors.farmers[f as usize].geography as usize;
            for _ in 0..lost.len() {
                if partners.len() >= cap {
                    break;
                }
                let eligible: Vec<ActorIdx> = by_geo[geo]
                    .iter()
                    .copied()
                    .filter(|m| !partners.contains(m))
                    .collect();
                for m in draw_partners(rng, &eligible, 1, cap - partners.len(), |_, _| true) {
                    ledger.form(EdgeType::F2M, f, m, year);
                    partners.push(m);
                    stats.formed += 1;
                }
            }
        }
    }

    fn evolve_exporter_edges(
        &self,
        ledger: &mut RelationshipLedger,
        year: Year,
        rng: &mut SubsystemRng,
        stats: &mut EvolutionStats,
    ) {
        let actors = self.actors;
        let n_middlemen = actors.middlemen.len();
        let cap = self.caps().exporters;
        let all_exporters: Vec<ActorIdx> = (0..actors.exporters.len() as ActorIdx).collect();

        let before = ledger.adjacency(EdgeType::M2E, n_middlemen);
        for m in 0..n_middlemen as ActorIdx {
            if before.degree(m) > 0 {
                continue;
            }
            for e in draw_partners(rng, &all_exporters, 1, cap, self.exporter_acceptance(m, true)) {
                ledger.form(EdgeType::M2E, m, e, year);
                stats.formed += 1;
            }
        }

        let (step, step_cap) = (self.config.continuation_step, self.config.continuation_cap);
        let dropped = ledger.continue_edges(EdgeType::M2E, year, rng, |edge| {
            let base = (actors.middlemen[edge.source as usize].loyalty
                + actors.exporters[edge.target as usize].loyalty)
                / 2.0;
            continuation_probability(base, edge.years_active, step, step_cap)
        });
        stats.terminated += dropped.len() as u64;

        let after = ledger.adjacency(EdgeType::M2E, n_middlemen);
        for (m, lost) in group_by_source(dropped) {
            let mut partners = after.partners(m).to_vec();
            for _ in 0..lost.len() {
                if partners.len() >= cap {
                    break;
                }
                let eligible: Vec<ActorIdx> = all_exporters
                    .iter()
                    .copied()
                    .filter(|e| !partners.contains(e))
                    .collect();
                let accept = self.exporter_acceptance(m, partners.is_empty());
                for e in draw_partners(rng, &eligible, 1, cap - partners.len(), accept) {
                    ledger.form(EdgeType::M2E, m, e, year);
                    partners.push(e);
                    stats.formed += 1;
                }
            }
        }
    }

    /// Acceptance of a uniformly drawn exporter: probability equal to the
    /// middleman's competitiveness. A middleman without any exporter takes
    /// its first pick unconditionally so its volume always has a route out.
    fn exporter_acceptance(&self, m: ActorIdx, has_none: bool) -> impl FnMut(&mut SubsystemRng, usize) -> bool {
        let p = self.actors.middlemen[m as usize].competitiveness.clamp(0.0, 1.0);
        move |rng, chosen| (has_none && chosen == 0) || rng.chance(p)
    }

    fn under_connected(&self, ledger: &RelationshipLedger) -> Vec<(ActorKind, ActorIdx)> {
        let farmers = ledger.adjacency(EdgeType::F2M, self.actors.farmers.len());
        let middlemen = ledger.adjacency(EdgeType::M2E, self.actors.middlemen.len());
        let mut out: Vec<(ActorKind, ActorIdx)> = (0..farmers.sources() as ActorIdx)
            .filter(|f| farmers.degree(*f) == 0)
            .map(|f| (ActorKind::Farmer, f))
            .collect();
        out.extend(
            (0..middlemen.sources() as ActorIdx)
                .filter(|m| middlemen.degree(*m) == 0)
                .map(|m| (ActorKind::Middleman, m)),
        );
        out
    }

    fn caps(&self) -> Caps {
        Caps {
            buyers:    self.actors.assumptions.max_buyers_per_farmer as usize,
            exporters: self.actors.assumptions.max_exporters_per_middleman as usize,
        }
    }

    fn log_stats(&self, year: Year, stats: &EvolutionStats, ledger: &RelationshipLedger) {
        log::debug!(
            "country={} year={year} relationships: formed={} terminated={} live F2M={} M2E={} M2G={} under_connected={}",
            self.actors.country_id,
            stats.formed,
            stats.terminated,
            ledger.live_count(EdgeType::F2M),
            ledger.live_count(EdgeType::M2E),
            ledger.live_count(EdgeType::M2G),
            stats.under_connected.len()
        );
        if !stats.under_connected.is_empty() {
            log::warn!(
                "country={} year={year} relationships: {} actors left without a partner",
                self.actors.country_id,
                stats.under_connected.len()
            );
        }
    }
}

struct Caps {
    buyers:    usize,
    exporters: usize,
}

/// `draws` independent uniform picks over `eligible` (each candidate with
/// probability 1/N per draw), duplicates rejected, stopping once `room`
/// partners are chosen. `accept` gates each pick and sees how many
/// partners were chosen so far.
pub fn draw_partners(
    rng: &mut SubsystemRng,
    eligible: &[ActorIdx],
    draws: usize,
    room: usize,
    mut accept: impl FnMut(&mut SubsystemRng, usize) -> bool,
) -> Vec<ActorIdx> {
    let mut chosen: Vec<ActorIdx> = Vec::with_capacity(room.min(eligible.len()));
    if eligible.is_empty() {
        return chosen;
    }
    for _ in 0..draws {
        if chosen.len() >= room {
            break;
        }
        let pick = eligible[rng.pick_index(eligible.len())];
        if chosen.contains(&pick) {
            continue;
        }
        if accept(rng, chosen.len()) {
            chosen.push(pick);
        }
    }
    chosen
}

fn group_by_source(pairs: Vec<(ActorIdx, ActorIdx)>) -> BTreeMap<ActorIdx, Vec<ActorIdx>> {
    let mut grouped: BTreeMap<ActorIdx, Vec<ActorIdx>> = BTreeMap::new();
    for (source, target) in pairs {
        grouped.entry(source).or_default().push(target);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_partners_rejects_duplicates_and_respects_room() {
        let mut rng = SubsystemRng::from_seed(3);
        let eligible = [4, 5, 6];
        for _ in 0..200 {
            let chosen = draw_partners(&mut rng, &eligible, 10, 2, |_, _| true);
            assert!(!chosen.is_empty() && chosen.len() <= 2);
            let unique: BTreeSet<_> = chosen.iter().collect();
            assert_eq!(unique.len(), chosen.len());
        }
    }

    #[test]
    fn adjacency_keeps_edge_order_per_source() {
        let edges = vec![
            Edge::new(0, EdgeType::F2M, 1, 9, 0),
            Edge::new(1, EdgeType::F2M, 0, 7, 0),
            Edge::new(2, EdgeType::F2M, 1, 3, 0),
        ];
        let adj = Adjacency::from_edges(3, edges.iter());
        assert_eq!(adj.partners(0), &[7]);
        assert_eq!(adj.partners(1), &[9, 3]);
        assert!(adj.partners(2).is_empty());
    }

    #[test]
    fn terminated_edges_leave_after_year_snapshot() {
        let mut ledger = RelationshipLedger::new();
        ledger.form(EdgeType::F2M, 0, 0, 0);
        ledger.form(EdgeType::F2M, 1, 0, 0);
        ledger.promote();
        let mut rng = SubsystemRng::from_seed(1);
        let dropped = ledger.continue_edges(EdgeType::F2M, 1, &mut rng, |e| if e.id == 0 { 0.0 } else { 1.0 });
        assert_eq!(dropped, vec![(0, 0)]);

        let snapshot = ledger.year_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].state, EdgeState::Terminated);
        assert_eq!(snapshot[0].end_year, Some(1));
        assert_eq!(snapshot[1].years_active, 1);

        ledger.finish_year();
        assert_eq!(ledger.year_snapshot().len(), 1);
    }
}
