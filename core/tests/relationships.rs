//! Relationship state machine: fan-out caps, continuation, ageing and
//! replacement edges.

mod common;

use coffee_chain_core::{
    actors::CountryActors,
    config::SimConfig,
    country::generate_actors,
    geography::{Coverage, GeographyAssigner},
    relationships::{continuation_probability, EdgeState, RelationshipEvolver, RelationshipLedger},
    rng::{RngBank, StreamSlot, SubsystemRng},
    types::EdgeType,
};
use common::{assumption_set, build_engine, costa_rica, country, geography, ids, standard_set};
use std::collections::{BTreeMap, HashMap};

fn cr_actors(seed: u64) -> CountryActors {
    let set = assumption_set(vec![costa_rica()]);
    generate_actors(&SimConfig::default_test(), &set.country_inputs("CR").unwrap(), seed).unwrap()
}

/// Drive the evolver directly for `years` years and hand each year's
/// ledger to `inspect` before it is finished.
fn evolve(actors: &CountryActors, seed: u64, years: u32, mut inspect: impl FnMut(u32, &RelationshipLedger, &Coverage)) {
    let config = SimConfig::default_test();
    let assigner = GeographyAssigner::new(actors, &config);
    let evolver = RelationshipEvolver::new(actors, &config);
    let bank = RngBank::new(seed, &actors.country_id);
    let mut ledger = RelationshipLedger::new();

    let (mut coverage, _) = assigner.initial(&mut bank.for_year(StreamSlot::Geography, 0));
    evolver.initialize(
        &mut ledger,
        &coverage,
        &mut bank.for_year(StreamSlot::FarmerEdges, 0),
        &mut bank.for_year(StreamSlot::ExporterEdges, 0),
    );
    inspect(0, &ledger, &coverage);
    ledger.finish_year();

    for year in 1..years {
        evolver.advance(
            &mut ledger,
            &coverage,
            year,
            &mut bank.for_year(StreamSlot::FarmerEdges, year),
            &mut bank.for_year(StreamSlot::ExporterEdges, year),
        );
        let (next, _) = assigner.reassign(&coverage, &mut bank.for_year(StreamSlot::Geography, year));
        coverage = next;
        evolver.apply_coverage(&mut ledger, &coverage, year);
        inspect(year, &ledger, &coverage);
        ledger.finish_year();
    }
}

#[test]
fn continuation_probability_matches_reference_cases() {
    // Loyal pair with a long history always continues.
    assert_eq!(continuation_probability(0.9, 5, 0.1, 0.3), 1.0);
    // Disloyal new pair terminates with probability 0.9.
    assert!((continuation_probability(0.1, 0, 0.1, 0.3) - 0.1).abs() < 1e-12);
}

/// One geography of 2000 single-buyer farmers, five middlemen and one
/// exporter, with every loyalty overridden.
fn loyalty_actors(farmer: f64, middleman: f64, exporter: f64) -> CountryActors {
    let mut c = country("LY", 5, 1);
    c.max_buyers_per_farmer = 1;
    c.max_exporters_per_middleman = 1;
    let set = assumption_set(vec![(c, vec![geography("LY", "LY-G1", "LY-R1", 2_000, 1_000.0)])]);
    let mut actors = generate_actors(&SimConfig::default_test(), &set.country_inputs("LY").unwrap(), 8).unwrap();
    actors.farmers.iter_mut().for_each(|f| f.loyalty = farmer);
    actors.middlemen.iter_mut().for_each(|m| m.loyalty = middleman);
    actors.exporters.iter_mut().for_each(|e| e.loyalty = exporter);
    actors
}

fn ended_this_year(ledger: &RelationshipLedger, edge_type: EdgeType) -> usize {
    ledger
        .year_snapshot()
        .iter()
        .filter(|e| e.edge_type == edge_type && e.state == EdgeState::Terminated)
        .count()
}

#[test]
fn disloyal_new_pairs_end_nine_times_in_ten() {
    // Farmer 0.0 and middleman 0.2 average to a pair loyalty of 0.1.
    let actors = loyalty_actors(0.0, 0.2, 0.0);
    let config = SimConfig::default_test();
    let bank = RngBank::new(21, "LY");
    let (coverage, _) = GeographyAssigner::new(&actors, &config).initial(&mut bank.for_year(StreamSlot::Geography, 0));
    let evolver = RelationshipEvolver::new(&actors, &config);
    let mut ledger = RelationshipLedger::new();
    evolver.initialize(
        &mut ledger,
        &coverage,
        &mut bank.for_year(StreamSlot::FarmerEdges, 0),
        &mut bank.for_year(StreamSlot::ExporterEdges, 0),
    );
    assert_eq!(ledger.live_count(EdgeType::F2M), 2_000);
    ledger.finish_year();

    evolver.advance(
        &mut ledger,
        &coverage,
        1,
        &mut bank.for_year(StreamSlot::FarmerEdges, 1),
        &mut bank.for_year(StreamSlot::ExporterEdges, 1),
    );
    let rate = ended_this_year(&ledger, EdgeType::F2M) as f64 / 2_000.0;
    assert!((rate - 0.9).abs() < 0.03, "termination rate {rate}, expected about 0.9");
    // Every farmer that lost its buyer found a replacement.
    assert_eq!(ledger.live_count(EdgeType::F2M), 2_000);
}

#[test]
fn loyal_seasoned_pairs_never_end() {
    let sticky = loyalty_actors(1.0, 1.0, 1.0);
    // Farmer 0.8 with middleman 1.0, and middleman 1.0 with exporter 0.8, both average 0.9.
    let loyal = loyalty_actors(0.8, 1.0, 0.8);
    let config = SimConfig::default_test();
    let bank = RngBank::new(22, "LY");
    let (coverage, _) = GeographyAssigner::new(&sticky, &config).initial(&mut bank.for_year(StreamSlot::Geography, 0));
    let mut ledger = RelationshipLedger::new();

    let evolver = RelationshipEvolver::new(&sticky, &config);
    evolver.initialize(
        &mut ledger,
        &coverage,
        &mut bank.for_year(StreamSlot::FarmerEdges, 0),
        &mut bank.for_year(StreamSlot::ExporterEdges, 0),
    );
    ledger.finish_year();
    for year in 1..=5 {
        evolver.advance(
            &mut ledger,
            &coverage,
            year,
            &mut bank.for_year(StreamSlot::FarmerEdges, year),
            &mut bank.for_year(StreamSlot::ExporterEdges, year),
        );
        ledger.finish_year();
    }
    assert!(ledger.edges(EdgeType::F2M).iter().all(|e| e.years_active == 5));

    let evolver = RelationshipEvolver::new(&loyal, &config);
    evolver.advance(
        &mut ledger,
        &coverage,
        6,
        &mut bank.for_year(StreamSlot::FarmerEdges, 6),
        &mut bank.for_year(StreamSlot::ExporterEdges, 6),
    );
    assert_eq!(ended_this_year(&ledger, EdgeType::F2M), 0);
    assert_eq!(ended_this_year(&ledger, EdgeType::M2E), 0);
    assert_eq!(ledger.live_count(EdgeType::F2M), 2_000);
    assert!(ledger.edges(EdgeType::F2M).iter().all(|e| e.years_active == 6));
}

#[test]
fn continuation_probability_is_monotone_and_capped() {
    for base in [0.0, 0.2, 0.5, 0.65] {
        let mut last = 0.0;
        for age in 0..20 {
            let p = continuation_probability(base, age, 0.1, 0.3);
            assert!(p >= last, "base {base}: p dropped at age {age}");
            assert!(p <= (base + 0.3 + 1e-12).min(1.0));
            last = p;
        }
        assert!((last - (base + 0.3)).abs() < 1e-12);
    }
}

#[test]
fn fan_out_caps_hold_every_year() {
    let actors = cr_actors(5);
    let max_buyers = actors.assumptions.max_buyers_per_farmer as usize;
    let max_exporters = actors.assumptions.max_exporters_per_middleman as usize;

    evolve(&actors, 5, 8, |year, ledger, _| {
        let buyers = ledger.adjacency(EdgeType::F2M, actors.farmers.len());
        for f in 0..actors.farmers.len() as u32 {
            assert!(buyers.degree(f) <= max_buyers, "year {year}: farmer {f} has {}", buyers.degree(f));
            let mut partners = buyers.partners(f).to_vec();
            partners.sort_unstable();
            partners.dedup();
            assert_eq!(partners.len(), buyers.degree(f), "year {year}: duplicate buyer for farmer {f}");
        }
        let outlets = ledger.adjacency(EdgeType::M2E, actors.middlemen.len());
        for m in 0..actors.middlemen.len() as u32 {
            assert!(outlets.degree(m) <= max_exporters, "year {year}: middleman {m} has {}", outlets.degree(m));
        }
    });
}

#[test]
fn year_zero_connects_every_actor() {
    let actors = cr_actors(9);
    evolve(&actors, 9, 1, |_, ledger, coverage| {
        let buyers = ledger.adjacency(EdgeType::F2M, actors.farmers.len());
        let by_geo = coverage.middlemen_by_geography(actors.geographies.len());
        for (f, farmer) in actors.farmers.iter().enumerate() {
            let partners = buyers.partners(f as u32);
            assert!(!partners.is_empty(), "farmer {f} has no buyer");
            // Year-0 buyers come from the middlemen covering the farmer's geography.
            assert!(partners.iter().all(|m| by_geo[farmer.geography as usize].contains(m)));
        }
        let outlets = ledger.adjacency(EdgeType::M2E, actors.middlemen.len());
        for m in 0..actors.middlemen.len() as u32 {
            assert!(outlets.degree(m) >= 1, "middleman {m} has no exporter");
        }
        assert_eq!(ledger.live_count(EdgeType::M2G), coverage.pair_count());
        assert!(ledger.year_snapshot().iter().all(|e| e.state == EdgeState::Forming && e.start_year == 0));
    });
}

#[test]
fn edges_age_by_one_and_replacements_start_fresh() {
    let actors = cr_actors(12);
    let mut previous: HashMap<u64, (u32, EdgeState)> = HashMap::new();
    let mut terminated = 0usize;
    let mut replacements = 0usize;

    evolve(&actors, 12, 6, |year, ledger, _| {
        let snapshot = ledger.year_snapshot();
        for edge in &snapshot {
            match previous.get(&edge.id) {
                Some((age, _)) if edge.state == EdgeState::Terminated => {
                    assert_eq!(edge.end_year, Some(year));
                    assert_eq!(edge.years_active, *age);
                    terminated += 1;
                }
                Some((age, _)) => {
                    assert_eq!(edge.state, EdgeState::Active, "edge {} from an earlier year", edge.id);
                    assert_eq!(edge.years_active, age + 1, "edge {} aged wrongly", edge.id);
                }
                None => {
                    assert_eq!(edge.start_year, year);
                    assert_eq!(edge.years_active, 0);
                    assert_eq!(edge.state, EdgeState::Forming);
                    if year > 0 {
                        replacements += 1;
                    }
                }
            }
        }
        previous = snapshot
            .iter()
            .filter(|e| e.is_live())
            .map(|e| (e.id, (e.years_active, e.state)))
            .collect();
    });

    assert!(terminated > 0, "no edge ever terminated over six years");
    assert!(replacements > 0, "no replacement edge ever formed");
}

#[test]
fn edge_ids_are_unique_and_increasing() {
    let actors = cr_actors(2);
    let mut max_seen: Option<u64> = None;
    evolve(&actors, 2, 4, |_, ledger, _| {
        let snapshot = ledger.year_snapshot();
        let mut ids: Vec<u64> = snapshot.iter().map(|e| e.id).collect();
        let n = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), n, "duplicate edge id in one snapshot");
        let new_ids = snapshot.iter().filter(|e| e.years_active == 0 && e.state == EdgeState::Forming);
        if let Some(prev) = max_seen {
            assert!(new_ids.clone().all(|e| e.id > prev));
        }
        max_seen = snapshot.iter().map(|e| e.id).max().or(max_seen);
    });
}

#[test]
fn certain_continuation_keeps_every_edge() {
    let mut ledger = RelationshipLedger::new();
    for f in 0..4 {
        ledger.form(EdgeType::F2M, f, f % 2, 0);
    }
    ledger.finish_year();
    let mut rng = SubsystemRng::from_seed(1);
    for year in 1..=5 {
        ledger.promote();
        let dropped = ledger.continue_edges(EdgeType::F2M, year, &mut rng, |_| 1.0);
        assert!(dropped.is_empty());
        ledger.finish_year();
    }
    assert!(ledger.edges(EdgeType::F2M).iter().all(|e| e.years_active == 5));
}

#[test]
fn stored_snapshots_respect_caps() {
    let engine = build_engine("rel-store", SimConfig::default_test(), standard_set());
    engine.run(&ids(&["CR", "HN"]), 5, 31, false).unwrap();

    engine.with_store(|store| {
        for (country, max_buyers, max_exporters) in [("CR", 3, 2), ("HN", 3, 2)] {
            for year in 0..5 {
                let rows = store.relationships_for(country, year).unwrap();
                let mut live: BTreeMap<(&str, &str), usize> = BTreeMap::new();
                for row in rows.iter().filter(|r| r.state != "terminated") {
                    *live.entry((row.edge_type.as_str(), row.source_id.as_str())).or_default() += 1;
                }
                for ((edge_type, source), n) in live {
                    match edge_type {
                        "F2M" => assert!(n <= max_buyers, "{country} {year}: {source} has {n} buyers"),
                        "M2E" => assert!(n <= max_exporters, "{country} {year}: {source} has {n} exporters"),
                        _ => {}
                    }
                }
                for row in rows.iter().filter(|r| r.state == "terminated") {
                    assert_eq!(row.end_year, Some(year));
                }
            }
        }
    });
}
