//! Engine-level behaviour: bootstrap, failure isolation, resume, wipe,
//! cancellation, events and export.

mod common;

use coffee_chain_core::{
    config::{EuPreferenceDistribution, SimConfig},
    engine::SimEngine,
    error::SimError,
    report::CountryOutcome,
    store::SimStore,
};
use common::{assumption_set, build_engine, costa_rica, country, geography, ids, migrated_store, standard_set};

#[test]
fn year_zero_bootstrap_connects_every_farmer() {
    let mut c = country("BT", 5, 3);
    c.max_buyers_per_farmer = 3;
    let set = assumption_set(vec![(c, vec![geography("BT", "BT-G1", "BT-R1", 100, 1_000.0)])]);
    let engine = build_engine("bootstrap", SimConfig::default_test(), set);
    let report = engine.run(&ids(&["BT"]), 1, 2024, false).unwrap();

    let bt = report.country("BT").unwrap();
    assert_eq!(bt.outcome, CountryOutcome::Succeeded);
    assert_eq!(bt.counters.farmers, 100);
    assert_eq!(bt.counters.under_connected, 0);
    assert!((bt.counters.total_volume_kg - 100_000.0).abs() < 1e-6 * 100_000.0);

    engine.with_store(|store| {
        let rows = store.relationships_for("BT", 0).unwrap();
        for f in 0..100 {
            let farmer_id = format!("BT-G1_F{f:06}");
            let n = rows.iter().filter(|r| r.edge_type == "F2M" && r.source_id == farmer_id).count();
            assert!((1..=3).contains(&n), "{farmer_id} has {n} buyers");
        }
        let counts = store.actor_counts("BT").unwrap();
        assert_eq!((counts.geographies, counts.farmers, counts.middlemen, counts.exporters), (1, 100, 5, 3));
        assert!((store.total_production_kg("BT").unwrap() - 100_000.0).abs() < 1e-6);
    });
}

#[test]
fn bad_country_does_not_affect_its_sibling() {
    let mut set = standard_set();
    set.insert_country(country("XX", 0, 2));
    set.insert_geography(geography("XX", "XX-G1", "XX-R1", 10, 100.0));
    let engine = build_engine("isolation", SimConfig::default_test(), set);
    let report = engine.run(&ids(&["CR", "XX", "ZZ"]), 2, 9, false).unwrap();

    assert!(report.country("CR").unwrap().outcome.is_success());
    assert!(matches!(report.country("XX").unwrap().outcome, CountryOutcome::Failed { .. }));
    assert!(matches!(report.country("ZZ").unwrap().outcome, CountryOutcome::Failed { .. }));
    assert_eq!(report.failed(), 2);

    // The sibling's output is the same as when it runs alone.
    let alone = build_engine("isolation-alone", SimConfig::default_test(), standard_set());
    alone.run(&ids(&["CR"]), 2, 9, false).unwrap();
    for year in 0..2 {
        let mixed = engine.with_store(|s| s.flows_for("CR", year).unwrap());
        let solo = alone.with_store(|s| s.flows_for("CR", year).unwrap());
        assert_eq!(mixed, solo);
    }
    assert_eq!(engine.with_store(|s| s.flow_count("XX").unwrap()), 0);
}

#[test]
fn resumed_run_equals_fresh_run() {
    let fresh = build_engine("fresh", SimConfig::default_test(), standard_set());
    fresh.run(&ids(&["CR", "HN"]), 4, 55, false).unwrap();

    let first = build_engine("resume-1", SimConfig::default_test(), standard_set());
    first.run(&ids(&["CR", "HN"]), 2, 55, false).unwrap();
    let store = first.into_store();
    let second = SimEngine::new("resume-2".into(), SimConfig::default_test(), standard_set(), store);
    let report = second.run(&ids(&["CR", "HN"]), 4, 55, false).unwrap();

    let cr = report.country("CR").unwrap();
    assert_eq!(cr.years_replayed, vec![0, 1]);
    assert_eq!(cr.years_written, vec![2, 3]);

    for country_id in ["CR", "HN"] {
        for year in 0..4 {
            let a = fresh.with_store(|s| (s.relationships_for(country_id, year).unwrap(), s.flows_for(country_id, year).unwrap()));
            let b = second.with_store(|s| (s.relationships_for(country_id, year).unwrap(), s.flows_for(country_id, year).unwrap()));
            assert_eq!(a, b, "{country_id} year {year} differs after resume");
        }
    }
}

#[test]
fn rerun_without_wipe_writes_nothing_new() {
    let engine = build_engine("rerun", SimConfig::default_test(), standard_set());
    engine.run(&ids(&["HN"]), 3, 1, false).unwrap();
    let before = engine.with_store(|s| s.flow_count("HN").unwrap());
    let report = engine.run(&ids(&["HN"]), 3, 1, false);
    // Same run id cannot be inserted twice.
    assert!(report.is_err());

    let store = engine.into_store();
    let again = SimEngine::new("rerun-2".into(), SimConfig::default_test(), standard_set(), store);
    let report = again.run(&ids(&["HN"]), 3, 1, false).unwrap();
    let hn = report.country("HN").unwrap();
    assert!(hn.years_written.is_empty());
    assert_eq!(hn.years_replayed, vec![0, 1, 2]);
    assert_eq!(again.with_store(|s| s.flow_count("HN").unwrap()), before);
}

#[test]
fn foreign_seed_requires_wipe() {
    let first = build_engine("seed-a", SimConfig::default_test(), standard_set());
    first.run(&ids(&["HN"]), 2, 1, false).unwrap();
    let store = first.into_store();

    let second = SimEngine::new("seed-b".into(), SimConfig::default_test(), standard_set(), store);
    let report = second.run(&ids(&["HN"]), 2, 2, false).unwrap();
    match &report.country("HN").unwrap().outcome {
        CountryOutcome::Failed { reason } => assert!(reason.contains("seed"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }

    let store = second.into_store();
    let third = SimEngine::new("seed-c".into(), SimConfig::default_test(), standard_set(), store);
    let report = third.run(&ids(&["HN"]), 2, 2, true).unwrap();
    let hn = report.country("HN").unwrap();
    assert!(hn.outcome.is_success());
    assert_eq!(hn.years_written, vec![0, 1]);

    let reference = build_engine("seed-ref", SimConfig::default_test(), standard_set());
    reference.run(&ids(&["HN"]), 2, 2, false).unwrap();
    for year in 0..2 {
        assert_eq!(
            third.with_store(|s| s.flows_for("HN", year).unwrap()),
            reference.with_store(|s| s.flows_for("HN", year).unwrap())
        );
    }
}

#[test]
fn zero_years_is_an_invalid_run() {
    let engine = build_engine("zero-years", SimConfig::default_test(), standard_set());
    let err = engine.run(&ids(&["CR"]), 0, 1, false).unwrap_err();
    assert!(matches!(err, SimError::InvalidRun(_)));
    assert!(err.aborts_run());
}

#[test]
fn bad_random_source_aborts_the_whole_run() {
    let config = SimConfig {
        eu_preference: EuPreferenceDistribution::Beta { alpha: -1.0, beta: 2.0 },
        ..SimConfig::default_test()
    };
    let engine = build_engine("bad-rng", config, standard_set());
    let err = engine.run(&ids(&["CR", "HN"]), 2, 1, false).unwrap_err();
    assert!(matches!(err, SimError::RandomSource(_)));
    assert!(engine.with_store(|s| s.stored_countries().unwrap()).is_empty());
}

#[test]
fn cancelled_country_stops_and_sibling_finishes() {
    let engine = build_engine("cancel", SimConfig::default_test(), standard_set());
    engine.cancel_token().cancel_country("HN");
    let report = engine.run(&ids(&["CR", "HN"]), 3, 4, false).unwrap();

    assert_eq!(report.country("HN").unwrap().outcome, CountryOutcome::Cancelled);
    assert!(report.country("HN").unwrap().years_written.is_empty());
    assert!(report.country("CR").unwrap().outcome.is_success());
    assert_eq!(report.country("CR").unwrap().years_written, vec![0, 1, 2]);
    assert_eq!(engine.with_store(|s| s.completed_partitions("HN").unwrap()).len(), 0);
}

#[test]
fn events_record_the_country_lifecycle() {
    let engine = build_engine("events", SimConfig::default_test(), standard_set());
    engine.run(&ids(&["CR", "HN"]), 2, 6, false).unwrap();

    let events = engine.with_store(|s| s.events_for_run("events").unwrap());
    let count = |t: &str| events.iter().filter(|e| e.event_type == t).count();
    assert_eq!(count("run_started"), 1);
    assert_eq!(count("country_started"), 2);
    assert_eq!(count("year_written"), 4);
    assert_eq!(count("country_completed"), 2);
    for entry in &events {
        let event = entry.event().unwrap();
        assert_eq!(event.event_type(), entry.event_type);
    }
}

#[test]
fn partitions_are_marked_complete_per_year() {
    let engine = build_engine("partitions", SimConfig::default_test(), standard_set());
    engine.run(&ids(&["CR"]), 3, 10, false).unwrap();
    let partitions = engine.with_store(|s| s.completed_partitions("CR").unwrap());
    assert_eq!(partitions.iter().map(|p| p.year).collect::<Vec<_>>(), vec![0, 1, 2]);
    for p in &partitions {
        assert_eq!(p.seed, 10);
        assert_eq!(p.run_id, "partitions");
        let stored = engine.with_store(|s| s.flows_for("CR", p.year).unwrap().len() as u64);
        assert_eq!(p.flows, stored);
    }
}

#[test]
fn flows_export_to_csv() {
    let engine = build_engine("export", SimConfig::default_test(), assumption_set(vec![costa_rica()]));
    engine.run(&ids(&["CR"]), 2, 3, false).unwrap();

    let path = std::env::temp_dir().join(format!("coffee-chain-export-{}.csv", std::process::id()));
    let written = engine.with_store(|s| s.export_flows_csv(&path, Some("CR")).unwrap());
    let expected = engine.with_store(|s| s.flow_count("CR").unwrap());
    assert_eq!(written, expected);

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(headers.get(0), Some("country_id"));
    assert_eq!(headers.get(7), Some("sold_to_eu"));
    let rows: Vec<coffee_chain_core::store::FlowRow> = reader.deserialize().collect::<Result<_, _>>().unwrap();
    assert_eq!(rows.len() as u64, expected);
    assert_eq!(rows[0], engine.with_store(|s| s.flows_for("CR", 0).unwrap()[0].clone()));
    std::fs::remove_file(&path).ok();
}

#[test]
fn file_store_reopens_with_completed_partitions() {
    let path = std::env::temp_dir().join(format!("coffee-chain-reopen-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let path_str = path.to_string_lossy().to_string();

    let store = SimStore::open(&path_str).unwrap();
    store.migrate().unwrap();
    let engine = SimEngine::new("file-1".into(), SimConfig::default_test(), standard_set(), store);
    engine.run(&ids(&["HN"]), 2, 12, false).unwrap();
    let reopened = engine.with_store(|s| s.reopen().unwrap());
    assert_eq!(reopened.completed_partitions("HN").unwrap().len(), 2);
    drop(engine);
    drop(reopened);
    let _ = std::fs::remove_file(&path);

    // In-memory stores reopen empty.
    let memory = migrated_store();
    let fresh = memory.reopen().unwrap();
    fresh.migrate().unwrap();
    assert!(fresh.stored_countries().unwrap().is_empty());
}
