//! Shared builders for integration tests: small synthetic countries and
//! engines backed by in-memory stores.
#![allow(dead_code)]

use coffee_chain_core::{
    config::{AssumptionSet, CountryAssumptions, GeographyRecord, SimConfig},
    engine::SimEngine,
    store::SimStore,
};

pub fn country(id: &str, n_middlemen: u32, n_exporters: u32) -> CountryAssumptions {
    CountryAssumptions {
        country_id: id.to_string(),
        n_middlemen,
        n_exporters,
        eu_target_kg: 50_000.0,
        loyalty_base: 0.5,
        switch_rate: 0.1,
        geography_change_rate: 0.1,
        max_buyers_per_farmer: 3,
        max_exporters_per_middleman: 2,
    }
}

/// Arabica-only geography with `farmers` farmers averaging `mean_kg`.
pub fn geography(country_id: &str, geo_id: &str, region_id: &str, farmers: u32, mean_kg: f64) -> GeographyRecord {
    GeographyRecord {
        geo_id: geo_id.to_string(),
        country_id: country_id.to_string(),
        region_id: region_id.to_string(),
        est_farmers: farmers as f64,
        production_arabica_kg: farmers as f64 * mean_kg,
        production_robusta_kg: 0.0,
        primary_crop: None,
        centroid_lat: None,
        centroid_lon: None,
    }
}

/// Two regions, five geographies, 200 farmers.
pub fn costa_rica() -> (CountryAssumptions, Vec<GeographyRecord>) {
    let geos = vec![
        geography("CR", "CR-G1", "CR-R1", 40, 1_000.0),
        geography("CR", "CR-G2", "CR-R1", 60, 1_200.0),
        geography("CR", "CR-G3", "CR-R1", 30, 800.0),
        geography("CR", "CR-G4", "CR-R2", 50, 1_500.0),
        geography("CR", "CR-G5", "CR-R2", 20, 900.0),
    ];
    (country("CR", 20, 5), geos)
}

/// One region, two geographies, 120 farmers.
pub fn honduras() -> (CountryAssumptions, Vec<GeographyRecord>) {
    let geos = vec![
        geography("HN", "HN-G1", "HN-R1", 80, 700.0),
        geography("HN", "HN-G2", "HN-R1", 40, 1_100.0),
    ];
    (country("HN", 8, 3), geos)
}

pub fn assumption_set(countries: Vec<(CountryAssumptions, Vec<GeographyRecord>)>) -> AssumptionSet {
    let mut set = AssumptionSet::new();
    for (country, geos) in countries {
        set.insert_country(country);
        for g in geos {
            set.insert_geography(g);
        }
    }
    set
}

pub fn standard_set() -> AssumptionSet {
    assumption_set(vec![costa_rica(), honduras()])
}

pub fn migrated_store() -> SimStore {
    let store = SimStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    store
}

/// Route `log` output through the test harness; `RUST_LOG=debug` shows it.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn build_engine(run_id: &str, config: SimConfig, set: AssumptionSet) -> SimEngine<SimStore> {
    init_logging();
    SimEngine::new(run_id.to_string(), config, set, migrated_store())
}

pub fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
