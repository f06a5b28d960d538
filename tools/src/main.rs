//! chain-runner: headless runner for the coffee trade network simulation.
//!
//! Usage:
//!   chain-runner --seed 12345 --years 5 --db chain.db --data-dir ./data
//!   chain-runner --seed 12345 --years 5 --countries CR,HN --wipe --export flows.csv

use anyhow::{Context, Result};
use coffee_chain_core::{
    config::{AssumptionSet, SimConfig},
    engine::SimEngine,
    report::{CountryOutcome, RunReport},
    store::SimStore,
    types::CountryId,
};
use std::env;
use std::path::Path;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let years = parse_arg(&args, "--years", 5u32);
    let wipe = args.iter().any(|a| a == "--wipe");
    let json = args.iter().any(|a| a == "--json");
    let db = string_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = string_arg(&args, "--data-dir").unwrap_or("./data");
    let export = string_arg(&args, "--export");

    let config = SimConfig::load(data_dir)?;
    let assumptions = AssumptionSet::load(data_dir)
        .with_context(|| format!("loading assumptions from {data_dir}"))?;
    let countries: Vec<CountryId> = match string_arg(&args, "--countries") {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect(),
        None => assumptions.country_ids(),
    };

    if !json {
        println!("Coffee trade network: chain-runner");
        println!("  seed:      {seed}");
        println!("  years:     {years}");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!("  countries: {}", countries.join(","));
        println!();
    }

    let store = SimStore::open(db)?;
    store.migrate()?;

    let run_id = format!("run-{seed}-{}", uuid::Uuid::new_v4().simple());
    let engine = SimEngine::new(run_id, config, assumptions, store);
    let report = engine.run(&countries, years, seed, wipe)?;
    let store = engine.into_store();

    if let Some(path) = export {
        let rows = store.export_flows_csv(Path::new(path), None)?;
        log::info!("chain-runner: wrote {rows} flow rows to {path}");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&store, &report)?;
    }

    if report.failed() > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(store: &SimStore, report: &RunReport) -> Result<()> {
    let totals = report.totals();
    println!("=== RUN SUMMARY ===");
    println!("  run_id:        {}", report.run_id);
    println!("  countries:     {} ok / {} failed", report.succeeded(), report.failed());
    println!("  farmers:       {}", totals.farmers);
    println!("  middlemen:     {}", totals.middlemen);
    println!("  exporters:     {}", totals.exporters);
    println!("  flows:         {}", totals.flows);
    println!("  volume (kg):   {:.0}", totals.total_volume_kg);
    println!("  eu share:      {:.3}", totals.eu_share());

    println!();
    println!("=== COUNTRIES ===");
    for (country_id, c) in &report.countries {
        match &c.outcome {
            CountryOutcome::Succeeded => {
                let last_year = report.year_count - 1;
                let summary = store.year_summary(country_id, last_year)?;
                println!(
                    "  {country_id} | years written {} | edges +{} -{} | shortfalls {} | under-connected {} | \
                     year {last_year}: {} flows, eu {:.3}, {:.2} middlemen/farmer, {:.2} exporters/middleman",
                    c.years_written.len(),
                    c.counters.edges_formed,
                    c.counters.edges_terminated,
                    c.counters.coverage_shortfalls,
                    c.counters.under_connected,
                    summary.flows,
                    summary.eu_ratio,
                    summary.avg_middlemen_per_farmer,
                    summary.avg_exporters_per_middleman,
                );
            }
            CountryOutcome::Failed { reason } => println!("  {country_id} | FAILED: {reason}"),
            CountryOutcome::Cancelled => println!("  {country_id} | cancelled"),
        }
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}
