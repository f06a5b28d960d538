//! One country's simulation from actor generation to its last year.
//!
//! YEAR ORDER (fixed, never reordered):
//!   year 0:  actors → geography (initial) → relationships (init) → trade flows
//!   year y:  relationships (advance) → geography (reassign) → trade flows
//!
//! Every year ends with exactly one partition write, or a replay of an
//! already completed partition when resuming.

use crate::{
    actors::{ActorFactory, CountryActors},
    config::{CountryInputs, SimConfig},
    engine::CancelToken,
    error::{SimError, SimResult},
    event::{EventLogEntry, SimEvent},
    geography::{Coverage, GeographyAssigner},
    relationships::{RelationshipEvolver, RelationshipLedger},
    report::{CountryOutcome, CountryReport},
    rng::{RngBank, StreamSlot},
    store::{PartitionStore, YearBatch},
    trade::TradeFlowGenerator,
    types::{ActorIdx, ActorKind, EdgeType, Year},
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Shared, read-only context of one run.
pub(crate) struct RunContext<'a, S: PartitionStore> {
    pub run_id:        &'a str,
    pub seed:          u64,
    pub year_count:    u32,
    pub wipe_existing: bool,
    pub config:        &'a SimConfig,
    pub store:         &'a Mutex<S>,
    pub cancel:        &'a CancelToken,
    /// Raised by the first country whose error aborts the run.
    pub aborted:       &'a AtomicBool,
}

impl<S: PartitionStore> RunContext<'_, S> {
    /// Take the store lock for one operation. Held only at year boundaries.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut S) -> SimResult<T>) -> SimResult<T> {
        let mut guard = self
            .store
            .lock()
            .map_err(|_| SimError::Other(anyhow::anyhow!("store mutex poisoned")))?;
        f(&mut guard)
    }

    pub fn emit(&self, event: SimEvent) -> SimResult<()> {
        let entry = EventLogEntry::new(self.run_id, "engine", &event)?;
        self.with_store(|s| s.append_event(&entry))
    }
}

enum Finish {
    Completed,
    Cancelled { last_full_year: Option<Year> },
}

/// Run one country and fold any error into its report. Errors that
/// abort the run are recorded, stop sibling countries and are returned.
pub(crate) fn run_country<S: PartitionStore>(
    ctx: &RunContext<'_, S>,
    inputs: SimResult<CountryInputs>,
    country_id: &str,
) -> SimResult<CountryReport> {
    let mut report = CountryReport::new(country_id);
    let result = inputs.and_then(|inputs| simulate(ctx, &inputs, &mut report));

    match result {
        Ok(Finish::Completed) => {
            log::info!(
                "country={country_id} engine: completed, {} years written, {} replayed",
                report.years_written.len(),
                report.years_replayed.len()
            );
            let event = SimEvent::CountryCompleted {
                country_id:    country_id.to_string(),
                years_written: report.years_written.len() as u32,
            };
            if let Err(e) = ctx.emit(event) {
                report.outcome = CountryOutcome::Failed { reason: e.to_string() };
            }
        }
        Ok(Finish::Cancelled { last_full_year }) => {
            log::info!("country={country_id} engine: cancelled after year {last_full_year:?}");
            report.outcome = CountryOutcome::Cancelled;
            let event = SimEvent::CountryCancelled {
                country_id: country_id.to_string(),
                last_full_year,
            };
            if let Err(e) = ctx.emit(event) {
                log::warn!("country={country_id} engine: could not record cancellation: {e}");
            }
        }
        Err(e) => {
            log::warn!("country={country_id} engine: failed: {e}");
            report.outcome = CountryOutcome::Failed { reason: e.to_string() };
            let event = SimEvent::CountryFailed {
                country_id: country_id.to_string(),
                reason:     e.to_string(),
            };
            if let Err(e) = ctx.emit(event) {
                log::warn!("country={country_id} engine: could not record failure: {e}");
            }
            if e.aborts_run() {
                log::error!("country={country_id} engine: aborting run: {e}");
                ctx.aborted.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
    }
    Ok(report)
}

fn simulate<S: PartitionStore>(
    ctx: &RunContext<'_, S>,
    inputs: &CountryInputs,
    report: &mut CountryReport,
) -> SimResult<Finish> {
    let country_id = inputs.assumptions.country_id.as_str();

    if ctx.wipe_existing {
        ctx.with_store(|s| s.wipe_country(country_id))?;
    }
    let completed = completed_years(ctx, country_id)?;

    let bank = RngBank::new(ctx.seed, country_id);
    let actors = ActorFactory::new(ctx.config).generate(inputs, &mut bank.for_year(StreamSlot::Actors, 0))?;
    report.counters.farmers = actors.total_farmers();
    report.counters.middlemen = actors.middlemen.len() as u64;
    report.counters.exporters = actors.exporters.len() as u64;
    ctx.emit(SimEvent::CountryStarted {
        country_id: country_id.to_string(),
        farmers:    actors.total_farmers(),
        middlemen:  actors.middlemen.len() as u32,
        exporters:  actors.exporters.len() as u32,
    })?;

    let assigner = GeographyAssigner::new(&actors, ctx.config);
    let evolver = RelationshipEvolver::new(&actors, ctx.config);
    let generator = TradeFlowGenerator::new(&actors, ctx.config);
    let mut ledger = RelationshipLedger::new();
    let mut coverage = Coverage::empty(actors.middlemen.len());
    let mut last_full_year = None;

    for year in 0..ctx.year_count {
        if ctx.cancel.is_cancelled(country_id) || ctx.aborted.load(Ordering::SeqCst) {
            return Ok(Finish::Cancelled { last_full_year });
        }

        let mut geo_rng = bank.for_year(StreamSlot::Geography, year);
        let mut farmer_edge_rng = bank.for_year(StreamSlot::FarmerEdges, year);
        let mut exporter_edge_rng = bank.for_year(StreamSlot::ExporterEdges, year);

        let (stats, shortfalls) = if year == 0 {
            let (initial, shortfalls) = assigner.initial(&mut geo_rng);
            coverage = initial;
            let stats = evolver.initialize(&mut ledger, &coverage, &mut farmer_edge_rng, &mut exporter_edge_rng);
            (stats, shortfalls)
        } else {
            let mut stats =
                evolver.advance(&mut ledger, &coverage, year, &mut farmer_edge_rng, &mut exporter_edge_rng);
            let (next, shortfalls) = assigner.reassign(&coverage, &mut geo_rng);
            coverage = next;
            stats.merge(evolver.apply_coverage(&mut ledger, &coverage, year));
            (stats, shortfalls)
        };

        let flows = generator.generate(
            &ledger,
            year,
            &mut bank.for_year(StreamSlot::MiddlemanSplits, year),
            &bank.for_year(StreamSlot::FarmerFlows, year),
        )?;

        let under_connected: BTreeSet<(ActorKind, ActorIdx)> = stats
            .under_connected
            .iter()
            .copied()
            .chain(flows.unrouted.iter().map(|f| (ActorKind::Farmer, *f)))
            .collect();

        let counters = &mut report.counters;
        counters.edges_formed += stats.formed;
        counters.edges_terminated += stats.terminated;
        counters.flows += flows.flows.len() as u64;
        counters.total_volume_kg += flows.total_volume_kg;
        counters.eu_volume_kg += flows.eu_volume_kg;
        counters.coverage_shortfalls += shortfalls.len() as u64;
        counters.under_connected += under_connected.len() as u64;

        if completed.contains(&year) {
            log::debug!("country={country_id} year={year} engine: partition complete, replayed");
            ctx.emit(SimEvent::YearReplayed {
                country_id: country_id.to_string(),
                year,
            })?;
            report.years_replayed.push(year);
        } else {
            let flow_count = flows.flows.len() as u64;
            let (total_volume_kg, eu_share) = (flows.total_volume_kg, flows.eu_share());
            let batch = YearBatch {
                actors: &actors,
                year,
                seed: ctx.seed,
                edges: ledger.year_snapshot(),
                flows: flows.flows,
                under_connected: under_connected.into_iter().collect(),
                shortfalls,
            };
            write_year(ctx, &batch)?;
            ctx.emit(SimEvent::YearWritten {
                country_id: country_id.to_string(),
                year,
                flows: flow_count,
                edges: batch.edges.len() as u64,
                total_volume_kg,
                eu_share,
            })?;
            report.years_written.push(year);
        }

        ledger.finish_year();
        last_full_year = Some(year);
        log::info!(
            "country={country_id} year={year} engine: done ({} live F2M edges)",
            ledger.live_count(EdgeType::F2M)
        );
    }

    Ok(Finish::Completed)
}

/// Completed years of this country. Partitions left by a different seed
/// cannot be resumed from and require a wipe.
fn completed_years<S: PartitionStore>(ctx: &RunContext<'_, S>, country_id: &str) -> SimResult<BTreeSet<Year>> {
    let partitions = ctx.with_store(|s| s.completed_partitions(country_id))?;
    if let Some(foreign) = partitions.iter().find(|p| p.seed != ctx.seed) {
        return Err(SimError::data_integrity(
            country_id,
            format!(
                "stored partitions were produced with seed {} (this run uses {}); rerun with wipe",
                foreign.seed, ctx.seed
            ),
        ));
    }
    if !partitions.is_empty() {
        log::info!(
            "country={country_id} engine: resuming, {} partitions already complete",
            partitions.len()
        );
    }
    Ok(partitions.into_iter().map(|p| p.year).collect())
}

fn write_year<S: PartitionStore>(ctx: &RunContext<'_, S>, batch: &YearBatch<'_>) -> SimResult<()> {
    for shortfall in &batch.shortfalls {
        ctx.emit(SimEvent::CoverageShortfall {
            country_id: batch.country_id().to_string(),
            year:       batch.year,
            shortfall:  shortfall.clone(),
        })?;
    }
    ctx.with_store(|s| s.write_partition(ctx.run_id, batch))
        .map_err(|e| match e {
            SimError::PartitionWrite { .. } => e,
            other => SimError::PartitionWrite {
                country: batch.country_id().to_string(),
                year:    batch.year,
                reason:  other.to_string(),
            },
        })
}

/// Actors of a country as the engine would generate them, without running
/// any year. Used by tooling and tests to inspect generated populations.
pub fn generate_actors(config: &SimConfig, inputs: &CountryInputs, seed: u64) -> SimResult<CountryActors> {
    let bank = RngBank::new(seed, &inputs.assumptions.country_id);
    ActorFactory::new(config).generate(inputs, &mut bank.for_year(StreamSlot::Actors, 0))
}
