//! The simulation engine: runs every requested country over N years.
//!
//! RULES:
//!   - Countries are fully isolated: own actors, own ledger, own RNG streams.
//!   - Countries run in parallel on a bounded worker pool.
//!   - Years inside a country run strictly in order.
//!   - The store is the only shared state; its lock is taken only at year
//!     boundaries.
//!   - All randomness flows through the RngBank of each country.

use crate::{
    config::{AssumptionSet, SimConfig},
    country::{run_country, RunContext},
    error::{SimError, SimResult},
    event::{EventLogEntry, SimEvent},
    report::RunReport,
    store::PartitionStore,
    types::{CountryId, RunId},
};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Cooperative cancellation, checked by each country at year boundaries.
/// Cloning shares the same underlying flag set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    all:       AtomicBool,
    countries: Mutex<BTreeSet<CountryId>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_all(&self) {
        self.inner.all.store(true, Ordering::SeqCst);
    }

    pub fn cancel_country(&self, country_id: &str) {
        self.inner
            .countries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(country_id.to_string());
    }

    pub fn is_cancelled(&self, country_id: &str) -> bool {
        self.inner.all.load(Ordering::SeqCst)
            || self
                .inner
                .countries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(country_id)
    }
}

pub struct SimEngine<S: PartitionStore> {
    pub run_id:  RunId,
    config:      SimConfig,
    assumptions: AssumptionSet,
    store:       Mutex<S>,
    cancel:      CancelToken,
}

impl<S: PartitionStore> SimEngine<S> {
    pub fn new(run_id: RunId, config: SimConfig, assumptions: AssumptionSet, store: S) -> Self {
        Self {
            run_id,
            config,
            assumptions,
            store: Mutex::new(store),
            cancel: CancelToken::new(),
        }
    }

    /// Handle for cancelling this engine's runs from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Run `year_count` years for each of `countries`.
    ///
    /// Invalid run parameters abort before any country starts. A misconfigured
    /// random source inside any country aborts the whole run and stops its
    /// siblings at their next year boundary. Other failures are contained to
    /// the country that raised them and reported in its outcome.
    pub fn run(
        &self,
        countries: &[CountryId],
        year_count: u32,
        seed: u64,
        wipe_existing: bool,
    ) -> SimResult<RunReport> {
        if year_count == 0 {
            return Err(SimError::InvalidRun("year_count must be at least 1".to_string()));
        }
        self.config.validate()?;

        let countries: Vec<CountryId> = countries
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.worker_threads)
            .thread_name(|i| format!("country-worker-{i}"))
            .build()
            .map_err(|e| SimError::InvalidRun(format!("worker pool: {e}")))?;

        let aborted = AtomicBool::new(false);
        let ctx = RunContext {
            run_id: &self.run_id,
            seed,
            year_count,
            wipe_existing,
            config: &self.config,
            store: &self.store,
            cancel: &self.cancel,
            aborted: &aborted,
        };

        ctx.with_store(|s| s.insert_run(&self.run_id, seed, year_count))?;
        let started = SimEvent::RunStarted {
            run_id: self.run_id.clone(),
            seed,
            year_count,
            countries: countries.len(),
        };
        let entry = EventLogEntry::new(&self.run_id, "engine", &started)?;
        ctx.with_store(|s| s.append_event(&entry))?;

        log::info!(
            "run={} engine: {} countries × {year_count} years, seed={seed}, workers={}",
            self.run_id,
            countries.len(),
            pool.current_num_threads()
        );

        let reports = pool.install(|| {
            countries
                .par_iter()
                .map(|country_id| run_country(&ctx, self.assumptions.country_inputs(country_id), country_id))
                .collect::<SimResult<Vec<_>>>()
        })?;

        let report = RunReport {
            run_id: self.run_id.clone(),
            seed,
            year_count,
            countries: reports.into_iter().map(|r| (r.country_id.clone(), r)).collect(),
        };
        log::info!(
            "run={} engine: finished, {} succeeded, {} failed",
            self.run_id,
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }

    /// Run a closure against the store, e.g. to query results after a run.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        let mut guard = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn into_store(self) -> S {
        self.store.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}
