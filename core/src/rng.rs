//! Deterministic random number generation.
//!
//! RULE: Nothing in the simulation may call any platform RNG.
//! All randomness flows through SubsystemRng instances derived
//! from the master seed of the run.
//!
//! Every stream is keyed by (master_seed, country_id, year, slot), so:
//!   - Countries never share a stream and can run on any thread in any order.
//!   - Adding a new slot never changes existing streams.
//!   - A year can be replayed in isolation from its key alone.

use crate::{
    error::{SimError, SimResult},
    types::Year,
};
use rand::distributions::WeightedIndex;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Distribution, Exp1, LogNormal};
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG for one (country, year, slot) stream.
pub struct SubsystemRng {
    pub name: &'static str,
    seed: u64,
    inner: Pcg64Mcg,
}

impl SubsystemRng {
    /// Create a stream directly from an already-mixed seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            name: "unnamed",
            seed,
            inner: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Child stream for one entity of this stream (e.g. one farmer).
    /// Independent of how many draws the parent has already made.
    pub fn fork(&self, index: u64) -> SubsystemRng {
        SubsystemRng::from_seed(mix(self.seed, index.wrapping_add(1))).with_name(self.name)
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    /// Roll a u64 in [0, n).
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        assert!(n > 0, "n must be > 0");
        self.inner.gen_range(0..n)
    }

    /// Pick an index in [0, len) uniformly.
    pub fn pick_index(&mut self, len: usize) -> usize {
        self.next_u64_below(len as u64) as usize
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Uniform float in [low, high).
    pub fn uniform(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64()
    }

    /// Draw from LogNormal(mu, sigma) on the natural-log scale.
    pub fn lognormal(&mut self, mu: f64, sigma: f64) -> SimResult<f64> {
        let dist = LogNormal::new(mu, sigma).map_err(|e| {
            SimError::RandomSource(format!("lognormal(mu={mu}, sigma={sigma}): {e}"))
        })?;
        Ok(dist.sample(&mut self.inner))
    }

    /// Draw from Beta(alpha, beta).
    pub fn beta(&mut self, alpha: f64, beta: f64) -> SimResult<f64> {
        let dist = Beta::new(alpha, beta).map_err(|e| {
            SimError::RandomSource(format!("beta(alpha={alpha}, beta={beta}): {e}"))
        })?;
        Ok(dist.sample(&mut self.inner))
    }

    /// Index drawn with probability proportional to its weight.
    /// Falls back to a uniform draw when no weight is positive.
    pub fn weighted_index(&mut self, weights: &[f64]) -> usize {
        match WeightedIndex::<f64>::new(weights) {
            Ok(dist) => dist.sample(&mut self.inner),
            Err(_) => self.pick_index(weights.len()),
        }
    }

    /// Up to `amount` distinct items, drawn proportional to `weights`
    /// without replacement. Unusable weights fall back to a uniform draw.
    pub fn choose_weighted<T: Copy>(&mut self, items: &[T], weights: &[f64], amount: usize) -> Vec<T> {
        let positions: Vec<usize> = (0..items.len()).collect();
        match positions.choose_multiple_weighted(&mut self.inner, amount, |i| weights[*i]) {
            Ok(chosen) => chosen.map(|i| items[*i]).collect(),
            Err(_) => positions
                .choose_multiple(&mut self.inner, amount)
                .map(|i| items[*i])
                .collect(),
        }
    }

    /// Sample a point from the uniform simplex: Dirichlet(1, ..., 1) with k components.
    /// Built from normalized Exp(1) draws, which are Gamma(1, 1).
    pub fn dirichlet_uniform(&mut self, k: usize) -> Vec<f64> {
        if k == 0 {
            return Vec::new();
        }
        if k == 1 {
            return vec![1.0];
        }
        let mut draws: Vec<f64> = (0..k).map(|_| -> f64 { Exp1.sample(&mut self.inner) }).collect();
        let total: f64 = draws.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return vec![1.0 / k as f64; k];
        }
        for d in &mut draws {
            *d /= total;
        }
        draws
    }
}

/// Source of all per-country streams for a single run.
#[derive(Debug, Clone)]
pub struct RngBank {
    master_seed: u64,
    country_key: u64,
}

impl RngBank {
    pub fn new(master_seed: u64, country_id: &str) -> Self {
        Self {
            master_seed,
            country_key: stable_hash(country_id),
        }
    }

    /// Stream for one slot in one year of this bank's country.
    pub fn for_year(&self, slot: StreamSlot, year: Year) -> SubsystemRng {
        let seed = mix(
            mix(mix(self.master_seed, self.country_key), year as u64),
            slot as u64,
        );
        SubsystemRng::from_seed(seed).with_name(slot.name())
    }
}

/// Stable stream slot assignments.
/// NEVER reorder or remove entries; only append.
/// Reordering changes every stream's seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum StreamSlot {
    Actors = 0,
    Geography = 1,
    FarmerEdges = 2,
    ExporterEdges = 3,
    MiddlemanSplits = 4,
    FarmerFlows = 5,
}

impl StreamSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Actors => "actors",
            Self::Geography => "geography",
            Self::FarmerEdges => "farmer_edges",
            Self::ExporterEdges => "exporter_edges",
            Self::MiddlemanSplits => "middleman_splits",
            Self::FarmerFlows => "farmer_flows",
        }
    }
}

/// splitmix64 finalizer over (a, b).
fn mix(a: u64, b: u64) -> u64 {
    let mut z = a ^ b.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// FNV-1a over the country code. Must stay stable across releases.
fn stable_hash(s: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
