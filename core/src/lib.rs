//! Synthetic coffee trade network simulation.
//!
//! Per country: actors are generated once, then each year relationships
//! evolve, middlemen move between geographies, and every farmer's
//! production is allocated to trade flows through middlemen to exporters.

pub mod actors;
pub mod config;
pub mod country;
pub mod engine;
pub mod error;
pub mod event;
pub mod geography;
pub mod relationships;
pub mod report;
pub mod rng;
pub mod store;
pub mod trade;
pub mod types;
