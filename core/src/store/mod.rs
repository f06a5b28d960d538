//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The engine hands over finished `YearBatch`es; it never executes SQL.
//!
//! Output is partitioned by (country, year). A partition is written in
//! one transaction and marked complete in the `year_partition` table inside
//! that same transaction, so readers never observe a half-written year.

use crate::{
    actors::CountryActors,
    error::SimResult,
    event::EventLogEntry,
    geography::CoverageShortfall,
    relationships::Edge,
    trade::TradeFlow,
    types::{ActorIdx, ActorKind, CountryId, Year},
};
use rusqlite::{params, Connection};
use std::collections::BTreeSet;

mod actors;
mod analytics;
mod flows;
mod partitions;

pub use actors::ActorCounts;
pub use analytics::YearSummary;
pub use flows::{FlowRow, RelationshipRow};
pub use partitions::PartitionInfo;

/// Everything produced for one (country, year).
#[derive(Debug)]
pub struct YearBatch<'a> {
    pub actors:          &'a CountryActors,
    pub year:            Year,
    pub seed:            u64,
    pub edges:           Vec<Edge>,
    pub flows:           Vec<TradeFlow>,
    pub under_connected: Vec<(ActorKind, ActorIdx)>,
    pub shortfalls:      Vec<CoverageShortfall>,
}

impl YearBatch<'_> {
    pub fn country_id(&self) -> &str {
        &self.actors.country_id
    }
}

/// The storage contract the engine depends on.
///
/// Partitions are append-only: a completed (country, year) is never
/// rewritten unless the country is wiped first.
pub trait PartitionStore: Send {
    /// Years of `country_id` whose partition is complete, with the seed
    /// they were produced under.
    fn completed_partitions(&self, country_id: &str) -> SimResult<Vec<PartitionInfo>>;

    /// Write one partition atomically and mark it complete.
    fn write_partition(&mut self, run_id: &str, batch: &YearBatch<'_>) -> SimResult<()>;

    /// Delete every row of every partition of `country_id`.
    fn wipe_country(&mut self, country_id: &str) -> SimResult<()>;

    fn append_event(&self, entry: &EventLogEntry) -> SimResult<()>;

    fn insert_run(&self, run_id: &str, seed: u64, year_count: u32) -> SimResult<()>;
}

pub struct SimStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl SimStore {
    pub fn open(path: &str) -> SimResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> SimResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    pub fn reopen(&self) -> SimResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> SimResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_actors.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_relationships.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_trade_flows.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(&self, run_id: &str, seed: u64, year_count: u32) -> SimResult<()> {
        self.conn.execute(
            "INSERT INTO run (run_id, seed, version, year_count, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                seed as i64,
                env!("CARGO_PKG_VERSION"),
                year_count,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> SimResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_id, country_id, year, component, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.run_id,
                entry.country_id,
                entry.year,
                entry.component,
                entry.event_type,
                entry.payload,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn events_for_run(&self, run_id: &str) -> SimResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, country_id, year, component, event_type, payload
             FROM event_log WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                Ok(EventLogEntry {
                    id:         Some(row.get(0)?),
                    run_id:     row.get(1)?,
                    country_id: row.get(2)?,
                    year:       row.get(3)?,
                    component:  row.get(4)?,
                    event_type: row.get(5)?,
                    payload:    row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Countries that have at least one completed partition.
    pub fn stored_countries(&self) -> SimResult<BTreeSet<CountryId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT country_id FROM year_partition ORDER BY country_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }
}

impl PartitionStore for SimStore {
    fn completed_partitions(&self, country_id: &str) -> SimResult<Vec<PartitionInfo>> {
        SimStore::completed_partitions(self, country_id)
    }

    fn write_partition(&mut self, run_id: &str, batch: &YearBatch<'_>) -> SimResult<()> {
        SimStore::write_partition(self, run_id, batch)
    }

    fn wipe_country(&mut self, country_id: &str) -> SimResult<()> {
        SimStore::wipe_country(self, country_id)
    }

    fn append_event(&self, entry: &EventLogEntry) -> SimResult<()> {
        SimStore::append_event(self, entry)
    }

    fn insert_run(&self, run_id: &str, seed: u64, year_count: u32) -> SimResult<()> {
        SimStore::insert_run(self, run_id, seed, year_count)
    }
}
