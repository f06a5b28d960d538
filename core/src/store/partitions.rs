//! Partition writes, completion markers and country wipes.

use super::{actors::write_actors, SimStore, YearBatch};
use crate::{
    error::{SimError, SimResult},
    types::{ActorKind, EdgeType, Year},
};
use rusqlite::{params, OptionalExtension, Transaction};

/// Completion marker of one (country, year) partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionInfo {
    pub country_id: String,
    pub year:       Year,
    pub run_id:     String,
    pub seed:       u64,
    pub flows:      u64,
    pub edges:      u64,
}

/// Tables holding per-country rows, cleared by a wipe.
const COUNTRY_TABLES: &[&str] = &[
    "trade_flow",
    "relationship",
    "under_connected",
    "farmer",
    "middleman",
    "exporter",
    "geography",
    "country",
    "year_partition",
];

impl SimStore {
    pub fn completed_partitions(&self, country_id: &str) -> SimResult<Vec<PartitionInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT country_id, year, run_id, seed, flows, edges
             FROM year_partition WHERE country_id = ?1
             ORDER BY year ASC",
        )?;
        let rows = stmt
            .query_map(params![country_id], |row| {
                Ok(PartitionInfo {
                    country_id: row.get(0)?,
                    year:       row.get(1)?,
                    run_id:     row.get(2)?,
                    seed:       row.get::<_, i64>(3)? as u64,
                    flows:      row.get::<_, i64>(4)? as u64,
                    edges:      row.get::<_, i64>(5)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn is_partition_complete(&self, country_id: &str, year: Year) -> SimResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM year_partition WHERE country_id = ?1 AND year = ?2",
                params![country_id, year],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Write every row of the batch and its completion marker in one
    /// transaction. Actor tables ride along with year 0.
    pub fn write_partition(&mut self, run_id: &str, batch: &YearBatch<'_>) -> SimResult<()> {
        let country_id = batch.country_id().to_string();
        if self.is_partition_complete(&country_id, batch.year)? {
            return Err(SimError::PartitionWrite {
                country: country_id,
                year:    batch.year,
                reason:  "partition is already complete".to_string(),
            });
        }

        let tx = self.conn.transaction()?;
        if batch.year == 0 {
            write_actors(&tx, batch.actors)?;
        }
        write_relationships(&tx, batch)?;
        write_flows(&tx, batch)?;
        write_under_connected(&tx, batch)?;
        tx.execute(
            "INSERT INTO year_partition (country_id, year, run_id, seed, flows, edges, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                country_id,
                batch.year,
                run_id,
                batch.seed as i64,
                batch.flows.len() as i64,
                batch.edges.len() as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn wipe_country(&mut self, country_id: &str) -> SimResult<()> {
        let tx = self.conn.transaction()?;
        for table in COUNTRY_TABLES {
            tx.execute(&format!("DELETE FROM {table} WHERE country_id = ?1"), params![country_id])?;
        }
        tx.commit()?;
        log::info!("country={country_id} store: existing partitions wiped");
        Ok(())
    }
}

fn write_relationships(tx: &Transaction<'_>, batch: &YearBatch<'_>) -> SimResult<()> {
    let actors = batch.actors;
    let mut stmt = tx.prepare_cached(
        "INSERT INTO relationship (
            country_id, year, edge_id, edge_type, source_id, target_id,
            start_year, end_year, years_active, state
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    for edge in &batch.edges {
        let (source_id, target_id) = match edge.edge_type {
            EdgeType::F2M => (actors.farmer_id(edge.source), actors.middleman_id(edge.target)),
            EdgeType::M2E => (actors.middleman_id(edge.source), actors.exporter_id(edge.target)),
            EdgeType::M2G => (
                actors.middleman_id(edge.source),
                actors.geography_id(edge.target).to_string(),
            ),
        };
        stmt.execute(params![
            &actors.country_id,
            batch.year,
            edge.id as i64,
            edge.edge_type.code(),
            source_id,
            target_id,
            edge.start_year,
            edge.end_year,
            edge.years_active,
            edge.state.name(),
        ])?;
    }
    Ok(())
}

fn write_flows(tx: &Transaction<'_>, batch: &YearBatch<'_>) -> SimResult<()> {
    let actors = batch.actors;
    let mut stmt = tx.prepare_cached(
        "INSERT INTO trade_flow (
            country_id, year, flow_id, farmer_id, middleman_id, exporter_id, amount_kg, sold_to_eu
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for flow in &batch.flows {
        stmt.execute(params![
            &actors.country_id,
            flow.year,
            flow.flow_id as i64,
            actors.farmer_id(flow.farmer),
            actors.middleman_id(flow.middleman),
            actors.exporter_id(flow.exporter),
            flow.amount_kg,
            flow.sold_to_eu,
        ])?;
    }
    Ok(())
}

fn write_under_connected(tx: &Transaction<'_>, batch: &YearBatch<'_>) -> SimResult<()> {
    let actors = batch.actors;
    let mut stmt = tx.prepare_cached(
        "INSERT INTO under_connected (country_id, year, actor_type, actor_id)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (kind, idx) in &batch.under_connected {
        let actor_id = match kind {
            ActorKind::Farmer => actors.farmer_id(*idx),
            ActorKind::Middleman => actors.middleman_id(*idx),
            ActorKind::Exporter => actors.exporter_id(*idx),
        };
        stmt.execute(params![&actors.country_id, batch.year, kind.name(), actor_id])?;
    }
    Ok(())
}
