//! Reads over the relationship snapshot and trade-flow tables, plus the
//! bulk CSV export of flows.

use super::SimStore;
use crate::{error::SimResult, types::Year};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRow {
    pub country_id:   String,
    pub year:         Year,
    pub flow_id:      u64,
    pub farmer_id:    String,
    pub middleman_id: String,
    pub exporter_id:  String,
    pub amount_kg:    f64,
    pub sold_to_eu:   bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRow {
    pub country_id:   String,
    pub year:         Year,
    pub edge_id:      u64,
    pub edge_type:    String,
    pub source_id:    String,
    pub target_id:    String,
    pub start_year:   Year,
    pub end_year:     Option<Year>,
    pub years_active: u32,
    pub state:        String,
}

const FLOW_COLUMNS: &str =
    "country_id, year, flow_id, farmer_id, middleman_id, exporter_id, amount_kg, sold_to_eu";

fn flow_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowRow> {
    Ok(FlowRow {
        country_id:   row.get(0)?,
        year:         row.get(1)?,
        flow_id:      row.get::<_, i64>(2)? as u64,
        farmer_id:    row.get(3)?,
        middleman_id: row.get(4)?,
        exporter_id:  row.get(5)?,
        amount_kg:    row.get(6)?,
        sold_to_eu:   row.get(7)?,
    })
}

impl SimStore {
    pub fn flows_for(&self, country_id: &str, year: Year) -> SimResult<Vec<FlowRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FLOW_COLUMNS} FROM trade_flow
             WHERE country_id = ?1 AND year = ?2 ORDER BY flow_id"
        ))?;
        let rows = stmt
            .query_map(params![country_id, year], flow_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn flow_count(&self, country_id: &str) -> SimResult<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM trade_flow WHERE country_id = ?1",
            params![country_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn relationships_for(&self, country_id: &str, year: Year) -> SimResult<Vec<RelationshipRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT country_id, year, edge_id, edge_type, source_id, target_id,
                    start_year, end_year, years_active, state
             FROM relationship
             WHERE country_id = ?1 AND year = ?2 ORDER BY edge_id",
        )?;
        let rows = stmt
            .query_map(params![country_id, year], |row| {
                Ok(RelationshipRow {
                    country_id:   row.get(0)?,
                    year:         row.get(1)?,
                    edge_id:      row.get::<_, i64>(2)? as u64,
                    edge_type:    row.get(3)?,
                    source_id:    row.get(4)?,
                    target_id:    row.get(5)?,
                    start_year:   row.get(6)?,
                    end_year:     row.get(7)?,
                    years_active: row.get(8)?,
                    state:        row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// (actor_type, actor_id) audit rows for one year.
    pub fn under_connected_for(&self, country_id: &str, year: Year) -> SimResult<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT actor_type, actor_id FROM under_connected
             WHERE country_id = ?1 AND year = ?2 ORDER BY actor_type, actor_id",
        )?;
        let rows = stmt
            .query_map(params![country_id, year], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Stream the flow table to CSV, optionally limited to one country.
    /// Returns the number of rows written.
    pub fn export_flows_csv(&self, path: &Path, country_id: Option<&str>) -> SimResult<u64> {
        let mut writer = csv::WriterBuilder::new().has_headers(true).from_path(path)?;
        let mut written = 0u64;
        match country_id {
            Some(country_id) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {FLOW_COLUMNS} FROM trade_flow
                     WHERE country_id = ?1 ORDER BY year, flow_id"
                ))?;
                let mut rows = stmt.query(params![country_id])?;
                while let Some(row) = rows.next()? {
                    writer.serialize(flow_from_row(row)?)?;
                    written += 1;
                }
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {FLOW_COLUMNS} FROM trade_flow ORDER BY country_id, year, flow_id"
                ))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    writer.serialize(flow_from_row(row)?)?;
                    written += 1;
                }
            }
        }
        writer.flush()?;
        log::info!("store: exported {written} flows to {}", path.display());
        Ok(written)
    }
}
