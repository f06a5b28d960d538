//! Per (country, year) summary computed from the flow table.

use super::SimStore;
use crate::{error::SimResult, types::Year};
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearSummary {
    pub country_id:                  String,
    pub year:                        Year,
    pub farmers:                     u64,
    pub middlemen:                   u64,
    pub exporters:                   u64,
    pub flows:                       u64,
    pub total_volume_kg:             f64,
    pub eu_volume_kg:                f64,
    pub eu_ratio:                    f64,
    /// Distinct middlemen each trading farmer sold to, averaged.
    pub avg_middlemen_per_farmer:    f64,
    /// Distinct exporters each trading middleman sold to, averaged.
    pub avg_exporters_per_middleman: f64,
}

impl SimStore {
    pub fn year_summary(&self, country_id: &str, year: Year) -> SimResult<YearSummary> {
        let (farmers, middlemen, exporters, flows, total, eu): (i64, i64, i64, i64, f64, f64) =
            self.conn.query_row(
                "SELECT COUNT(DISTINCT farmer_id),
                        COUNT(DISTINCT middleman_id),
                        COUNT(DISTINCT exporter_id),
                        COUNT(*),
                        COALESCE(SUM(amount_kg), 0.0),
                        COALESCE(SUM(CASE WHEN sold_to_eu THEN amount_kg ELSE 0.0 END), 0.0)
                 FROM trade_flow WHERE country_id = ?1 AND year = ?2",
                params![country_id, year],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
            )?;

        let avg_middlemen_per_farmer: f64 = self.conn.query_row(
            "SELECT COALESCE(AVG(n), 0.0) FROM (
                 SELECT COUNT(DISTINCT middleman_id) AS n FROM trade_flow
                 WHERE country_id = ?1 AND year = ?2 GROUP BY farmer_id
             )",
            params![country_id, year],
            |row| row.get(0),
        )?;
        let avg_exporters_per_middleman: f64 = self.conn.query_row(
            "SELECT COALESCE(AVG(n), 0.0) FROM (
                 SELECT COUNT(DISTINCT exporter_id) AS n FROM trade_flow
                 WHERE country_id = ?1 AND year = ?2 GROUP BY middleman_id
             )",
            params![country_id, year],
            |row| row.get(0),
        )?;

        Ok(YearSummary {
            country_id: country_id.to_string(),
            year,
            farmers: farmers as u64,
            middlemen: middlemen as u64,
            exporters: exporters as u64,
            flows: flows as u64,
            total_volume_kg: total,
            eu_volume_kg: eu,
            eu_ratio: if total > 0.0 { eu / total } else { 0.0 },
            avg_middlemen_per_farmer,
            avg_exporters_per_middleman,
        })
    }
}
