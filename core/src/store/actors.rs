//! Actor tables: written with a country's year-0 partition, read back for
//! reporting and tests.

use super::SimStore;
use crate::{
    actors::CountryActors,
    error::SimResult,
    types::ActorIdx,
};
use rusqlite::{params, Transaction};

/// Row counts of the actor tables for one country.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActorCounts {
    pub geographies: u64,
    pub farmers:     u64,
    pub middlemen:   u64,
    pub exporters:   u64,
}

impl SimStore {
    pub fn actor_counts(&self, country_id: &str) -> SimResult<ActorCounts> {
        let count = |table: &str| -> SimResult<u64> {
            let n: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE country_id = ?1"),
                params![country_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        };
        Ok(ActorCounts {
            geographies: count("geography")?,
            farmers:     count("farmer")?,
            middlemen:   count("middleman")?,
            exporters:   count("exporter")?,
        })
    }

    /// (farmer_id, production_kg) for every farmer of the country.
    pub fn farmer_production(&self, country_id: &str) -> SimResult<Vec<(String, f64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT farmer_id, production_kg FROM farmer
             WHERE country_id = ?1 ORDER BY farmer_id",
        )?;
        let rows = stmt
            .query_map(params![country_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn total_production_kg(&self, country_id: &str) -> SimResult<f64> {
        let total: f64 = self.conn.query_row(
            "SELECT total_production_kg FROM country WHERE country_id = ?1",
            params![country_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

pub(super) fn write_actors(tx: &Transaction<'_>, actors: &CountryActors) -> SimResult<()> {
    let a = &actors.assumptions;
    tx.execute(
        "INSERT OR REPLACE INTO country (
            country_id, n_middlemen, n_exporters, eu_target_kg, loyalty_base, switch_rate,
            geography_change_rate, max_buyers_per_farmer, max_exporters_per_middleman,
            total_production_kg
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            &a.country_id,
            a.n_middlemen,
            a.n_exporters,
            a.eu_target_kg,
            a.loyalty_base,
            a.switch_rate,
            a.geography_change_rate,
            a.max_buyers_per_farmer,
            a.max_exporters_per_middleman,
            actors.total_production_kg(),
        ],
    )?;

    let mut geo_stmt = tx.prepare_cached(
        "INSERT OR REPLACE INTO geography (
            geo_id, country_id, region_id, num_farmers, production_kg, primary_crop,
            centroid_lat, centroid_lon
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for g in &actors.geographies {
        geo_stmt.execute(params![
            &g.geo_id,
            &actors.country_id,
            &actors.areas[g.area as usize].region_id,
            g.num_farmers,
            g.production_kg,
            g.primary_crop.name(),
            g.centroid_lat,
            g.centroid_lon,
        ])?;
    }

    let mut farmer_stmt = tx.prepare_cached(
        "INSERT OR REPLACE INTO farmer (farmer_id, country_id, geo_id, production_kg, loyalty, num_plots)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (idx, f) in actors.farmers.iter().enumerate() {
        farmer_stmt.execute(params![
            actors.farmer_id(idx as ActorIdx),
            &actors.country_id,
            actors.geography_id(f.geography),
            f.production_kg,
            f.loyalty,
            f.num_plots,
        ])?;
    }

    let mut middleman_stmt = tx.prepare_cached(
        "INSERT OR REPLACE INTO middleman (middleman_id, country_id, competitiveness, loyalty)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (idx, m) in actors.middlemen.iter().enumerate() {
        middleman_stmt.execute(params![
            actors.middleman_id(idx as ActorIdx),
            &actors.country_id,
            m.competitiveness,
            m.loyalty,
        ])?;
    }

    let mut exporter_stmt = tx.prepare_cached(
        "INSERT OR REPLACE INTO exporter (exporter_id, country_id, competitiveness, eu_preference, loyalty)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (idx, e) in actors.exporters.iter().enumerate() {
        exporter_stmt.execute(params![
            actors.exporter_id(idx as ActorIdx),
            &actors.country_id,
            e.competitiveness,
            e.eu_preference,
            e.loyalty,
        ])?;
    }
    Ok(())
}

