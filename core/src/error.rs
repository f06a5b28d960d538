use crate::types::{CountryId, Year};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data integrity error for country '{country}': {reason}")]
    DataIntegrity { country: CountryId, reason: String },

    #[error(
        "Volume conservation violated: country={country} year={year} farmer={farmer_id} \
         allocated={allocated:.6} production={production:.6}"
    )]
    VolumeConservation {
        country: CountryId,
        year: Year,
        farmer_id: String,
        allocated: f64,
        production: f64,
    },

    #[error("Random source misconfigured: {0}")]
    RandomSource(String),

    #[error("Invalid run parameters: {0}")]
    InvalidRun(String),

    #[error("Storage partition write failed for country={country} year={year}: {reason}")]
    PartitionWrite {
        country: CountryId,
        year: Year,
        reason: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SimError {
    pub fn data_integrity(country: &str, reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            country: country.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors that break reproducibility for every country abort the whole run.
    /// Everything else is contained to the country that raised it.
    pub fn aborts_run(&self) -> bool {
        matches!(self, Self::RandomSource(_) | Self::InvalidRun(_))
    }
}

pub type SimResult<T> = Result<T, SimError>;
