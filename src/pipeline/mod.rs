//! The extraction and analysis pipeline.
//!
//! Upload intake stages a document and queues its extraction; workers drive
//! the extraction state machine; analysis turns a completed extraction plus a
//! set of requirements into matrix entries.

pub mod analysis;
pub mod dispatch;
pub mod extraction;
pub mod import;
pub mod matrix;
pub mod provider;
pub mod retry;
pub mod status;

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DatabaseError;
use import::ImportError;
use provider::ProviderError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Upload rejected: {0}")]
    Upload(#[from] ImportError),
}

impl From<DatabaseError> for PipelineError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { entity_type, id } => Self::NotFound { entity_type, id },
            e if e.is_unique_violation() => Self::Conflict(e.to_string()),
            e => Self::Database(e),
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        DatabaseError::from(err).into()
    }
}

impl PipelineError {
    pub fn not_found(entity_type: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
    }
}
