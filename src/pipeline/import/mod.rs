pub mod format;
pub mod hash;
pub mod importer;
pub mod staging;

pub use format::*;
pub use hash::*;
pub use importer::*;
pub use staging::*;

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File is empty")]
    EmptyFile,

    #[error("Unsupported file type: {0}")]
    UnsupportedFormat(String),

    #[error("File content does not match its extension: {0}")]
    FormatMismatch(String),

    #[error("File too large: {size_mb:.1}MB exceeds {max_mb}MB limit")]
    FileTooLarge { size_mb: f64, max_mb: u64 },

    #[error("Invalid project id: {0}")]
    InvalidProject(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
