//! Error types for scrapsync-core

use thiserror::Error;

/// Result type alias using scrapsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in local store operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A column or table the query expects is missing from an older local schema
    #[error("Schema drift on {table}: {detail}")]
    SchemaDrift { table: String, detail: String },

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Reclassify a raw `SQLite` failure as schema drift when it names a missing column or table.
    pub fn classify(table: &str, error: rusqlite::Error) -> Self {
        let message = error.to_string();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("no such column")
            || lowered.contains("has no column named")
            || lowered.contains("no such table")
        {
            Self::SchemaDrift {
                table: table.to_string(),
                detail: message,
            }
        } else {
            Self::Sqlite(error)
        }
    }

    /// Whether this error came from a missing column/table on an older schema.
    pub const fn is_schema_drift(&self) -> bool {
        matches!(self, Self::SchemaDrift { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_detects_missing_column() {
        let raw = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table customers has no column named photo_path".to_string()),
        );
        let error = Error::classify("customers", raw);
        assert!(error.is_schema_drift());
        assert!(error.to_string().contains("customers"));
    }

    #[test]
    fn classify_keeps_other_failures() {
        let error = Error::classify("customers", rusqlite::Error::QueryReturnedNoRows);
        assert!(!error.is_schema_drift());
    }
}
