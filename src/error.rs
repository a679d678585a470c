use thiserror::Error;
use warp::http::StatusCode;

/// Convenience result type for store, ingestion and accessor operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Error type shared by the ingestion pipeline and the table accessor.
///
/// Every variant falls into one of three [`ErrorKind`]s; the HTTP layer only
/// ever looks at the kind and the [`Operation`] that failed.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed or missing request input.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A table or column name that cannot be used as a quoted identifier.
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    /// `CREATE SEQUENCE` / `CREATE TABLE` was rejected by the store.
    #[error("failed to create table '{table}': {source}")]
    CreateTable {
        table: String,
        #[source]
        source: duckdb::Error,
    },

    /// An accepted CSV row could not be inserted.
    #[error("failed to insert CSV row {row} into '{table}': {source}")]
    Insert {
        table: String,
        row: usize,
        #[source]
        source: duckdb::Error,
    },

    /// Any other store-level failure (missing table, rejected statement).
    #[error("storage error: {0}")]
    Storage(#[from] duckdb::Error),

    /// The CSV stream could not be read or decoded.
    #[error("csv parse error: {0}")]
    Parse(#[from] csv::Error),

    /// Writing the uploaded file to the staging directory failed.
    #[error("upload staging error: {0}")]
    Staging(#[from] std::io::Error),
}

/// Caller-facing classification of a [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Storage,
    Parse,
}

/// The request-level operation an error surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upload,
    Read,
    Clear,
    Update,
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_) | ServiceError::InvalidIdentifier(_) => {
                ErrorKind::Validation
            }
            ServiceError::Parse(_) => ErrorKind::Parse,
            ServiceError::CreateTable { .. }
            | ServiceError::Insert { .. }
            | ServiceError::Storage(_)
            | ServiceError::Staging(_) => ErrorKind::Storage,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Storage | ErrorKind::Parse => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Fixed human-readable message sent back in the `{error}` body.
    pub fn public_message(&self, op: Operation) -> &'static str {
        match (self, op) {
            (ServiceError::InvalidIdentifier(_), _) => "Invalid table or column name.",
            (ServiceError::Validation(_), Operation::Upload) => {
                "Table name and CSV file are required."
            }
            (ServiceError::Validation(_), Operation::Update) => "Invalid update request.",
            (ServiceError::Validation(_), _) => "Invalid table or column name.",
            (ServiceError::CreateTable { .. }, _) => "Failed to create table.",
            (ServiceError::Insert { .. }, _) => "Failed to insert CSV rows.",
            (ServiceError::Parse(_), _) => "Error parsing CSV file.",
            (ServiceError::Staging(_), _) => "Failed to store uploaded file.",
            (ServiceError::Storage(_), Operation::Upload) => "Failed to insert CSV rows.",
            (ServiceError::Storage(_), Operation::Read) => {
                "Error retrieving data. Table may not exist."
            }
            (ServiceError::Storage(_), Operation::Clear) => "Failed to clear table.",
            (ServiceError::Storage(_), Operation::Update) => "Update failed.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let err = ServiceError::Validation("no file".into());
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            err.public_message(Operation::Upload),
            "Table name and CSV file are required."
        );
        assert_eq!(
            err.public_message(Operation::Update),
            "Invalid update request."
        );
    }

    #[test]
    fn staging_failure_is_a_storage_error() {
        let err = ServiceError::from(std::io::Error::other("disk full"));
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            err.public_message(Operation::Upload),
            "Failed to store uploaded file."
        );
    }

    #[test]
    fn identifier_errors_share_one_message() {
        let err = ServiceError::InvalidIdentifier(String::new());
        for op in [
            Operation::Upload,
            Operation::Read,
            Operation::Clear,
            Operation::Update,
        ] {
            assert_eq!(err.public_message(op), "Invalid table or column name.");
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        }
    }
}
