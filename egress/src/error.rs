use std::error;
use std::fmt;

/// Convenient result type for egress operations using [`EgressError`] as the
/// error type.
pub type EgressResult<T> = Result<T, EgressError>;

/// Main error type for egress operations.
///
/// [`EgressError`] can represent single errors, errors with additional
/// detail, or multiple aggregated errors (e.g. the per-table failures of a
/// warehouse export).
#[derive(Debug, Clone)]
pub struct EgressError {
    repr: ErrorRepr,
}

/// Internal representation of error data.
#[derive(Debug, Clone)]
enum ErrorRepr {
    /// Error with kind and static description.
    WithDescription(ErrorKind, &'static str),
    /// Error with kind, static description, and dynamic detail.
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    /// Multiple aggregated errors.
    Many(Vec<EgressError>),
}

/// Specific categories of errors that can occur during egress operations.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    // Queue & catalog errors
    QueueOperationFailed,
    CatalogOperationFailed,

    // Object storage errors
    StorageConnectionFailed,
    StorageUploadFailed,
    StorageDownloadFailed,

    // Warehouse errors
    WarehouseConnectionFailed,
    WarehouseQueryFailed,

    // Data errors
    InvalidData,
    ConversionError,

    // IO & serialization errors
    IoError,
    SerializationError,
    DeserializationError,

    // Configuration & state errors
    ConfigError,
    InvalidState,

    // Unknown / uncategorized
    Unknown,
}

impl ErrorKind {
    /// Returns whether errors of this kind indicate a broken invariant
    /// rather than a retryable data-plane failure.
    ///
    /// Fatal errors terminate the worker that hit them instead of marking
    /// work `failed` for a later retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::InvalidData | ErrorKind::InvalidState)
    }
}

impl EgressError {
    /// Creates an [`EgressError`] containing multiple aggregated errors.
    pub fn many(errors: Vec<EgressError>) -> EgressError {
        EgressError {
            repr: ErrorRepr::Many(errors),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For multiple errors, returns the kind of the first error or
    /// [`ErrorKind::Unknown`] if the error list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Many(ref errors) => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => vec![kind],
            ErrorRepr::Many(ref errors) => {
                errors.iter().flat_map(|err| err.kinds()).collect::<Vec<_>>()
            }
        }
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            ErrorRepr::Many(ref errors) => errors.iter().find_map(|e| e.detail()),
            _ => None,
        }
    }
}

impl PartialEq for EgressError {
    fn eq(&self, other: &EgressError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::WithDescription(kind_a, _), ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Many(errors_a), ErrorRepr::Many(errors_b)) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for EgressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)?;

                Ok(())
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)?;
                f.write_str(" -> ")?;
                detail.fmt(f)?;

                Ok(())
            }
            ErrorRepr::Many(ref errors) => {
                if errors.is_empty() {
                    write!(f, "Multiple errors occurred (empty)")?;
                } else if errors.len() == 1 {
                    errors[0].fmt(f)?;
                } else {
                    write!(f, "Multiple errors occurred ({} total):", errors.len())?;
                    for (i, error) in errors.iter().enumerate() {
                        write!(f, "\n  {}: {}", i + 1, error)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl error::Error for EgressError {}

/// Creates an [`EgressError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for EgressError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> EgressError {
        EgressError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

/// Creates an [`EgressError`] from an error kind, static description, and
/// dynamic detail.
impl From<(ErrorKind, &'static str, String)> for EgressError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> EgressError {
        EgressError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

/// Creates an [`EgressError`] from a vector of errors for aggregation.
impl<E> From<Vec<E>> for EgressError
where
    E: Into<EgressError>,
{
    fn from(errors: Vec<E>) -> EgressError {
        EgressError {
            repr: ErrorRepr::Many(errors.into_iter().map(Into::into).collect()),
        }
    }
}

/// Converts [`std::io::Error`] to [`EgressError`] with [`ErrorKind::IoError`].
impl From<std::io::Error> for EgressError {
    fn from(err: std::io::Error) -> EgressError {
        EgressError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::IoError,
                "I/O error occurred",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`serde_json::Error`] to [`EgressError`] with the appropriate
/// serialization or deserialization kind.
impl From<serde_json::Error> for EgressError {
    fn from(err: serde_json::Error) -> EgressError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            _ => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        EgressError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

/// Converts [`sqlx::Error`] to [`EgressError`].
///
/// Database-side failures map to [`ErrorKind::WarehouseQueryFailed`] when
/// they carry a SQLSTATE and to connection kinds otherwise; the caller
/// decides whether the statement targeted the catalog or a warehouse.
impl From<sqlx::Error> for EgressError {
    fn from(err: sqlx::Error) -> EgressError {
        let kind = match &err {
            sqlx::Error::Database(_) => ErrorKind::WarehouseQueryFailed,
            sqlx::Error::Io(_) => ErrorKind::IoError,
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
                ErrorKind::WarehouseConnectionFailed
            }
            sqlx::Error::RowNotFound => ErrorKind::InvalidState,
            _ => ErrorKind::WarehouseQueryFailed,
        };

        EgressError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                kind,
                "Database operation failed",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`object_store::Error`] to [`EgressError`].
impl From<object_store::Error> for EgressError {
    fn from(err: object_store::Error) -> EgressError {
        let (kind, description) = match &err {
            object_store::Error::NotFound { .. } => (
                ErrorKind::StorageDownloadFailed,
                "Object not found in storage",
            ),
            _ => (ErrorKind::StorageUploadFailed, "Object storage operation failed"),
        };

        EgressError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

/// Converts [`gcp_bigquery_client::error::BQError`] to [`EgressError`] with
/// [`ErrorKind::WarehouseQueryFailed`].
impl From<gcp_bigquery_client::error::BQError> for EgressError {
    fn from(err: gcp_bigquery_client::error::BQError) -> EgressError {
        EgressError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::WarehouseQueryFailed,
                "BigQuery operation failed",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`chrono::ParseError`] to [`EgressError`] with
/// [`ErrorKind::ConversionError`].
impl From<chrono::ParseError> for EgressError {
    fn from(err: chrono::ParseError) -> EgressError {
        EgressError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::ConversionError,
                "Timestamp parse failed",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`uuid::Error`] to [`EgressError`] with [`ErrorKind::InvalidData`].
impl From<uuid::Error> for EgressError {
    fn from(err: uuid::Error) -> EgressError {
        EgressError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::InvalidData,
                "UUID parsing failed",
                err.to_string(),
            ),
        }
    }
}
