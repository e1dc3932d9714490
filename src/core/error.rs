//! Unified error handling for formdesk
//!
//! Every fallible operation in the crate returns [`IntakeResult`]. The HTTP layer
//! maps each kind onto a status code with [`IntakeError::status_code`].
//!
//! Two conditions that look like errors are deliberately not represented here:
//! a missing subform is an `Ok(None)` from the catalog, and a field without a
//! matching control is skipped while collecting.

use std::fmt;

use http::StatusCode;

#[derive(Debug)]
pub enum IntakeError {
    /// The schema locator does not resolve to a document
    SchemaNotFound(String),

    /// The schema document cannot be turned into a form
    SchemaMalformed(String),

    /// The request store rejected a write or could not be reached
    PersistFailure(String),

    /// Input rejected before reaching the store
    Validation(String),

    /// The operation is not allowed in the current workflow state
    Workflow(String),

    /// Request record, session or file not found
    NotFound(String),

    /// Filesystem errors
    Io(std::io::Error),

    /// Internal system errors
    Internal(String),
}

impl fmt::Display for IntakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntakeError::SchemaNotFound(msg) => write!(f, "Schema not found: {msg}"),
            IntakeError::SchemaMalformed(msg) => write!(f, "Schema malformed: {msg}"),
            IntakeError::PersistFailure(msg) => write!(f, "Persist failure: {msg}"),
            IntakeError::Validation(msg) => write!(f, "Validation error: {msg}"),
            IntakeError::Workflow(msg) => write!(f, "Workflow error: {msg}"),
            IntakeError::NotFound(msg) => write!(f, "Not found: {msg}"),
            IntakeError::Io(err) => write!(f, "I/O error: {err}"),
            IntakeError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for IntakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IntakeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for IntakeError {
    fn from(err: std::io::Error) -> Self {
        IntakeError::Io(err)
    }
}

impl IntakeError {
    /// HTTP status used when the error reaches a client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            IntakeError::SchemaNotFound(_) | IntakeError::NotFound(_) => StatusCode::NOT_FOUND,
            IntakeError::SchemaMalformed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            IntakeError::Validation(_) => StatusCode::BAD_REQUEST,
            IntakeError::Workflow(_) => StatusCode::CONFLICT,
            IntakeError::PersistFailure(_) | IntakeError::Io(_) | IntakeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Result type alias for intake operations
pub type IntakeResult<T> = std::result::Result<T, IntakeError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> IntakeResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> IntakeResult<T> {
        self.map_err(|e| IntakeError::Internal(format!("{context}: {e}")))
    }
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr) => {
        $crate::core::error::IntakeError::Validation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::error::IntakeError::Validation(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! workflow_error {
    ($msg:expr) => {
        $crate::core::error::IntakeError::Workflow($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::error::IntakeError::Workflow(format!($fmt, $($arg)*))
    };
}
