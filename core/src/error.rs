use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by callers to pick a presentation
/// (exit code, HTTP status) without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    InvalidState,
    Upstream,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("storage error: {0}")]
    Storage(#[source] rusqlite::Error),
}

/// Failures of the outbound notification call.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("messaging credentials not configured (set {0})")]
    MissingCredentials(&'static str),

    #[error("failed to reach messaging API: {0}")]
    DeliveryFailed(String),

    #[error("messaging API rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Upstream(_) => ErrorKind::Upstream,
            Self::Storage(_) => ErrorKind::Internal,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        // Constraint failures are caller mistakes, not storage faults.
        if let rusqlite::Error::SqliteFailure(ref code, ref msg) = err {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                let detail = msg.clone().unwrap_or_else(|| code.to_string());
                return match code.extended_code {
                    rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Self::NotFound {
                        entity: "referenced row",
                        id: detail,
                    },
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    | rusqlite::ffi::SQLITE_CONSTRAINT_TRIGGER => Self::Conflict(detail),
                    _ => Self::InvalidInput(detail),
                };
            }
        }
        Self::Storage(err)
    }
}
