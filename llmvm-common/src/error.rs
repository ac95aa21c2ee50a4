use thiserror::Error;

/// One placement attempt that failed; kept so `NoZoneAvailable` can report
/// the precise per-group cause instead of a generic message.
#[derive(Debug, Clone)]
pub struct ZoneAttempt {
    pub zone: String,
    pub cause: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("quota exceeded in zone '{zone}': {message}")]
    QuotaExceeded { zone: String, message: String },

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("remote execution error: {0}")]
    RemoteExec(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no zone available after {} group(s): {}", attempts.len(), summarize(attempts))]
    NoZoneAvailable { attempts: Vec<ZoneAttempt> },

    #[error("provider error: {0}")]
    Provider(String),
}

fn summarize(attempts: &[ZoneAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.zone, a.cause))
        .collect::<Vec<_>>()
        .join("; ")
}

/// How the retry machinery must treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying cannot fix this; abort the whole operation.
    Fatal,
    /// Retry in place after the policy interval.
    Retryable,
    /// Retrying the same zone is pointless; a different zone may work.
    RetryableNextZone,
    /// The resource does not exist; callers decide whether that is an error.
    NotFound,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config(_)
            | Error::Auth(_)
            | Error::NoZoneAvailable { .. }
            | Error::Provider(_) => ErrorClass::Fatal,
            Error::QuotaExceeded { .. } => ErrorClass::RetryableNextZone,
            Error::TransientNetwork(_) | Error::RemoteExec(_) => ErrorClass::Retryable,
            Error::NotFound(_) => ErrorClass::NotFound,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
