use crate::fixture::SetupError;

/// Errors that stop a run before or while it is being orchestrated.
///
/// Failures *inside* an iteration never surface here; they are converted to
/// recorded outcomes by the iteration executor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The fixture could not be produced, so the run never started.
    #[error("setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("invalid profile for scenario `{scenario}`: {reason}")]
    InvalidProfile { scenario: String, reason: String },

    #[error("invalid threshold `{expr}`: {reason}")]
    InvalidThreshold { expr: String, reason: String },

    #[error("invalid duration `{input}`: {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("run has no scenarios")]
    NoScenarios,

    #[error("scenario `{0}` is declared twice")]
    DuplicateScenario(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn profile(scenario: &str, reason: impl Into<String>) -> Self {
        Self::InvalidProfile {
            scenario: scenario.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn threshold(expr: &str, reason: impl Into<String>) -> Self {
        Self::InvalidThreshold {
            expr: expr.to_owned(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
