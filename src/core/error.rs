use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProjectionError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProjectionError {
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Portfolio is empty: no priced holdings or zero total value")]
    EmptyPortfolio,

    #[error("Portfolio weights sum to {sum}, expected 1.0")]
    WeightMismatch { sum: f64 },

    #[error("Invalid holding: {message}")]
    InvalidHolding { message: String },

    #[error("Holding {symbol} appears more than once")]
    DuplicateHolding { symbol: String },

    #[error("No price history supplied for {symbol}")]
    MissingHistory { symbol: String },

    #[error("Price history for {symbol} has {points} point(s), need at least 2")]
    InsufficientHistory { symbol: String, points: usize },

    #[error("Price histories are not aligned: expected {expected} points, got {actual}")]
    MisalignedHistory { expected: usize, actual: usize },

    #[error("Invalid estimation: {message}")]
    InvalidEstimation { message: String },

    #[error("Simulation aborted after {completed} of {requested} paths")]
    Aborted { completed: u32, requested: u32 },
}

impl ProjectionError {
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn invalid_holding(message: impl Into<String>) -> Self {
        Self::InvalidHolding {
            message: message.into(),
        }
    }

    pub fn invalid_estimation(message: impl Into<String>) -> Self {
        Self::InvalidEstimation {
            message: message.into(),
        }
    }
}
