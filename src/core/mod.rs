mod engine;
mod error;
mod estimator;
mod summary;
mod types;

pub use engine::{
    AbortSignal, EntropyShocks, PathSimulator, RngShocks, SeededShocks, ShockSource, ShockStream,
};
pub use error::{ProjectionError, Result};
pub use estimator::{
    EstimatorInput, MarketHistory, WEIGHT_TOLERANCE, estimate, normalize_dividend_yield,
};
pub use summary::{HISTOGRAM_BINS, Projection, percentile, project, summarize};
pub use types::{
    DividendProjection, EstimationResult, HistogramBin, Holding, PathBands, PercentileBands,
    PortfolioSnapshot, SimulationConfig, SimulationEnsemble, SummaryReport, TRADING_DAYS_PER_MONTH,
    TRADING_DAYS_PER_YEAR, ValuedHolding,
};
