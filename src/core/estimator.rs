use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::error::{ProjectionError, Result};
use super::types::{EstimationResult, PortfolioSnapshot};

pub const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketHistory {
    pub closes: Vec<f64>,
    pub dividend_yield: Option<f64>,
}

/// Per-holding series and weights, aligned by index. `closes[i]` is the daily
/// closing-price series of `symbols[i]`, all series sharing one trading calendar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EstimatorInput {
    pub initial_value: f64,
    pub symbols: Vec<String>,
    pub weights: Vec<f64>,
    pub closes: Vec<Vec<f64>>,
    pub dividend_yields: Vec<Option<f64>>,
}

impl EstimatorInput {
    pub fn from_snapshot(
        snapshot: &PortfolioSnapshot,
        histories: &HashMap<String, MarketHistory>,
    ) -> Result<Self> {
        let mut input = EstimatorInput {
            initial_value: snapshot.total_value,
            ..Default::default()
        };

        for position in &snapshot.positions {
            let history =
                histories
                    .get(&position.symbol)
                    .ok_or_else(|| ProjectionError::MissingHistory {
                        symbol: position.symbol.clone(),
                    })?;
            input.symbols.push(position.symbol.clone());
            input.weights.push(position.weight);
            input.closes.push(history.closes.clone());
            input
                .dividend_yields
                .push(history.dividend_yield.and_then(normalize_dividend_yield));
        }

        Ok(input)
    }
}

/// Providers report yields either as fractions (0.085) or percentages (8.5).
/// Anything above 1 is taken as a percentage.
pub fn normalize_dividend_yield(raw: f64) -> Option<f64> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    if raw > 1.0 {
        Some(raw / 100.0)
    } else {
        Some(raw)
    }
}

pub fn estimate(input: &EstimatorInput) -> Result<EstimationResult> {
    if input.closes.is_empty() || input.initial_value == 0.0 {
        info!(
            holdings = input.closes.len(),
            initial_value = input.initial_value,
            "nothing to estimate, returning empty parameters"
        );
        return Ok(EstimationResult::empty());
    }

    if !input.initial_value.is_finite() || input.initial_value < 0.0 {
        return Err(ProjectionError::invalid_estimation(
            "initial value must be finite and >= 0",
        ));
    }

    let weight_sum: f64 = input.weights.iter().sum();
    if input.weights.len() != input.closes.len() {
        warn!(
            weights = input.weights.len(),
            series = input.closes.len(),
            "one weight per price series required"
        );
        return Err(ProjectionError::WeightMismatch { sum: weight_sum });
    }
    if !weight_sum.is_finite() || (weight_sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(ProjectionError::WeightMismatch { sum: weight_sum });
    }

    let points = input.closes[0].len();
    if let Some(series) = input.closes.iter().find(|c| c.len() != points) {
        return Err(ProjectionError::MisalignedHistory {
            expected: points,
            actual: series.len(),
        });
    }
    if points == 0 {
        info!("price history is empty, returning empty parameters");
        return Ok(EstimationResult::empty());
    }
    if points == 1 {
        return Err(ProjectionError::InsufficientHistory {
            symbol: input.symbols.first().cloned().unwrap_or_default(),
            points,
        });
    }

    let returns = portfolio_daily_returns(&input.closes, &input.weights);
    if returns.is_empty() {
        info!(points, "no complete trading day in history, returning empty parameters");
        return Ok(EstimationResult::empty());
    }

    let (daily_drift, daily_volatility) = mean_and_sample_std(&returns);

    let blended_dividend_yield = input
        .weights
        .iter()
        .enumerate()
        .map(|(idx, weight)| {
            let dy = input
                .dividend_yields
                .get(idx)
                .copied()
                .flatten()
                .filter(|dy| dy.is_finite() && *dy >= 0.0)
                .unwrap_or(0.0);
            weight * dy
        })
        .sum();

    let result = EstimationResult {
        initial_value: input.initial_value,
        daily_drift,
        daily_volatility,
        blended_dividend_yield,
    };
    debug!(
        observations = returns.len(),
        dropped_days = points - 1 - returns.len(),
        drift = result.daily_drift,
        volatility = result.daily_volatility,
        dividend_yield = result.blended_dividend_yield,
        "estimated portfolio parameters"
    );
    Ok(result)
}

fn simple_return(previous: f64, current: f64) -> Option<f64> {
    let valid = |p: f64| p.is_finite() && p > 0.0;
    if valid(previous) && valid(current) {
        Some(current / previous - 1.0)
    } else {
        None
    }
}

// Weighted sum of each holding's simple return, per day. Days where any
// holding lacks a valid price pair are skipped.
fn portfolio_daily_returns(closes: &[Vec<f64>], weights: &[f64]) -> Vec<f64> {
    let points = closes[0].len();
    let mut returns = Vec::with_capacity(points.saturating_sub(1));
    'days: for t in 1..points {
        let mut day_return = 0.0;
        for (series, weight) in closes.iter().zip(weights) {
            let Some(r) = simple_return(series[t - 1], series[t]) else {
                continue 'days;
            };
            day_return += weight * r;
        }
        returns.push(day_return);
    }
    returns
}

fn mean_and_sample_std(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    (mean, var.sqrt())
}
