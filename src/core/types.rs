use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::error::{ProjectionError, Result};

pub const TRADING_DAYS_PER_YEAR: u32 = 252;
pub const TRADING_DAYS_PER_MONTH: u32 = 21;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    symbol: String,
    quantity: f64,
    average_cost: f64,
}

impl Holding {
    pub fn new(symbol: &str, quantity: f64, average_cost: f64) -> Result<Self> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(ProjectionError::invalid_holding("symbol must not be empty"));
        }
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(ProjectionError::invalid_holding(format!(
                "{symbol}: quantity must be > 0"
            )));
        }
        if !average_cost.is_finite() || average_cost <= 0.0 {
            return Err(ProjectionError::invalid_holding(format!(
                "{symbol}: average cost must be > 0"
            )));
        }
        Ok(Self {
            symbol,
            quantity,
            average_cost,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn average_cost(&self) -> f64 {
        self.average_cost
    }

    pub fn cost_basis(&self) -> f64 {
        self.quantity * self.average_cost
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuedHolding {
    pub symbol: String,
    pub quantity: f64,
    pub average_cost: f64,
    pub current_price: f64,
    pub current_value: f64,
    pub weight: f64,
}

impl ValuedHolding {
    pub fn cost_basis(&self) -> f64 {
        self.quantity * self.average_cost
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub positions: Vec<ValuedHolding>,
    pub excluded: Vec<String>,
    /// Real-estate investment funds (B3 tickers ending in `11`), in input order.
    pub real_estate_funds: Vec<String>,
    pub total_value: f64,
    pub total_cost: f64,
    pub unrealized_gain: f64,
    pub unrealized_gain_pct: f64,
}

impl PortfolioSnapshot {
    /// Values `holdings` at `prices`. Holdings without a usable price are listed
    /// in `excluded` and take no part in weighting.
    pub fn value(holdings: &[Holding], prices: &HashMap<String, f64>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(holdings.len());
        for holding in holdings {
            if !seen.insert(holding.symbol()) {
                return Err(ProjectionError::DuplicateHolding {
                    symbol: holding.symbol().to_string(),
                });
            }
        }

        let mut positions = Vec::with_capacity(holdings.len());
        let mut excluded = Vec::new();
        for holding in holdings {
            match prices.get(holding.symbol()).copied() {
                Some(price) if price.is_finite() && price > 0.0 => {
                    positions.push(ValuedHolding {
                        symbol: holding.symbol().to_string(),
                        quantity: holding.quantity(),
                        average_cost: holding.average_cost(),
                        current_price: price,
                        current_value: holding.quantity() * price,
                        weight: 0.0,
                    });
                }
                _ => excluded.push(holding.symbol().to_string()),
            }
        }

        let total_value: f64 = positions.iter().map(|p| p.current_value).sum();
        if total_value > 0.0 {
            for position in &mut positions {
                position.weight = position.current_value / total_value;
            }
        }

        let total_cost: f64 = positions.iter().map(ValuedHolding::cost_basis).sum();
        let unrealized_gain = total_value - total_cost;
        let unrealized_gain_pct = if total_cost > 0.0 {
            unrealized_gain / total_cost
        } else {
            0.0
        };

        let real_estate_funds = holdings
            .iter()
            .map(Holding::symbol)
            .filter(|symbol| is_real_estate_fund(symbol))
            .map(str::to_string)
            .collect();

        Ok(Self {
            positions,
            excluded,
            real_estate_funds,
            total_value,
            total_cost,
            unrealized_gain,
            unrealized_gain_pct,
        })
    }

    pub fn weights(&self) -> Vec<f64> {
        self.positions.iter().map(|p| p.weight).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() || self.total_value <= 0.0
    }
}

fn is_real_estate_fund(symbol: &str) -> bool {
    symbol.len() > 2 && symbol.ends_with("11")
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimationResult {
    pub initial_value: f64,
    pub daily_drift: f64,
    pub daily_volatility: f64,
    pub blended_dividend_yield: f64,
}

impl EstimationResult {
    pub const fn empty() -> Self {
        Self {
            initial_value: 0.0,
            daily_drift: 0.0,
            daily_volatility: 0.0,
            blended_dividend_yield: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.initial_value == 0.0
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let fields = [
            ("initial value", self.initial_value),
            ("daily drift", self.daily_drift),
            ("daily volatility", self.daily_volatility),
            ("dividend yield", self.blended_dividend_yield),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(ProjectionError::invalid_estimation(format!(
                    "{name} must be finite"
                )));
            }
        }
        if self.initial_value < 0.0 {
            return Err(ProjectionError::invalid_estimation(
                "initial value must be >= 0",
            ));
        }
        if self.daily_volatility < 0.0 {
            return Err(ProjectionError::invalid_estimation(
                "daily volatility must be >= 0",
            ));
        }
        if self.blended_dividend_yield < 0.0 {
            return Err(ProjectionError::invalid_estimation(
                "dividend yield must be >= 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub horizon_years: u32,
    pub monthly_contribution: f64,
    pub simulation_count: u32,
    pub reinvest_dividends: bool,
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.horizon_years == 0 {
            return Err(ProjectionError::invalid_configuration(
                "horizon_years must be >= 1",
            ));
        }
        if self.simulation_count == 0 {
            return Err(ProjectionError::invalid_configuration(
                "simulation_count must be >= 1",
            ));
        }
        if !self.monthly_contribution.is_finite() || self.monthly_contribution < 0.0 {
            return Err(ProjectionError::invalid_configuration(
                "monthly_contribution must be >= 0",
            ));
        }
        if self.path_cells().is_none() {
            return Err(ProjectionError::invalid_configuration(format!(
                "{} years x {} simulations does not fit in one ensemble buffer",
                self.horizon_years, self.simulation_count
            )));
        }
        Ok(())
    }

    /// Saturates on targets whose `usize` cannot hold the count; `validate`
    /// rejects those configurations.
    pub fn trading_days(&self) -> usize {
        (self.horizon_years as usize).saturating_mul(TRADING_DAYS_PER_YEAR as usize)
    }

    pub fn contribution_months(&self) -> usize {
        self.trading_days() / TRADING_DAYS_PER_MONTH as usize
    }

    /// Entries per ensemble matrix, `(trading_days + 1) * simulation_count`, or
    /// `None` when that many `f64`s cannot be addressed.
    pub fn path_cells(&self) -> Option<usize> {
        let days = (self.horizon_years as usize)
            .checked_mul(TRADING_DAYS_PER_YEAR as usize)?
            .checked_add(1)?;
        let cells = days.checked_mul(self.simulation_count as usize)?;
        let bytes = cells.checked_mul(std::mem::size_of::<f64>())?;
        (bytes <= isize::MAX as usize).then_some(cells)
    }
}

/// Value and cumulative-dividend paths for every simulation. Each matrix is one
/// dense buffer laid out simulation-major: `day_count` entries per simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationEnsemble {
    day_count: usize,
    simulation_count: usize,
    invested_capital: f64,
    values: Vec<f64>,
    dividends: Vec<f64>,
}

impl SimulationEnsemble {
    pub(crate) fn from_buffers(
        day_count: usize,
        simulation_count: usize,
        invested_capital: f64,
        values: Vec<f64>,
        dividends: Vec<f64>,
    ) -> Self {
        debug_assert_eq!(values.len(), day_count * simulation_count);
        debug_assert_eq!(dividends.len(), day_count * simulation_count);
        Self {
            day_count,
            simulation_count,
            invested_capital,
            values,
            dividends,
        }
    }

    /// Number of recorded days, day 0 included.
    pub fn day_count(&self) -> usize {
        self.day_count
    }

    pub fn simulation_count(&self) -> usize {
        self.simulation_count
    }

    /// Initial value plus every scheduled contribution.
    pub fn invested_capital(&self) -> f64 {
        self.invested_capital
    }

    pub fn value_at(&self, day: usize, sim: usize) -> f64 {
        self.values[sim * self.day_count + day]
    }

    pub fn dividends_at(&self, day: usize, sim: usize) -> f64 {
        self.dividends[sim * self.day_count + day]
    }

    pub fn value_path(&self, sim: usize) -> &[f64] {
        &self.values[sim * self.day_count..(sim + 1) * self.day_count]
    }

    pub fn dividend_path(&self, sim: usize) -> &[f64] {
        &self.dividends[sim * self.day_count..(sim + 1) * self.day_count]
    }

    pub fn values_on_day(&self, day: usize) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().skip(day).step_by(self.day_count).copied()
    }

    pub fn dividends_on_day(&self, day: usize) -> impl Iterator<Item = f64> + '_ {
        self.dividends.iter().skip(day).step_by(self.day_count).copied()
    }

    pub fn terminal_values(&self) -> Vec<f64> {
        self.values_on_day(self.day_count - 1).collect()
    }

    pub fn terminal_dividends(&self) -> Vec<f64> {
        self.dividends_on_day(self.day_count - 1).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileBands {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathBands {
    pub p10: Vec<f64>,
    pub p50: Vec<f64>,
    pub p90: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DividendProjection {
    pub average_total: f64,
    pub average_annual: f64,
    pub average_monthly: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryReport {
    pub terminal: PercentileBands,
    pub terminal_mean: f64,
    pub probability_of_loss: f64,
    pub terminal_values: Vec<f64>,
    pub terminal_histogram: Vec<HistogramBin>,
    pub path_bands: PathBands,
    pub dividends: DividendProjection,
}
