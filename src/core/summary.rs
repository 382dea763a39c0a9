use rayon::prelude::*;
use tracing::debug;

use super::engine::{PathSimulator, ShockSource};
use super::error::Result;
use super::types::{
    DividendProjection, EstimationResult, HistogramBin, PathBands, PercentileBands,
    SimulationConfig, SimulationEnsemble, SummaryReport,
};

pub const HISTOGRAM_BINS: usize = 100;

#[derive(Debug, Clone)]
pub struct Projection {
    pub estimation: EstimationResult,
    pub report: SummaryReport,
    pub ensemble: Option<SimulationEnsemble>,
}

/// Simulates and summarizes in one step. The ensemble is dropped unless
/// `keep_ensemble` is set.
pub fn project<S: ShockSource>(
    simulator: &PathSimulator<S>,
    estimation: &EstimationResult,
    config: &SimulationConfig,
    keep_ensemble: bool,
) -> Result<Projection> {
    let ensemble = simulator.run(estimation, config)?;
    let report = summarize(&ensemble, config.horizon_years);
    Ok(Projection {
        estimation: *estimation,
        report,
        ensemble: keep_ensemble.then_some(ensemble),
    })
}

pub fn summarize(ensemble: &SimulationEnsemble, horizon_years: u32) -> SummaryReport {
    let terminal_values = ensemble.terminal_values();
    let mut sorted = terminal_values.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let terminal = bands_of_sorted(&sorted);

    let n = terminal_values.len() as f64;
    let terminal_mean = terminal_values.iter().sum::<f64>() / n;
    let invested = ensemble.invested_capital();
    let losses = terminal_values.iter().filter(|v| **v < invested).count();

    let average_total = ensemble.terminal_dividends().iter().sum::<f64>() / n;
    let average_annual = average_total / horizon_years.max(1) as f64;
    let dividends = DividendProjection {
        average_total,
        average_annual,
        average_monthly: average_annual / 12.0,
    };

    let report = SummaryReport {
        terminal,
        terminal_mean,
        probability_of_loss: losses as f64 / n,
        terminal_histogram: histogram(&sorted, HISTOGRAM_BINS),
        terminal_values,
        path_bands: path_bands(ensemble),
        dividends,
    };
    debug!(
        p10 = report.terminal.p10,
        p50 = report.terminal.p50,
        p90 = report.terminal.p90,
        "summarized ensemble"
    );
    report
}

/// Linear-interpolation percentile, `p` in 0..=100. Sorts `values` in place.
pub fn percentile(values: &mut [f64], p: f64) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    percentile_of_sorted(values, p)
}

fn percentile_of_sorted(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        let (lo, hi) = (values[lower], values[upper]);
        (lo + (hi - lo) * w).max(lo).min(hi)
    }
}

fn bands_of_sorted(sorted: &[f64]) -> PercentileBands {
    PercentileBands {
        p10: percentile_of_sorted(sorted, 10.0),
        p50: percentile_of_sorted(sorted, 50.0),
        p90: percentile_of_sorted(sorted, 90.0),
    }
}

fn path_bands(ensemble: &SimulationEnsemble) -> PathBands {
    let simulations = ensemble.simulation_count();
    let per_day: Vec<PercentileBands> = (0..ensemble.day_count())
        .into_par_iter()
        .map_init(
            || Vec::with_capacity(simulations),
            |scratch, day| {
                scratch.clear();
                scratch.extend(ensemble.values_on_day(day));
                scratch.sort_by(|a, b| a.total_cmp(b));
                bands_of_sorted(scratch)
            },
        )
        .collect();

    let mut bands = PathBands {
        p10: Vec::with_capacity(per_day.len()),
        p50: Vec::with_capacity(per_day.len()),
        p90: Vec::with_capacity(per_day.len()),
    };
    for day in per_day {
        bands.p10.push(day.p10);
        bands.p50.push(day.p50);
        bands.p90.push(day.p90);
    }
    bands
}

// Equal-width bins over [min, max] of the finite values. A flat distribution
// collapses to a single bin.
fn histogram(sorted: &[f64], bins: usize) -> Vec<HistogramBin> {
    let finite: Vec<f64> = sorted.iter().copied().filter(|v| v.is_finite()).collect();
    let (Some(&min), Some(&max)) = (finite.first(), finite.last()) else {
        return Vec::new();
    };

    let width = (max - min) / bins as f64;
    if bins == 0 || width <= 0.0 || !width.is_finite() {
        return vec![HistogramBin {
            lower: min,
            upper: max,
            count: finite.len() as u32,
        }];
    }

    let mut out: Vec<HistogramBin> = (0..bins)
        .map(|idx| HistogramBin {
            lower: min + width * idx as f64,
            upper: if idx + 1 == bins {
                max
            } else {
                min + width * (idx + 1) as f64
            },
            count: 0,
        })
        .collect();
    for value in finite {
        let idx = (((value - min) / width).floor() as usize).min(bins - 1);
        out[idx].count += 1;
    }
    out
}
