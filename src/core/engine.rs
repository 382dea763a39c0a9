use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::{debug, warn};

use super::error::{ProjectionError, Result};
use super::types::{
    EstimationResult, SimulationConfig, SimulationEnsemble, TRADING_DAYS_PER_MONTH,
};

/// A sequence of standard-normal shocks for one simulated path.
pub trait ShockStream {
    fn next_shock(&mut self) -> f64;
}

/// Hands out one independent shock stream per simulation index.
pub trait ShockSource: Sync {
    type Stream: ShockStream;

    fn stream(&self, simulation_index: u32) -> Self::Stream;
}

pub struct RngShocks<R>(R);

impl<R: Rng> RngShocks<R> {
    pub fn new(rng: R) -> Self {
        Self(rng)
    }
}

impl<R: Rng> ShockStream for RngShocks<R> {
    fn next_shock(&mut self) -> f64 {
        self.0.sample(StandardNormal)
    }
}

/// Reproducible shocks: each simulation index gets its own generator seeded
/// from the base seed, so output does not depend on how paths are scheduled.
#[derive(Debug, Clone, Copy)]
pub struct SeededShocks {
    seed: u64,
}

impl SeededShocks {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl ShockSource for SeededShocks {
    type Stream = RngShocks<StdRng>;

    fn stream(&self, simulation_index: u32) -> Self::Stream {
        RngShocks::new(StdRng::seed_from_u64(derive_seed(
            self.seed,
            simulation_index,
        )))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EntropyShocks;

impl ShockSource for EntropyShocks {
    type Stream = RngShocks<StdRng>;

    fn stream(&self, _simulation_index: u32) -> Self::Stream {
        RngShocks::new(StdRng::from_entropy())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct PathSimulator<S> {
    source: S,
    abort: Option<AbortSignal>,
}

#[derive(Debug, Clone, Copy)]
struct StepParams {
    initial_value: f64,
    drift: f64,
    volatility: f64,
    monthly_dividend_rate: f64,
    monthly_contribution: f64,
    reinvest_dividends: bool,
}

impl StepParams {
    fn new(estimation: &EstimationResult, config: &SimulationConfig) -> Self {
        Self {
            initial_value: estimation.initial_value,
            drift: estimation.daily_drift,
            volatility: estimation.daily_volatility,
            monthly_dividend_rate: (1.0 + estimation.blended_dividend_yield).powf(1.0 / 12.0)
                - 1.0,
            monthly_contribution: config.monthly_contribution,
            reinvest_dividends: config.reinvest_dividends,
        }
    }
}

impl<S: ShockSource> PathSimulator<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            abort: None,
        }
    }

    /// Checked before each path starts; a path already in progress runs to the end.
    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    pub fn run(
        &self,
        estimation: &EstimationResult,
        config: &SimulationConfig,
    ) -> Result<SimulationEnsemble> {
        config.validate()?;
        estimation.validate()?;
        if estimation.is_empty() {
            warn!("refusing to simulate an empty portfolio");
            return Err(ProjectionError::EmptyPortfolio);
        }

        let day_count = config.trading_days() + 1;
        let simulations = config.simulation_count as usize;
        let cells = day_count * simulations;
        let params = StepParams::new(estimation, config);
        debug!(
            simulations,
            days = day_count - 1,
            drift = params.drift,
            volatility = params.volatility,
            reinvest = params.reinvest_dividends,
            "starting path simulation"
        );

        let mut values = zeroed_buffer(cells)?;
        let mut dividends = zeroed_buffer(cells)?;
        let completed = AtomicU32::new(0);

        let outcome = values
            .par_chunks_mut(day_count)
            .zip(dividends.par_chunks_mut(day_count))
            .enumerate()
            .try_for_each(|(sim, (value_path, dividend_path))| {
                if self.abort.as_ref().is_some_and(AbortSignal::is_aborted) {
                    return Err(());
                }
                let mut shocks = self.source.stream(sim as u32);
                simulate_path(&params, &mut shocks, value_path, dividend_path);
                completed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });

        if outcome.is_err() {
            let completed = completed.load(Ordering::Relaxed);
            warn!(
                completed,
                requested = config.simulation_count,
                "path simulation aborted"
            );
            return Err(ProjectionError::Aborted {
                completed,
                requested: config.simulation_count,
            });
        }

        let invested_capital = estimation.initial_value
            + config.monthly_contribution * config.contribution_months() as f64;
        Ok(SimulationEnsemble::from_buffers(
            day_count,
            simulations,
            invested_capital,
            values,
            dividends,
        ))
    }
}

// Arithmetic daily return on the running value. No flooring: a path may cross
// zero and keep going.
fn simulate_path<T: ShockStream>(
    params: &StepParams,
    shocks: &mut T,
    values: &mut [f64],
    dividends: &mut [f64],
) {
    let month = TRADING_DAYS_PER_MONTH as usize;
    let mut value = params.initial_value;
    let mut cumulative_dividends = 0.0;
    values[0] = value;
    dividends[0] = 0.0;

    for day in 1..values.len() {
        let z = shocks.next_shock();
        value *= 1.0 + params.drift + params.volatility * z;

        if day % month == 0 {
            let dividend = value * params.monthly_dividend_rate;
            cumulative_dividends += dividend;
            value += params.monthly_contribution;
            if params.reinvest_dividends {
                value += dividend;
            }
        }

        values[day] = value;
        dividends[day] = cumulative_dividends;
    }
}

fn zeroed_buffer(cells: usize) -> Result<Vec<f64>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(cells).map_err(|_| {
        ProjectionError::invalid_configuration(format!(
            "cannot allocate {cells} path cells"
        ))
    })?;
    buffer.resize(cells, 0.0);
    Ok(buffer)
}

fn derive_seed(base_seed: u64, simulation_index: u32) -> u64 {
    let index = simulation_index as u64;
    splitmix64(splitmix64(base_seed) ^ (index << 32) ^ index)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    struct ConstantShocks(f64);

    impl ShockStream for ConstantShocks {
        fn next_shock(&mut self) -> f64 {
            self.0
        }
    }

    impl ShockSource for ConstantShocks {
        type Stream = ConstantShocks;

        fn stream(&self, _simulation_index: u32) -> Self::Stream {
            ConstantShocks(self.0)
        }
    }

    fn flat_estimation() -> EstimationResult {
        EstimationResult {
            initial_value: 10_000.0,
            daily_drift: 0.0,
            daily_volatility: 0.0,
            blended_dividend_yield: 0.0,
        }
    }

    fn one_year_config() -> SimulationConfig {
        SimulationConfig {
            horizon_years: 1,
            monthly_contribution: 100.0,
            simulation_count: 1,
            reinvest_dividends: false,
        }
    }

    fn volatile_estimation() -> EstimationResult {
        EstimationResult {
            initial_value: 50_000.0,
            daily_drift: 0.0004,
            daily_volatility: 0.015,
            blended_dividend_yield: 0.06,
        }
    }

    #[test]
    fn flat_portfolio_steps_up_by_the_contribution_each_month() {
        let ensemble = PathSimulator::new(SeededShocks::new(1))
            .run(&flat_estimation(), &one_year_config())
            .expect("run");

        assert_eq!(ensemble.day_count(), 253);
        assert_eq!(ensemble.value_at(252, 0), 11_200.0);
        for day in 1..=252 {
            let step = ensemble.value_at(day, 0) - ensemble.value_at(day - 1, 0);
            if day % 21 == 0 {
                assert_eq!(step, 100.0, "day {day}");
            } else {
                assert_eq!(step, 0.0, "day {day}");
            }
        }
    }

    #[test]
    fn reinvestment_without_yield_changes_nothing() {
        let config = one_year_config();
        let reinvesting = SimulationConfig {
            reinvest_dividends: true,
            ..config
        };
        let simulator = PathSimulator::new(SeededShocks::new(1));
        let plain = simulator.run(&flat_estimation(), &config).expect("run");
        let reinvested = simulator.run(&flat_estimation(), &reinvesting).expect("run");

        assert_eq!(plain, reinvested);
        assert_eq!(reinvested.value_at(252, 0), 11_200.0);
        assert_eq!(reinvested.dividends_at(252, 0), 0.0);
    }

    #[test]
    fn dividends_accrue_monthly_and_are_reinvested_when_asked() {
        let estimation = EstimationResult {
            blended_dividend_yield: 0.12,
            ..flat_estimation()
        };
        let config = SimulationConfig {
            monthly_contribution: 0.0,
            reinvest_dividends: true,
            ..one_year_config()
        };
        let ensemble = PathSimulator::new(ConstantShocks(0.0))
            .run(&estimation, &config)
            .expect("run");

        let rate = 1.12_f64.powf(1.0 / 12.0) - 1.0;
        assert_eq!(ensemble.dividends_at(20, 0), 0.0);
        assert_eq!(ensemble.dividends_at(21, 0), 10_000.0 * rate);
        assert_eq!(ensemble.value_at(21, 0), 10_000.0 + 10_000.0 * rate);
        // Twelve months of reinvested monthly yield compound to the annual yield.
        assert!((ensemble.value_at(252, 0) - 11_200.0).abs() < 1e-6);

        let kept = PathSimulator::new(ConstantShocks(0.0))
            .run(
                &estimation,
                &SimulationConfig {
                    reinvest_dividends: false,
                    ..config
                },
            )
            .expect("run");
        assert_eq!(kept.value_at(252, 0), 10_000.0);
        assert!((kept.dividends_at(252, 0) - 12.0 * 10_000.0 * rate).abs() < 1e-9);
    }

    #[test]
    fn every_path_starts_at_the_initial_value_with_no_dividends() {
        let config = SimulationConfig {
            simulation_count: 64,
            ..one_year_config()
        };
        let ensemble = PathSimulator::new(SeededShocks::new(9))
            .run(&volatile_estimation(), &config)
            .expect("run");

        assert!(ensemble.values_on_day(0).all(|v| v == 50_000.0));
        assert!(ensemble.dividends_on_day(0).all(|d| d == 0.0));
        assert_eq!(ensemble.simulation_count(), 64);
    }

    #[test]
    fn identical_seeds_reproduce_bit_identical_ensembles() {
        let config = SimulationConfig {
            simulation_count: 40,
            horizon_years: 2,
            ..one_year_config()
        };
        let a = PathSimulator::new(SeededShocks::new(42))
            .run(&volatile_estimation(), &config)
            .expect("run");
        let b = PathSimulator::new(SeededShocks::new(42))
            .run(&volatile_estimation(), &config)
            .expect("run");
        let c = PathSimulator::new(SeededShocks::new(43))
            .run(&volatile_estimation(), &config)
            .expect("run");

        assert_eq!(a, b);
        assert_ne!(a.terminal_values(), c.terminal_values());
    }

    #[test]
    fn output_does_not_depend_on_thread_count() {
        let config = SimulationConfig {
            simulation_count: 32,
            ..one_year_config()
        };
        let parallel = PathSimulator::new(SeededShocks::new(5))
            .run(&volatile_estimation(), &config)
            .expect("run");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .expect("pool");
        let serial = pool
            .install(|| {
                PathSimulator::new(SeededShocks::new(5)).run(&volatile_estimation(), &config)
            })
            .expect("run");

        assert_eq!(parallel, serial);
    }

    #[test]
    fn simulation_paths_are_independent() {
        let config = SimulationConfig {
            simulation_count: 2,
            ..one_year_config()
        };
        let ensemble = PathSimulator::new(SeededShocks::new(3))
            .run(&volatile_estimation(), &config)
            .expect("run");
        assert_ne!(ensemble.value_path(0), ensemble.value_path(1));
    }

    #[test]
    fn adverse_shocks_can_drive_value_negative() {
        let estimation = EstimationResult {
            daily_volatility: 0.5,
            ..flat_estimation()
        };
        let config = SimulationConfig {
            monthly_contribution: 0.0,
            ..one_year_config()
        };
        let ensemble = PathSimulator::new(ConstantShocks(-4.0))
            .run(&estimation, &config)
            .expect("run");

        assert_eq!(ensemble.value_at(1, 0), -10_000.0);
        assert_eq!(ensemble.value_at(2, 0), 10_000.0);
    }

    #[test]
    fn empty_portfolio_is_reported_distinctly() {
        let err = PathSimulator::new(SeededShocks::new(1))
            .run(&EstimationResult::empty(), &one_year_config())
            .unwrap_err();
        assert_eq!(err, ProjectionError::EmptyPortfolio);

        let zero_contribution = SimulationConfig {
            monthly_contribution: 0.0,
            ..one_year_config()
        };
        assert!(
            PathSimulator::new(SeededShocks::new(1))
                .run(&flat_estimation(), &zero_contribution)
                .is_ok()
        );
    }

    #[test]
    fn configuration_errors_are_reported_before_anything_runs() {
        let config = SimulationConfig {
            simulation_count: 0,
            ..one_year_config()
        };
        let err = PathSimulator::new(SeededShocks::new(1))
            .run(&EstimationResult::empty(), &config)
            .unwrap_err();
        assert!(matches!(err, ProjectionError::InvalidConfiguration { .. }));
    }

    #[test]
    fn oversized_ensembles_are_rejected_before_allocation() {
        let config = SimulationConfig {
            horizon_years: u32::MAX,
            simulation_count: u32::MAX,
            ..one_year_config()
        };
        let err = PathSimulator::new(SeededShocks::new(1))
            .run(&flat_estimation(), &config)
            .unwrap_err();
        assert!(matches!(err, ProjectionError::InvalidConfiguration { .. }));
    }

    #[test]
    fn derived_seeds_do_not_alias_across_base_seeds() {
        assert_ne!(derive_seed(0x1_0000_0001, 0), derive_seed(0, 1));
        assert_ne!(derive_seed(1, 0), derive_seed(0, 1));
        assert_ne!(derive_seed(7, 0), derive_seed(7, 1));
    }

    #[test]
    fn non_finite_or_negative_parameters_are_rejected() {
        for estimation in [
            EstimationResult {
                daily_drift: f64::NAN,
                ..flat_estimation()
            },
            EstimationResult {
                daily_volatility: -0.01,
                ..flat_estimation()
            },
            EstimationResult {
                initial_value: -1.0,
                ..flat_estimation()
            },
        ] {
            let err = PathSimulator::new(SeededShocks::new(1))
                .run(&estimation, &one_year_config())
                .unwrap_err();
            assert!(matches!(err, ProjectionError::InvalidEstimation { .. }));
        }
    }

    #[test]
    fn tripped_abort_signal_stops_the_run() {
        let signal = AbortSignal::new();
        signal.abort();
        let config = SimulationConfig {
            simulation_count: 100,
            ..one_year_config()
        };
        let err = PathSimulator::new(SeededShocks::new(1))
            .with_abort_signal(signal)
            .run(&volatile_estimation(), &config)
            .unwrap_err();
        assert_eq!(
            err,
            ProjectionError::Aborted {
                completed: 0,
                requested: 100
            }
        );
    }

    #[test]
    fn untripped_abort_signal_is_harmless() {
        let ensemble = PathSimulator::new(SeededShocks::new(1))
            .with_abort_signal(AbortSignal::new())
            .run(&flat_estimation(), &one_year_config())
            .expect("run");
        assert_eq!(ensemble.value_at(252, 0), 11_200.0);
    }

    #[test]
    fn entropy_shocks_produce_finite_paths() {
        let config = SimulationConfig {
            simulation_count: 4,
            ..one_year_config()
        };
        let ensemble = PathSimulator::new(EntropyShocks)
            .run(&volatile_estimation(), &config)
            .expect("run");
        assert!(ensemble.terminal_values().iter().all(|v| v.is_finite()));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(32))]

        #[test]
        fn prop_zero_volatility_paths_follow_deterministic_growth(
            seed in any::<u64>(),
            initial in 1u32..1_000_000,
            drift_bp in -20i32..20,
            contribution in 0u32..5_000,
            simulations in 1u32..12,
            horizon_years in 1u32..3,
        ) {
            let estimation = EstimationResult {
                initial_value: initial as f64,
                daily_drift: drift_bp as f64 / 10_000.0,
                daily_volatility: 0.0,
                blended_dividend_yield: 0.0,
            };
            let config = SimulationConfig {
                horizon_years,
                monthly_contribution: contribution as f64,
                simulation_count: simulations,
                reinvest_dividends: true,
            };
            let ensemble = PathSimulator::new(SeededShocks::new(seed))
                .run(&estimation, &config)
                .expect("run");

            let mut expected = vec![estimation.initial_value];
            let mut value = estimation.initial_value;
            for day in 1..ensemble.day_count() {
                value *= 1.0 + estimation.daily_drift;
                if day % 21 == 0 {
                    value += config.monthly_contribution;
                }
                expected.push(value);
            }

            for sim in 0..ensemble.simulation_count() {
                prop_assert_eq!(ensemble.value_path(sim), expected.as_slice());
                prop_assert!(ensemble.dividend_path(sim).iter().all(|d| *d == 0.0));
            }
        }

        #[test]
        fn prop_day_zero_is_seeded_for_every_simulation(
            seed in any::<u64>(),
            initial in 1u32..1_000_000,
            vol_bp in 0u32..500,
            simulations in 1u32..16,
        ) {
            let estimation = EstimationResult {
                initial_value: initial as f64,
                daily_drift: 0.0002,
                daily_volatility: vol_bp as f64 / 10_000.0,
                blended_dividend_yield: 0.05,
            };
            let config = SimulationConfig {
                horizon_years: 1,
                monthly_contribution: 250.0,
                simulation_count: simulations,
                reinvest_dividends: false,
            };
            let ensemble = PathSimulator::new(SeededShocks::new(seed))
                .run(&estimation, &config)
                .expect("run");
            for sim in 0..ensemble.simulation_count() {
                prop_assert_eq!(ensemble.value_at(0, sim), initial as f64);
                prop_assert_eq!(ensemble.dividends_at(0, sim), 0.0);
            }
        }
    }
}
