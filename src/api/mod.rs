use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Json, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Args;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::core::{
    AbortSignal, EntropyShocks, EstimationResult, EstimatorInput, Holding, MarketHistory,
    PathSimulator, PortfolioSnapshot, ProjectionError, SeededShocks, SimulationConfig,
    SummaryReport, estimate, project,
};

pub const MAX_SIMULATIONS: u32 = 50_000;
pub const MAX_HORIZON_YEARS: u32 = 50;
pub const MAX_PATH_CELLS: usize = 80_000_000;

#[derive(Args, Debug, Clone, PartialEq)]
pub struct SimulationDefaults {
    #[arg(long, env = "PROJECTION_HORIZON_YEARS", default_value_t = 10)]
    pub horizon_years: u32,
    #[arg(long, env = "PROJECTION_MONTHLY_CONTRIBUTION", default_value_t = 500.0)]
    pub monthly_contribution: f64,
    #[arg(long, env = "PROJECTION_SIMULATIONS", default_value_t = 1_000)]
    pub simulations: u32,
    #[arg(
        long,
        env = "PROJECTION_SEED",
        help = "Fixed seed; random paths differ per run when unset"
    )]
    pub seed: Option<u64>,
    #[arg(long, help = "Keep dividends as cash instead of reinvesting them")]
    pub no_reinvest: bool,
}

impl Default for SimulationDefaults {
    fn default() -> Self {
        Self {
            horizon_years: 10,
            monthly_contribution: 500.0,
            simulations: 1_000,
            seed: None,
            no_reinvest: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub run_timeout: Duration,
    pub defaults: SimulationDefaults,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HoldingPayload {
    symbol: String,
    quantity: f64,
    average_cost: f64,
    current_price: Option<f64>,
    closes: Vec<f64>,
    dividend_yield: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatisticsPayload {
    initial_value: f64,
    daily_drift: f64,
    daily_volatility: f64,
    dividend_yield: f64,
}

impl From<StatisticsPayload> for EstimationResult {
    fn from(value: StatisticsPayload) -> Self {
        EstimationResult {
            initial_value: value.initial_value,
            daily_drift: value.daily_drift,
            daily_volatility: value.daily_volatility,
            blended_dividend_yield: value.dividend_yield,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectionPayload {
    holdings: Option<Vec<HoldingPayload>>,
    statistics: Option<StatisticsPayload>,
    horizon_years: Option<u32>,
    monthly_contribution: Option<f64>,
    simulations: Option<u32>,
    reinvest_dividends: Option<bool>,
    seed: Option<u64>,
    include_paths: Option<bool>,
}

// Flat variant for GET requests; query strings cannot carry holdings.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ProjectionQuery {
    initial_value: Option<f64>,
    daily_drift: Option<f64>,
    daily_volatility: Option<f64>,
    dividend_yield: Option<f64>,
    horizon_years: Option<u32>,
    monthly_contribution: Option<f64>,
    simulations: Option<u32>,
    reinvest_dividends: Option<bool>,
    seed: Option<u64>,
    include_paths: Option<bool>,
}

impl From<ProjectionQuery> for ProjectionPayload {
    fn from(query: ProjectionQuery) -> Self {
        let statistics = query.initial_value.map(|initial_value| StatisticsPayload {
            initial_value,
            daily_drift: query.daily_drift.unwrap_or(0.0),
            daily_volatility: query.daily_volatility.unwrap_or(0.0),
            dividend_yield: query.dividend_yield.unwrap_or(0.0),
        });
        ProjectionPayload {
            holdings: None,
            statistics,
            horizon_years: query.horizon_years,
            monthly_contribution: query.monthly_contribution,
            simulations: query.simulations,
            reinvest_dividends: query.reinvest_dividends,
            seed: query.seed,
            include_paths: query.include_paths,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PortfolioInput {
    Holdings {
        holdings: Vec<Holding>,
        prices: HashMap<String, f64>,
        histories: HashMap<String, MarketHistory>,
    },
    Statistics(EstimationResult),
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub portfolio: PortfolioInput,
    pub config: SimulationConfig,
    pub seed: Option<u64>,
    pub include_paths: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionResponse {
    pub snapshot: Option<PortfolioSnapshot>,
    pub estimation: EstimationResult,
    pub config: SimulationConfig,
    pub seed: Option<u64>,
    pub report: SummaryReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_paths: Option<Vec<Vec<f64>>>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn parse_payload(json: &str, defaults: &SimulationDefaults) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<ProjectionPayload>(json)
        .map_err(|e| format!("Invalid projection JSON payload: {e}"))?;
    api_request_from_payload(payload, defaults)
}

pub fn api_request_from_payload(
    payload: ProjectionPayload,
    defaults: &SimulationDefaults,
) -> Result<ApiRequest, String> {
    let config = SimulationConfig {
        horizon_years: payload.horizon_years.unwrap_or(defaults.horizon_years),
        monthly_contribution: payload
            .monthly_contribution
            .unwrap_or(defaults.monthly_contribution),
        simulation_count: payload.simulations.unwrap_or(defaults.simulations),
        reinvest_dividends: payload.reinvest_dividends.unwrap_or(!defaults.no_reinvest),
    };
    config.validate().map_err(|e| e.to_string())?;

    if config.simulation_count > MAX_SIMULATIONS {
        return Err(format!("simulations must be <= {MAX_SIMULATIONS}"));
    }
    if config.horizon_years > MAX_HORIZON_YEARS {
        return Err(format!("horizonYears must be <= {MAX_HORIZON_YEARS}"));
    }
    let cells = config.path_cells().unwrap_or(usize::MAX);
    if cells > MAX_PATH_CELLS {
        return Err(format!(
            "simulations x trading days must be <= {MAX_PATH_CELLS}, got {cells}"
        ));
    }

    let portfolio = match (payload.holdings, payload.statistics) {
        (Some(_), Some(_)) => {
            return Err("send either holdings or statistics, not both".to_string());
        }
        (None, None) => return Err("either holdings or statistics is required".to_string()),
        (None, Some(statistics)) => PortfolioInput::Statistics(statistics.into()),
        (Some(rows), None) => {
            let mut holdings = Vec::with_capacity(rows.len());
            let mut prices = HashMap::with_capacity(rows.len());
            let mut histories = HashMap::with_capacity(rows.len());
            for row in rows {
                let holding = Holding::new(&row.symbol, row.quantity, row.average_cost)
                    .map_err(|e| e.to_string())?;
                let symbol = holding.symbol().to_string();
                if let Some(price) = row.current_price {
                    prices.insert(symbol.clone(), price);
                }
                histories.insert(
                    symbol,
                    MarketHistory {
                        closes: row.closes,
                        dividend_yield: row.dividend_yield,
                    },
                );
                holdings.push(holding);
            }
            PortfolioInput::Holdings {
                holdings,
                prices,
                histories,
            }
        }
    };

    Ok(ApiRequest {
        portfolio,
        config,
        seed: payload.seed.or(defaults.seed),
        include_paths: payload.include_paths.unwrap_or(false),
    })
}

pub fn run_projection(
    request: &ApiRequest,
    signal: &AbortSignal,
) -> Result<ProjectionResponse, ProjectionError> {
    let (snapshot, estimation) = match &request.portfolio {
        PortfolioInput::Holdings {
            holdings,
            prices,
            histories,
        } => {
            let snapshot = PortfolioSnapshot::value(holdings, prices)?;
            if !snapshot.excluded.is_empty() {
                info!(excluded = ?snapshot.excluded, "holdings without a current price left out");
            }
            let input = EstimatorInput::from_snapshot(&snapshot, histories)?;
            let estimation = estimate(&input)?;
            (Some(snapshot), estimation)
        }
        PortfolioInput::Statistics(estimation) => (None, *estimation),
    };

    let projection = match request.seed {
        Some(seed) => project(
            &PathSimulator::new(SeededShocks::new(seed)).with_abort_signal(signal.clone()),
            &estimation,
            &request.config,
            request.include_paths,
        )?,
        None => project(
            &PathSimulator::new(EntropyShocks).with_abort_signal(signal.clone()),
            &estimation,
            &request.config,
            request.include_paths,
        )?,
    };

    let value_paths = projection.ensemble.as_ref().map(|ensemble| {
        (0..ensemble.simulation_count())
            .map(|sim| ensemble.value_path(sim).to_vec())
            .collect()
    });

    Ok(ProjectionResponse {
        snapshot,
        estimation,
        config: request.config,
        seed: request.seed,
        report: projection.report,
        value_paths,
    })
}

pub fn router(config: ServerConfig) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route(
            "/api/projection",
            get(projection_get_handler).post(projection_post_handler),
        )
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(config))
}

pub async fn run_http_server(config: ServerConfig) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let port = config.port;
    let app = router(config);

    let listener = TcpListener::bind(addr).await?;
    info!("Projection HTTP API listening on http://{addr}");
    info!("Local access: http://127.0.0.1:{port}/api/health");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, HealthResponse { status: "ok" })
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn projection_get_handler(
    State(config): State<Arc<ServerConfig>>,
    Query(query): Query<ProjectionQuery>,
) -> Response {
    projection_handler_impl(config, query.into()).await
}

async fn projection_post_handler(
    State(config): State<Arc<ServerConfig>>,
    Json(payload): Json<ProjectionPayload>,
) -> Response {
    projection_handler_impl(config, payload).await
}

async fn projection_handler_impl(
    config: Arc<ServerConfig>,
    payload: ProjectionPayload,
) -> Response {
    let request = match api_request_from_payload(payload, &config.defaults) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let signal = AbortSignal::new();
    let watchdog = {
        let signal = signal.clone();
        let timeout = config.run_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            signal.abort();
        })
    };
    let outcome =
        tokio::task::spawn_blocking(move || run_projection(&request, &signal)).await;
    watchdog.abort();

    match outcome {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(err)) => {
            warn!(error = %err, "projection failed");
            error_response(status_for(&err), &err.to_string())
        }
        Err(join_err) => {
            error!(error = %join_err, "projection task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

fn status_for(err: &ProjectionError) -> StatusCode {
    match err {
        ProjectionError::EmptyPortfolio => StatusCode::UNPROCESSABLE_ENTITY,
        ProjectionError::Aborted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
