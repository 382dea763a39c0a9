use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use projection::api::{
    ServerConfig, SimulationDefaults, parse_payload, run_http_server, run_projection,
};
use projection::core::AbortSignal;

#[derive(Parser, Debug)]
#[command(
    name = "projection",
    about = "Monte Carlo portfolio projection with monthly contributions and dividends"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the projection HTTP API
    Serve {
        #[arg(long, env = "PROJECTION_PORT", default_value_t = 8080)]
        port: u16,
        #[arg(
            long,
            env = "PROJECTION_RUN_TIMEOUT_SECS",
            default_value_t = 60,
            help = "Abort a projection that runs longer than this"
        )]
        run_timeout_secs: u64,
        #[command(flatten)]
        defaults: SimulationDefaults,
    },
    /// Run one projection from a JSON request file and print the result
    Run {
        #[arg(long)]
        input: PathBuf,
        #[command(flatten)]
        defaults: SimulationDefaults,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    projection::telemetry::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            run_timeout_secs,
            defaults,
        } => {
            run_http_server(ServerConfig {
                port,
                run_timeout: Duration::from_secs(run_timeout_secs),
                defaults,
            })
            .await
            .context("HTTP server failed")?;
        }
        Command::Run { input, defaults } => {
            let json = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let request = parse_payload(&json, &defaults).map_err(anyhow::Error::msg)?;
            let response =
                tokio::task::spawn_blocking(move || run_projection(&request, &AbortSignal::new()))
                    .await??;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}
