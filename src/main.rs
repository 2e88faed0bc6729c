mod catalog;
mod config;
mod http;
mod metrics;
mod poller;
mod stats;

use axum::serve;
use clap::Parser;
use config::Config;
use metrics::Metrics;
use poller::{Poller, TelemetryCommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tegrastatsd")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Overrides `interval_ms` from the config file.
    #[arg(long)]
    interval_ms: Option<u32>,
    /// Print the first parsed sample as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(interval_ms) = cli.interval_ms {
        cfg.interval_ms = interval_ms;
        if let Err(err) = cfg.validate() {
            error!(error = %err, "invalid --interval-ms");
            std::process::exit(1);
        }
    }

    let command = TelemetryCommand::new(
        cfg.tegrastats.path.clone(),
        cfg.tegrastats.extra_args.clone(),
    );
    let poller = Arc::new(Poller::new(command));

    if cli.once {
        std::process::exit(run_once(&poller, cfg.interval_ms).await);
    }

    info!(
        listen = %cfg.listen,
        interval_ms = cfg.interval_ms,
        tegrastats = %cfg.tegrastats.path,
        "starting tegrastatsd"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    // A launch failure leaves the daemon serving empty results, as an
    // unavailable telemetry source would.
    if let Err(err) = poller.start(cfg.interval_ms).await {
        error!(error = %err, "failed to start tegrastats");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let poller = poller.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, poller);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind HTTP listener");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);
    poller.stop().await;
    let _ = http_task.await;
}

async fn run_once(poller: &Poller, interval_ms: u32) -> i32 {
    if let Err(err) = poller.start(interval_ms).await {
        error!(error = %err, "failed to start tegrastats");
        return 1;
    }

    // Allow a few sampling periods for the first line to arrive.
    let wait = Duration::from_millis(u64::from(interval_ms) * 3) + Duration::from_secs(2);
    let sample = tokio::time::timeout(wait, poller.wait_for_snapshot()).await;
    poller.stop().await;

    match sample {
        Ok(Some(snapshot)) => match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(err) => {
                error!(error = %err, "failed to encode snapshot");
                1
            }
        },
        Ok(None) => {
            warn!("tegrastats exited before producing a usable line");
            1
        }
        Err(_) => {
            warn!(timeout_ms = wait.as_millis() as u64, "no usable tegrastats line in time");
            1
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
