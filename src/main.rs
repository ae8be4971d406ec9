//! TheHub - main entry point.
//!
//! Boots the Cores described by the manifest, then serves one transport:
//! - `--stdio`: Content-Length framed JSON-RPC on stdin/stdout
//! - `--ws <port>`: WebSocket plus `/healthz` and `/metrics`

use clap::builder::BoolishValueParser;
use clap::{CommandFactory, Parser};
use std::path::PathBuf;
use std::time::Duration;

use thehub::ipc::{serve_stdio, serve_ws};
use thehub::types::Secret;
use thehub::{Hub, HubConfig, Manifest};

/// Exit status for an invalid or missing manifest at boot.
const EXIT_CONFIG: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "thehub", version, about = "Tool gateway over supervised Core processes")]
struct Cli {
    /// Serve Content-Length framed JSON-RPC on stdin/stdout.
    #[arg(long, conflicts_with = "ws")]
    stdio: bool,

    /// Serve WebSocket clients on this port.
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "3000")]
    ws: Option<u16>,

    /// Bind address for the WebSocket listener.
    #[arg(long, env = "HUB_BIND", default_value = "0.0.0.0")]
    host: String,

    /// Manifest describing the Cores to run.
    #[arg(long, env = "HUB_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Shared bearer token required from WebSocket clients.
    #[arg(long, env = "HUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Per-connection tools/call rate (requests per second, 0 disables).
    #[arg(long, env = "HUB_RATE_LIMIT_RPS", default_value_t = 0)]
    rate_limit_rps: u32,

    /// Per-connection cap on outstanding tools/call requests.
    #[arg(long, env = "HUB_MAX_CONCURRENCY_PER_CLIENT", default_value_t = 4)]
    max_concurrency_per_client: usize,

    /// Enable the hub/test/exit method.
    #[arg(long, env = "HUB_ALLOW_TEST_SHUTDOWN", value_parser = BoolishValueParser::new())]
    allow_test_shutdown: bool,

    /// Deadline for a forwarded tools/call.
    #[arg(long, env = "HUB_CALL_TIMEOUT", default_value = "30s", value_parser = humantime_serde::re::humantime::parse_duration)]
    call_timeout: Duration,

    /// Deadline for each Core handshake step.
    #[arg(long, env = "HUB_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = humantime_serde::re::humantime::parse_duration)]
    handshake_timeout: Duration,

    /// Print the manifest JSON Schema and exit.
    #[arg(long)]
    print_manifest_schema: bool,
}

impl Cli {
    fn hub_config(&self) -> HubConfig {
        HubConfig {
            manifest_path: self.manifest.clone(),
            token: self.token.clone().filter(|t| !t.is_empty()).map(Secret::new),
            rate_limit_rps: self.rate_limit_rps,
            max_concurrency_per_client: self.max_concurrency_per_client,
            allow_test_shutdown: self.allow_test_shutdown,
            call_timeout: self.call_timeout,
            handshake_timeout: self.handshake_timeout,
            ..HubConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    let code = run(Cli::parse()).await;
    // Exit explicitly: a pending blocking stdin read would otherwise hold the runtime open.
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    thehub::observability::init_tracing();

    if cli.print_manifest_schema {
        match serde_json::to_string_pretty(&Manifest::json_schema()) {
            Ok(schema) => println!("{}", schema),
            Err(e) => {
                eprintln!("failed to render schema: {}", e);
                return 1;
            }
        }
        return 0;
    }

    if !cli.stdio && cli.ws.is_none() {
        let _ = Cli::command().print_help();
        println!();
        return 0;
    }

    let config = cli.hub_config();
    tracing::info!(?config, "Starting hub");
    let hub = Hub::new(config);

    match hub.boot().await {
        Ok(report) => {
            tracing::info!(cores = report.added.len(), failed = report.failed.len(), "Cores booted");
        }
        Err(e) => {
            tracing::error!(error = %e, "manifest_invalid");
            return EXIT_CONFIG;
        }
    }

    if let Err(e) = hub.spawn_manifest_watcher() {
        tracing::warn!(error = %e, "Manifest hot reload disabled");
    }

    let token = hub.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        token.cancel();
    });

    let served = if cli.stdio {
        serve_stdio(hub.clone()).await
    } else {
        let port = cli.ws.unwrap_or(3000);
        match tokio::net::TcpListener::bind((cli.host.as_str(), port)).await {
            Ok(listener) => serve_ws(hub.clone(), listener).await,
            Err(e) => Err(e.into()),
        }
    };

    hub.shutdown().await;
    match served {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "Transport failed");
            1
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
