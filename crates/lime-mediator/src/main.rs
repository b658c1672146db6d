//! LIME mediator: accepts mutually authenticated agent connections,
//! monitors their liveness and dispatches work to them.

mod cli;

use crate::cli::{Cli, Commands};
use clap::Parser;
use lime_mediator::config::{self, load_config, load_tls};
use lime_mediator::ConfigDirectory;
use lime_types::config::MediatorConfig;
use lime_wire::tls::{load_certs, thumbprint};
use lime_wire::{GatewayConfig, Mediator, TlsMaterial};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let result = match cli.command {
        Commands::Run => cmd_run(cli.config.as_deref()),
        Commands::CheckConfig => cmd_check_config(cli.config.as_deref()),
        Commands::Thumbprint { pem } => cmd_thumbprint(&pem),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_all(path: Option<&Path>) -> Result<(MediatorConfig, TlsMaterial), String> {
    let config = load_config(path).map_err(|e| e.to_string())?;
    let tls = load_tls(&config).map_err(|e| e.to_string())?;
    Ok((config, tls))
}

fn cmd_run(path: Option<&Path>) -> Result<(), String> {
    let (config, tls) = load_all(path)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("starting runtime: {e}"))?;

    runtime.block_on(async move {
        let directory = Arc::new(ConfigDirectory::from_records(&config.agents));
        if directory.is_empty() {
            info!("No agents registered; every connection will be refused");
        }
        let validator = Arc::new(tls.root_validator());
        let (mediator, accept_task) =
            Mediator::start(GatewayConfig::from(&config), tls, directory, validator)
                .await
                .map_err(|e| e.to_string())?;

        shutdown_signal().await;
        mediator.shutdown().await;
        if let Err(e) = accept_task.await {
            error!(error = %e, "Accept loop panicked");
        }

        let health = mediator.health();
        info!(
            accepted = health.accepted,
            refused = health.refused,
            tasks = health.tasks_dispatched,
            tasks_dropped = health.tasks_dropped,
            "LIME mediator stopped"
        );
        Ok::<(), String>(())
    })
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

fn cmd_check_config(path: Option<&Path>) -> Result<(), String> {
    let (config, tls) = load_all(path)?;
    for (key, value) in config::summary(&config) {
        println!("{key:>14}: {value}");
    }
    println!("{:>14}: {}", "root thumbprint", tls.root_thumbprint());
    println!("{:>14}: {}", "server leaf", tls.leaf_thumbprint());
    for agent in &config.agents {
        println!("  agent {} ({}) at {} -> {}", agent.name, agent.id, agent.address, agent.thumbprint);
    }
    println!("Configuration OK");
    Ok(())
}

fn cmd_thumbprint(pem: &Path) -> Result<(), String> {
    let certs = load_certs(pem).map_err(|e| e.to_string())?;
    for cert in &certs {
        println!("{}", thumbprint(cert));
    }
    Ok(())
}
