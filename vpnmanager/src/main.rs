use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vpnmanager::cli::{AllowAction, Cli, Command};
use vpnmanager::config;
use vpnmanager::domain_set::DomainAllowSet;
use vpnmanager::gateway::Gateway;
use vpnmanager::probe::PingReachability;
use vpnmanager::runtime::Controller;
use vpnmanager_core::ManagerConfig;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = <Cli as clap::Parser>::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        Command::InitConfig { force } => {
            config::save(&config_path, &ManagerConfig::default(), force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        Command::CheckConfig => {
            let cfg = config::load_validated(&config_path)?;
            print!("{}", cfg.base_table().render());
            Ok(())
        }
        Command::Allow { action } => {
            let set = DomainAllowSet::new(Gateway::process());
            match action {
                AllowAction::Add { ips } => set.add(&ips).await,
                AllowAction::Remove { ips } => set.remove(&ips).await,
                AllowAction::Flush => set.flush().await,
            }
        }
        Command::Run => run(&config_path).await,
    }
}

async fn run(config_path: &Path) -> Result<()> {
    let cfg = config::load_validated(config_path)?;
    let (_watcher, mut changes) = config::watch(config_path, cfg.clone())?;

    let controller = Controller::new(Gateway::process(), Arc::new(PingReachability));
    controller.start(cfg).await.context("failed to start")?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
            Some(cfg) = changes.recv() => {
                if let Err(e) = controller.reload(ManagerConfig::clone(&cfg)).await {
                    tracing::error!(error = %format!("{e:#}"), "reload failed");
                }
            }
        }
    }

    controller.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
