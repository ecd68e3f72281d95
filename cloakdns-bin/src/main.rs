use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cloakdns_proxy::{Config, Proxy};

mod service;
mod systemd;

/// cloakdns - an encrypting DNS proxy for the loopback interface
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "cloakdns.yaml")]
    config: String,

    /// Test the configuration and exit
    #[arg(short, long)]
    test_config: bool,

    /// Control the system service instead of running in the foreground
    #[arg(long, value_enum)]
    service: Option<service::ServiceAction>,
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Some(action) = args.service {
        service::control(action, &args.config)?;
        return Ok(());
    }

    let config_content = fs::read_to_string(&args.config)
        .with_context(|| format!("cannot read configuration [{}]", args.config))?;
    let config: Config = serde_yaml::from_str(&config_content)
        .with_context(|| format!("cannot parse configuration [{}]", args.config))?;

    if args.test_config {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
        println!("Configuration test passed");
        return Ok(());
    }

    tracing::info!("starting cloakdns {}", env!("CARGO_PKG_VERSION"));
    let proxy = Arc::new(Proxy::new(config)?);
    let live = proxy.clone().start().await?;

    if live > 0 {
        systemd::notify_ready();
    } else {
        // Readiness follows the first successful refresh.
        let proxy = proxy.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if proxy.live_servers() > 0 {
                    systemd::notify_ready();
                    return;
                }
            }
        });
    }

    wait_for_signal().await;
    tracing::info!("quit signal received, shutting down");
    proxy.stop();
    Ok(())
}
