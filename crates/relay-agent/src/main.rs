//! # relay-agent
//!
//! Relay server binary: loads settings, installs logging and metrics, and
//! serves the WebSocket gateway until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::agent::EchoAgent;
use relay_server::{RelayConfig, RelayServer};
use relay_settings::RelaySettings;

/// Time allowed for open sessions to wind down after ctrl-c.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Per-user isolated WebSocket relay.
#[derive(Parser, Debug)]
#[command(name = "relay-agent", about = "Per-user isolated WebSocket relay")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent connections (overrides settings).
    #[arg(long)]
    max_connections: Option<usize>,

    /// Delay between echo-agent events, in milliseconds.
    #[arg(long, default_value = "0")]
    echo_step_ms: u64,
}

impl Cli {
    fn load(&self) -> Result<RelaySettings> {
        let mut settings = match &self.settings {
            Some(path) => relay_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => relay_settings::load_settings().context("Failed to load settings")?,
        };
        self.apply_overrides(&mut settings);
        settings
            .validate()
            .context("Invalid settings after command-line overrides")?;
        Ok(settings)
    }

    fn apply_overrides(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(max) = self.max_connections {
            settings.server.max_connections = max;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load()?;

    relay_core::init_subscriber(&settings.logging.level, settings.logging.format);
    let metrics_handle = relay_server::metrics::install_recorder();

    let config = RelayConfig::from(&settings);
    let agent = Arc::new(EchoAgent::with_step_delay(Duration::from_millis(
        args.echo_step_ms,
    )));
    let server = RelayServer::new(config)
        .context("Invalid server configuration")?
        .with_agent(agent)
        .with_metrics(metrics_handle);

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        max_connections = settings.server.max_connections,
        "relay listening on ws://{addr}/ws"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    let drained = server.shutdown().drain(handle, SHUTDOWN_GRACE).await;
    let closed = server.pool().close_all().await;
    tracing::info!(drained, closed, "shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::try_parse_from(["relay-agent"]).unwrap();
        let mut settings = RelaySettings::default();
        cli.apply_overrides(&mut settings);
        assert_eq!(settings.server.port, RelaySettings::default().server.port);
        assert_eq!(cli.echo_step_ms, 0);
    }

    #[test]
    fn cli_overrides_win() {
        let cli = Cli::try_parse_from([
            "relay-agent",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--max-connections",
            "7",
        ])
        .unwrap();
        let mut settings = RelaySettings::default();
        cli.apply_overrides(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.max_connections, 7);
    }

    #[test]
    fn settings_file_is_loaded_then_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7001, "maxConnections": 3}}"#).unwrap();

        let cli = Cli::try_parse_from([
            "relay-agent",
            "--settings",
            path.to_str().unwrap(),
            "--max-connections",
            "9",
        ])
        .unwrap();
        let settings = cli.load().unwrap();
        assert_eq!(settings.server.max_connections, 9);
        // env overrides may apply on top of the file; only assert when unset
        if std::env::var_os("RELAY_PORT").is_none() {
            assert_eq!(settings.server.port, 7001);
        }
    }

    #[test]
    fn zero_connection_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "relay-agent",
            "--settings",
            dir.path().join("absent.json").to_str().unwrap(),
            "--max-connections",
            "0",
        ])
        .unwrap();
        assert!(cli.load().is_err());
    }

    #[test]
    fn missing_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "relay-agent",
            "--settings",
            dir.path().join("absent.json").to_str().unwrap(),
        ])
        .unwrap();
        let settings = cli.load().unwrap();
        assert_eq!(settings.emitter.delivery_retries, 3);
    }
}
