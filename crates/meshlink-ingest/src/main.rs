//! Meshlink webhook ingest binary

use anyhow::Context;
use clap::Parser;
use meshlink_core::MqttConnector;
use meshlink_ingest::{create_router, AppState, HealthMode, IngestConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshlink-ingest")]
#[command(about = "Republishes chat webhook updates onto MQTT")]
struct Args {
    /// JSON configuration file
    #[arg(long, short, env = "MESHLINK_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long, env = "MESHLINK_BIND")]
    bind: Option<SocketAddr>,

    /// Broker host
    #[arg(long, env = "MESHLINK_MQTT_HOST")]
    mqtt_host: Option<String>,

    /// Broker port
    #[arg(long, env = "MESHLINK_MQTT_PORT")]
    mqtt_port: Option<u16>,

    /// Broker user name
    #[arg(long, env = "MESHLINK_MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// Broker password
    #[arg(long, env = "MESHLINK_MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    /// Connect over TLS
    #[arg(long, env = "MESHLINK_MQTT_TLS")]
    tls: bool,

    /// Accept a broker certificate outside the system trust store
    #[arg(long, env = "MESHLINK_MQTT_INSECURE")]
    insecure: bool,

    /// PEM certificate trusted for the broker connection
    #[arg(long, env = "MESHLINK_MQTT_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// Shared secret expected in the webhook header
    #[arg(long, env = "MESHLINK_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// How gateway liveness is aggregated for /health
    #[arg(long, value_enum, env = "MESHLINK_HEALTH_MODE")]
    health_mode: Option<HealthMode>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<IngestConfig> {
        let mut config = match &self.config {
            Some(path) => IngestConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => IngestConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(host) = &self.mqtt_host {
            config.link.host = host.clone();
        }
        if let Some(port) = self.mqtt_port {
            config.link.port = port;
        }
        if self.mqtt_username.is_some() {
            config.link.username = self.mqtt_username.clone();
        }
        if self.mqtt_password.is_some() {
            config.link.password = self.mqtt_password.clone();
        }
        if self.tls {
            config.link.use_tls = true;
        }
        if self.insecure {
            config.link.accept_untrusted_certs = true;
        }
        if self.ca_file.is_some() {
            config.link.ca_file = self.ca_file.clone();
        }
        if self.webhook_secret.is_some() {
            config.webhook_secret = self.webhook_secret.clone();
        }
        if let Some(mode) = self.health_mode {
            config.health.mode = mode;
        }
        // The ingest side always starts a clean session
        config.link.clean_session = true;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.load_config()?;
    info!("Starting Meshlink ingest {}", meshlink_ingest::VERSION);
    if config.webhook_secret.is_none() {
        info!("Webhook secret validation disabled");
    }

    let state = AppState::new(&config, Arc::new(MqttConnector::new()));
    state.start()?;

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!("Listening on http://{}", config.bind);
    axum::serve(listener, create_router(state.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    state.link.shutdown().await;
    Ok(())
}
