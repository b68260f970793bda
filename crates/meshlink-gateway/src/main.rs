//! Meshlink gateway binary

use anyhow::Context;
use clap::Parser;
use meshlink_core::{GatewayConfig, MqttConnector, PlaintextCodec, RegistrationStorage};
use meshlink_gateway::{Gateway, LogNotifier};
use meshlink_state::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshlink-gateway")]
#[command(about = "Bridges chat updates and a Meshtastic mesh over MQTT")]
struct Args {
    /// JSON configuration file
    #[arg(long, short, env = "MESHLINK_CONFIG")]
    config: Option<PathBuf>,

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

    /// Gateway node id on the mesh (`!1234abcd`)
    #[arg(long, env = "MESHLINK_GATEWAY_ID")]
    gateway_id: Option<String>,

    /// Database path
    #[arg(long, env = "MESHLINK_DB", default_value = "meshlink.db")]
    db: PathBuf,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => GatewayConfig::default(),
        };
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
        if let Some(id) = &self.gateway_id {
            config.mesh.gateway_id = id.clone();
        }
        // QoS 1 traffic must survive short outages on the gateway side
        config.link.clean_session = false;
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
    info!(
        "Starting Meshlink gateway {} ({})",
        config.mesh.gateway_id,
        meshlink_gateway::VERSION
    );

    let store = SqliteStore::new(&args.db).await?;
    info!("Database initialized: {}", args.db.display());
    let storage: Arc<dyn RegistrationStorage> = Arc::new(store.clone());

    let gateway = Gateway::new(
        config,
        Arc::new(MqttConnector::new()),
        storage,
        Arc::new(LogNotifier),
        Arc::new(PlaintextCodec),
    )?;
    gateway.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    gateway.shutdown().await;
    store.close().await;
    Ok(())
}
