use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod actor;
mod bus;
mod command;
mod ingester;
mod log;
mod plugin;
mod state;
mod store;

use bus::EventBus;
use command::manager::CommandManager;
use ingester::{Ingester, IngesterConfig};
use log::manager::LogManager;
use plugin::{NoopHandler, PluginHost};
use plugin::api::{InMemoryAdminDirectory, InMemoryPluginKvStore};
use state::SystemState;
use state::config::{InstanceRegistry, ServerRegistry, TomlStore};
use store::{ColumnarSink, InMemoryColumnarSink};

#[derive(Parser, Debug, Clone)]
#[command(name = "aegis-daemon", about = "Squad Aegis event plane daemon")]
struct Cli {
    /// Config file path (default: platform config dir / aegis/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("aegis_daemon=info,aegis_core=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(state::config::default_config_path);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config_path))
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let store = Arc::new(TomlStore::new(config_path));
    let bus = EventBus::default();

    let command_manager = Arc::new(CommandManager::new(bus.clone()));
    let log_manager = Arc::new(LogManager::new(bus.clone(), None));
    let columnar: Arc<dyn ColumnarSink> = Arc::new(InMemoryColumnarSink::new());
    let kv_store = Arc::new(InMemoryPluginKvStore::default());
    let admin_directory = Arc::new(InMemoryAdminDirectory::default());

    let servers = store.list().await;
    command_manager.connect_all(&servers).await;
    log_manager.connect_all(&servers).await;

    let state = Arc::new(SystemState::new(
        bus.clone(),
        Arc::clone(&store),
        Arc::clone(&columnar),
        Arc::clone(&command_manager),
        Arc::clone(&log_manager),
        kv_store,
        admin_directory,
    ));

    let plugin_host = Arc::new(PluginHost::new());
    start_persisted_plugin_instances(&plugin_host, &store, &state).await;

    let ingester = Ingester::start(bus.clone(), columnar, IngesterConfig::default());

    tracing::info!(servers = servers.len(), "aegis-daemon started");

    // The command/log managers and plugin host are self-supervising
    // background tasks once started; hold them alive for the process
    // lifetime without driving them further from here.
    let _ = (&state, &plugin_host);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining ingester");
    ingester.shutdown().await;
    bus.shutdown().await;
    Ok(())
}

/// Starts one actor per enabled row of the persisted instance table. No
/// concrete plugin handler is linked into this binary yet, so every
/// instance runs behind [`NoopHandler`] — a definition is registered on the
/// fly for any `plugin_id` the registry doesn't already know, so a
/// persisted instance for an unrecognized plugin still starts rather than
/// silently staying dead.
async fn start_persisted_plugin_instances(plugin_host: &Arc<PluginHost>, store: &Arc<TomlStore>, state: &Arc<SystemState>) {
    let entries = InstanceRegistry::list(store.as_ref()).await;
    for entry in entries {
        if !entry.enabled {
            continue;
        }
        if plugin_host.definition(&entry.plugin_id).await.is_none() {
            plugin_host
                .register_definition(aegis_core::PluginDefinition {
                    id: entry.plugin_id.clone(),
                    name: entry.plugin_id.clone(),
                    description: String::new(),
                    version: "0.0.0".into(),
                    allow_multiple_instances: true,
                    required_connectors: vec![],
                    long_running: false,
                    config_schema: vec![],
                    subscribed_event_types: vec![],
                    commands: vec![],
                })
                .await;
        }
        let result = plugin_host
            .start_instance(
                Arc::clone(state),
                entry.id,
                entry.server_id,
                &entry.plugin_id,
                Arc::new(NoopHandler),
                entry.config.clone(),
                &[],
            )
            .await;
        if let Err(e) = result {
            tracing::warn!("failed to start persisted plugin instance {} ({}): {e}", entry.id, entry.plugin_id);
        }
    }
}
