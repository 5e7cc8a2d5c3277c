pub mod config;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use config::{InstanceRegistry, ServerRegistry, TomlStore};

use crate::actor::{Actor, ReconfigureOutcome};
use crate::bus::EventBus;
use crate::command::manager::CommandManager;
use crate::log::manager::LogManager;
use crate::plugin::api::{AdminDirectory, PluginKvStore};
use crate::store::ColumnarSink;

/// Root entry point for all managed daemon state. Passed as `Arc<SystemState>`
/// to every supervised component: command clients, log sources, plugin
/// instances.
pub struct SystemState {
    pub bus: EventBus,
    pub servers: Arc<dyn ServerRegistry>,
    pub instances: Arc<dyn InstanceRegistry>,
    pub columnar: Arc<dyn ColumnarSink>,
    pub command: Arc<CommandManager>,
    pub logs: Arc<LogManager>,
    pub kv_store: Arc<dyn PluginKvStore>,
    pub admin_directory: Arc<dyn AdminDirectory>,
    actors: RwLock<HashMap<String, (Box<dyn Actor>, Arc<AtomicBool>)>>,
}

impl SystemState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: EventBus,
        store: Arc<TomlStore>,
        columnar: Arc<dyn ColumnarSink>,
        command: Arc<CommandManager>,
        logs: Arc<LogManager>,
        kv_store: Arc<dyn PluginKvStore>,
        admin_directory: Arc<dyn AdminDirectory>,
    ) -> Self {
        Self {
            bus,
            servers: store.clone() as Arc<dyn ServerRegistry>,
            instances: store as Arc<dyn InstanceRegistry>,
            columnar,
            command,
            logs,
            kv_store,
            admin_directory,
            actors: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_actor(&self, id: String, actor: Box<dyn Actor>, shutdown: Arc<AtomicBool>) {
        self.actors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (actor, shutdown));
    }

    pub fn actor_ids(&self) -> Vec<String> {
        self.actors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn reconfigure_actor(&self, id: &str, state: &Arc<SystemState>) -> Option<ReconfigureOutcome> {
        let guard = self.actors.read().unwrap_or_else(|e| e.into_inner());
        guard.get(id).map(|(a, _)| a.reconfigure(state))
    }

    pub fn stop_actor(&self, id: &str) {
        let guard = self.actors.read().unwrap_or_else(|e| e.into_inner());
        if let Some((actor, shutdown)) = guard.get(id) {
            shutdown.store(true, Ordering::Relaxed);
            actor.stop();
        }
    }

    pub fn remove_actor(&self, id: &str) -> Option<Box<dyn Actor>> {
        self.actors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|(a, _)| a)
    }
}
