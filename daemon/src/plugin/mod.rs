pub mod api;
pub mod instance;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use aegis_core::{ConfigValue, PluginDefinition, ServerId};
use tokio::sync::RwLock;
use uuid::Uuid;

pub use instance::{InstanceError, NoopHandler, PluginContext, PluginHandler, PluginInstance, PluginInstanceStatus};
pub use registry::PluginRegistry;

use crate::state::SystemState;

/// Owns the global plugin registry plus every live instance, and is the
/// thing the daemon's reconciler talks to when plugin instance config
/// changes on disk.
pub struct PluginHost {
    registry: RwLock<PluginRegistry>,
    instances: RwLock<HashMap<Uuid, Arc<PluginInstance>>>,
}

impl Default for PluginHost {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginHost {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(PluginRegistry::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_definition(&self, definition: PluginDefinition) {
        self.registry.write().await.register(definition);
    }

    pub async fn definition(&self, plugin_id: &str) -> Option<PluginDefinition> {
        self.registry.read().await.get(plugin_id).cloned()
    }

    /// Build, validate, and start a new instance. `handler` is the
    /// in-process implementation backing `plugin_id` — plugins are linked
    /// into the daemon binary rather than loaded dynamically, so the caller
    /// (the reconciler that reads `plugin_instances` out of the config
    /// store) supplies it.
    pub async fn start_instance(
        &self,
        state: Arc<SystemState>,
        instance_id: Uuid,
        server_id: ServerId,
        plugin_id: &str,
        handler: Arc<dyn PluginHandler>,
        config: ConfigValue,
        available_connectors: &[aegis_core::RequiredConnector],
    ) -> Result<(), InstanceError> {
        let definition = {
            let registry = self.registry.read().await;
            registry
                .get(plugin_id)
                .cloned()
                .ok_or_else(|| InstanceError::UnknownPlugin(plugin_id.to_string()))?
        };
        let instance = Arc::new(PluginInstance::new(
            instance_id,
            server_id,
            Arc::new(definition),
            handler,
            config,
        )?);
        instance.check_connectors(available_connectors)?;

        let actor: Arc<PluginInstance> = Arc::clone(&instance);
        state.register_actor(
            instance_id.to_string(),
            Box::new(actor),
            Arc::new(std::sync::atomic::AtomicBool::new(false)),
        );
        instance.start(Arc::clone(&state));

        self.instances.write().await.insert(instance_id, instance);
        Ok(())
    }

    pub async fn stop_instance(&self, state: &Arc<SystemState>, instance_id: Uuid) {
        state.stop_actor(&instance_id.to_string());
        state.remove_actor(&instance_id.to_string());
        self.instances.write().await.remove(&instance_id);
    }

    pub async fn status(&self, instance_id: Uuid) -> Option<PluginInstanceStatus> {
        let instances = self.instances.read().await;
        match instances.get(&instance_id) {
            Some(instance) => Some(instance.status().await),
            None => None,
        }
    }

    pub async fn update_instance_config(
        &self,
        instance_id: Uuid,
        config: ConfigValue,
    ) -> Option<Result<crate::actor::ReconfigureOutcome, InstanceError>> {
        let instances = self.instances.read().await;
        match instances.get(&instance_id) {
            Some(instance) => Some(instance.update_config(config).await),
            None => None,
        }
    }

    pub async fn instance_ids(&self) -> Vec<Uuid> {
        self.instances.read().await.keys().copied().collect()
    }
}
