//! Per-instance lifecycle: validate config against a [`PluginDefinition`]'s
//! schema, subscribe to the bus on start, dispatch each matching event to a
//! handler, and tear the subscription down on stop. One instance owns
//! exactly one live bus subscription, scoped to its server and filtered to
//! its declared event types.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use aegis_core::{
    ConfigValidationError, ConfigValue, Event, EventFilter, PluginDefinition, RequiredConnector,
    ServerId,
};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::actor::{Actor, ReconfigureOutcome};
use crate::bus::EventBus;
use crate::plugin::api::{AdminApi, DatabaseApi, KvScope, LogApi, RconApi, ServerApi};
use crate::state::SystemState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginInstanceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("config validation failed: {0}")]
    InvalidConfig(#[from] ConfigValidationError),
    #[error("missing required connector: {0:?}")]
    MissingConnector(RequiredConnector),
    #[error("unknown plugin id: {0}")]
    UnknownPlugin(String),
}

/// Collaborator surfaces handed to a handler on every dispatch.
pub struct PluginContext {
    pub rcon: RconApi,
    pub server: ServerApi,
    pub database: DatabaseApi,
    pub log: LogApi,
    pub admin: AdminApi,
}

/// What a concrete plugin implements: react to one event at a time. Handler
/// errors are logged and the instance stays live; a panic inside this call
/// is caught at the dispatch boundary and moves the instance to `Error`.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    async fn handle_event(&self, event: &Event, ctx: &PluginContext) -> anyhow::Result<()>;
}

/// A no-op handler for plugin definitions registered without a bundled
/// implementation (configuration-only or placeholder entries).
pub struct NoopHandler;

#[async_trait]
impl PluginHandler for NoopHandler {
    async fn handle_event(&self, _event: &Event, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct PluginInstance {
    pub instance_id: Uuid,
    pub server_id: ServerId,
    definition: Arc<PluginDefinition>,
    handler: Arc<dyn PluginHandler>,
    config: Mutex<ConfigValue>,
    status: Arc<RwLock<PluginInstanceStatus>>,
    running: Arc<AtomicBool>,
    /// Held with a blocking mutex, not a tokio one, so the synchronous
    /// [`Actor::stop`] can take the handle and the stop signal off it
    /// without needing an `.await`.
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    stop_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl PluginInstance {
    pub fn new(
        instance_id: Uuid,
        server_id: ServerId,
        definition: Arc<PluginDefinition>,
        handler: Arc<dyn PluginHandler>,
        config: ConfigValue,
    ) -> Result<Self, InstanceError> {
        let filled = aegis_core::fill(&definition.config_schema, config);
        aegis_core::validate(&definition.config_schema, &filled)?;
        Ok(Self {
            instance_id,
            server_id,
            definition,
            handler,
            config: Mutex::new(filled),
            status: Arc::new(RwLock::new(PluginInstanceStatus::Stopped)),
            running: Arc::new(AtomicBool::new(false)),
            dispatcher: StdMutex::new(None),
            stop_tx: StdMutex::new(None),
        })
    }

    /// Confirm every connector this plugin needs is available before it's
    /// allowed to start.
    pub fn check_connectors(&self, available: &[RequiredConnector]) -> Result<(), InstanceError> {
        for needed in &self.definition.required_connectors {
            if !available.contains(needed) {
                return Err(InstanceError::MissingConnector(*needed));
            }
        }
        Ok(())
    }

    pub async fn status(&self) -> PluginInstanceStatus {
        self.status.read().await.clone()
    }

    fn subscription_filter(&self) -> EventFilter {
        if self.definition.subscribes_to_all() {
            EventFilter::all()
        } else {
            EventFilter::for_types(self.definition.subscribed_event_types.iter().copied())
        }
    }

    fn build_context(&self, state: &Arc<SystemState>) -> PluginContext {
        let scope = KvScope {
            server_id: self.server_id,
            plugin_id: self.definition.id.clone(),
            instance_id: self.instance_id,
        };
        PluginContext {
            rcon: RconApi::new(Arc::clone(&state.command), self.server_id),
            server: ServerApi::new(Arc::clone(&state.command), self.server_id),
            database: DatabaseApi::new(Arc::clone(&state.kv_store), scope),
            log: LogApi::new(self.instance_id),
            admin: AdminApi::new(Arc::clone(&state.admin_directory)),
        }
    }

    pub async fn update_config(&self, update: ConfigValue) -> Result<ReconfigureOutcome, InstanceError> {
        let mut current = self.config.lock().await;
        let merged = aegis_core::merge_preserving_sensitive(
            &self.definition.config_schema,
            &current,
            &update,
        );
        aegis_core::validate(&self.definition.config_schema, &merged)?;
        *current = merged;
        Ok(if self.definition.long_running {
            ReconfigureOutcome::RestartRequired
        } else {
            ReconfigureOutcome::Applied
        })
    }
}

impl Actor for PluginInstance {
    fn start(&self, state: Arc<SystemState>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop_tx);

        let bus: EventBus = state.bus.clone();
        let filter = self.subscription_filter();
        let server_id = self.server_id;
        let instance_id = self.instance_id;
        let handler = Arc::clone(&self.handler);
        let ctx = Arc::new(self.build_context(&state));
        let status = Arc::clone(&self.status);
        let running = Arc::clone(&self.running);

        let handle = tokio::spawn(async move {
            *status.write().await = PluginInstanceStatus::Starting;
            let mut subscription = bus
                .subscribe(filter, Some(server_id), crate::bus::DEFAULT_SUBSCRIBER_CAPACITY)
                .await;
            *status.write().await = PluginInstanceStatus::Running;

            while running.load(Ordering::SeqCst) {
                let event = tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    maybe_event = subscription.recv() => match maybe_event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let event_id = event.id;
                let dispatch_handler = Arc::clone(&handler);
                let dispatch_ctx = Arc::clone(&ctx);
                let result = tokio::spawn(async move {
                    dispatch_handler.handle_event(&event, &dispatch_ctx).await
                })
                .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(%event_id, instance_id = %instance_id, "plugin handler error: {e}");
                    }
                    Err(join_err) => {
                        tracing::error!(%event_id, instance_id = %instance_id, "plugin handler panicked: {join_err}");
                        *status.write().await = PluginInstanceStatus::Error(format!("handler panicked: {join_err}"));
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }

            *status.write().await = PluginInstanceStatus::Stopping;
            subscription.unsubscribe().await;
            let mut guard = status.write().await;
            if !matches!(*guard, PluginInstanceStatus::Error(_)) {
                *guard = PluginInstanceStatus::Stopped;
            }
        });

        *self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Signals the dispatcher to stop and blocks until it has unsubscribed
    /// from the bus, so that no event published after this call returns can
    /// still reach the handler.
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
        let handle = self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && let Ok(rt) = tokio::runtime::Handle::try_current()
        {
            tokio::task::block_in_place(|| {
                let _ = rt.block_on(handle);
            });
        }
    }

    fn reconfigure(&self, _state: &Arc<SystemState>) -> ReconfigureOutcome {
        if self.definition.long_running {
            ReconfigureOutcome::RestartRequired
        } else {
            ReconfigureOutcome::Applied
        }
    }
}

impl Actor for Arc<PluginInstance> {
    fn start(&self, state: Arc<SystemState>) {
        PluginInstance::start(self, state);
    }

    fn stop(&self) {
        PluginInstance::stop(self);
    }

    fn reconfigure(&self, state: &Arc<SystemState>) -> ReconfigureOutcome {
        PluginInstance::reconfigure(self, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::{ConfigField, FieldKind};

    fn sample_definition() -> PluginDefinition {
        PluginDefinition {
            id: "noop".into(),
            name: "Noop".into(),
            description: String::new(),
            version: "0.1.0".into(),
            allow_multiple_instances: true,
            required_connectors: vec![],
            long_running: false,
            config_schema: vec![ConfigField {
                name: "threshold".into(),
                kind: FieldKind::Int,
                required: false,
                default: Some(aegis_core::ConfigValue::Int(5)),
                sensitive: false,
                nested: None,
                pattern: None,
                min_items: None,
                max_items: None,
            }],
            subscribed_event_types: vec![],
            commands: vec![],
        }
    }

    #[test]
    fn new_instance_fills_config_defaults() {
        let def = Arc::new(sample_definition());
        let instance = PluginInstance::new(
            Uuid::new_v4(),
            ServerId::new(),
            def,
            Arc::new(NoopHandler),
            ConfigValue::Object(Default::default()),
        )
        .expect("valid config");
        assert_eq!(instance.status.try_read().unwrap().clone(), PluginInstanceStatus::Stopped);
    }

    #[test]
    fn missing_connector_is_rejected() {
        let mut def = sample_definition();
        def.required_connectors = vec![RequiredConnector::CommandClient];
        let instance = PluginInstance::new(
            Uuid::new_v4(),
            ServerId::new(),
            Arc::new(def),
            Arc::new(NoopHandler),
            ConfigValue::Object(Default::default()),
        )
        .unwrap();
        assert!(instance.check_connectors(&[]).is_err());
        assert!(instance.check_connectors(&[RequiredConnector::CommandClient]).is_ok());
    }

    struct CountingHandler(Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait]
    impl PluginHandler for CountingHandler {
        async fn handle_event(&self, _event: &Event, _ctx: &PluginContext) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_state(bus: EventBus) -> Arc<SystemState> {
        use crate::command::manager::CommandManager;
        use crate::log::manager::LogManager;
        use crate::plugin::api::{InMemoryAdminDirectory, InMemoryPluginKvStore};
        use crate::state::config::TomlStore;
        use crate::store::{ColumnarSink, InMemoryColumnarSink};

        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(TomlStore::new(dir.path().join("config.toml")));
        let command = Arc::new(CommandManager::new(bus.clone()));
        let logs = Arc::new(LogManager::new(bus.clone(), None));
        let columnar: Arc<dyn ColumnarSink> = Arc::new(InMemoryColumnarSink::new());
        let kv_store = Arc::new(InMemoryPluginKvStore::default());
        let admin_directory = Arc::new(InMemoryAdminDirectory::default());
        Arc::new(SystemState::new(bus, store, columnar, command, logs, kv_store, admin_directory))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_drains_the_dispatcher_before_returning() {
        let bus = EventBus::default();
        let state = test_state(bus.clone());
        let server_id = ServerId::new();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let instance = PluginInstance::new(
            Uuid::new_v4(),
            server_id,
            Arc::new(sample_definition()),
            Arc::new(CountingHandler(Arc::clone(&counter))),
            ConfigValue::Object(Default::default()),
        )
        .unwrap();

        instance.start(Arc::clone(&state));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(instance.status().await, PluginInstanceStatus::Running);

        instance.stop();
        assert_eq!(instance.status().await, PluginInstanceStatus::Stopped);

        bus.publish_event(Event::new(
            server_id,
            aegis_core::ChatMessagePayload {
                chat_type: "ChatAll".into(),
                player: aegis_core::PlayerRef {
                    engine_id: "e".into(),
                    platform_id: "p".into(),
                    name: None,
                    team_id: None,
                },
                message: "after stop".into(),
            },
        ));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
