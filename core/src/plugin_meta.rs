//! Static plugin metadata: everything about a plugin that can be described
//! data-only, independent of the `Box<dyn Plugin>` factory that constructs
//! running instances (that lives daemon-side, next to the trait itself,
//! since it has to talk to runtime collaborators this crate doesn't know
//! about).

use serde::{Deserialize, Serialize};

use crate::config_schema::ConfigSchema;
use crate::event::EventType;

/// A single admin-invokable command a plugin instance exposes, e.g. through
/// a chat-command prefix or an external control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginCommand {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<PluginCommandArg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginCommandArg {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// Static description of a connector a plugin instance needs wired in
/// before it can run (e.g. a command-protocol client handle, a log-plane
/// subscription). Named rather than typed so the schema stays data-only;
/// the daemon's plugin host resolves these names to real handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredConnector {
    CommandClient,
    LogTail,
}

/// Everything about a plugin that can be known without instantiating it:
/// identity, the config shape it expects, what it subscribes to on the
/// bus, what connectors it needs, and what commands it exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub allow_multiple_instances: bool,
    #[serde(default)]
    pub required_connectors: Vec<RequiredConnector>,
    /// A long-running plugin keeps its own background work loop (timers,
    /// periodic polling) in addition to reacting to bus events.
    #[serde(default)]
    pub long_running: bool,
    pub config_schema: ConfigSchema,
    #[serde(default)]
    pub subscribed_event_types: Vec<EventType>,
    #[serde(default)]
    pub commands: Vec<PluginCommand>,
}

impl PluginDefinition {
    /// A plugin that wants every event type (empty subscription list in
    /// the data model means "all", matching `EventFilter`'s convention).
    pub fn subscribes_to_all(&self) -> bool {
        self.subscribed_event_types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_subscription_list_means_all_event_types() {
        let def = PluginDefinition {
            id: "noop".into(),
            name: "Noop".into(),
            description: String::new(),
            version: "0.1.0".into(),
            allow_multiple_instances: false,
            required_connectors: vec![],
            long_running: false,
            config_schema: vec![],
            subscribed_event_types: vec![],
            commands: vec![],
        };
        assert!(def.subscribes_to_all());
    }

    #[test]
    fn non_empty_subscription_list_is_not_all() {
        let def = PluginDefinition {
            id: "noop".into(),
            name: "Noop".into(),
            description: String::new(),
            version: "0.1.0".into(),
            allow_multiple_instances: false,
            required_connectors: vec![],
            long_running: false,
            config_schema: vec![],
            subscribed_event_types: vec![EventType::ChatMessage],
            commands: vec![],
        };
        assert!(!def.subscribes_to_all());
    }
}
