//! Global `plugin_id -> PluginDefinition` mapping, populated at startup.

use std::collections::HashMap;

use aegis_core::PluginDefinition;

#[derive(Default)]
pub struct PluginRegistry {
    definitions: HashMap<String, PluginDefinition>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: PluginDefinition) {
        self.definitions.insert(definition.id.clone(), definition);
    }

    pub fn get(&self, plugin_id: &str) -> Option<&PluginDefinition> {
        self.definitions.get(plugin_id)
    }

    pub fn list(&self) -> Vec<&PluginDefinition> {
        self.definitions.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> PluginDefinition {
        PluginDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            version: "0.1.0".into(),
            allow_multiple_instances: false,
            required_connectors: vec![],
            long_running: false,
            config_schema: vec![],
            subscribed_event_types: vec![],
            commands: vec![],
        }
    }

    #[test]
    fn register_then_get_round_trips() {
        let mut registry = PluginRegistry::new();
        registry.register(sample("chat-logger"));
        assert!(registry.get("chat-logger").is_some());
        assert!(registry.get("missing").is_none());
    }
}
