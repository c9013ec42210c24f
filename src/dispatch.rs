//! State-change dispatcher: the seam between MQTT ingestion, the registry,
//! the WebSocket hub and the automation engine.
//!
//! For every inbound state message the old state is captured first, the new
//! state is applied under the registry lock, exactly one `device_update`
//! event goes out, and the automation engine is evaluated synchronously with
//! the `(old, new)` pair. Debounced button actions are the only work that
//! escapes onto separate tasks.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::automation::AutomationEngine;
use crate::registry::Registry;
use crate::websocket::WsHub;

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub property: String,
    pub old: Option<Value>,
    pub new: Value,
}

/// Per-property delta: every key of `new` whose value is absent from or
/// different in `old`.
pub fn diff(old: &Map<String, Value>, new: &Map<String, Value>) -> Vec<PropertyChange> {
    new.iter()
        .filter(|(key, value)| old.get(*key) != Some(value))
        .map(|(key, value)| PropertyChange {
            property: key.clone(),
            old: old.get(key).cloned(),
            new: value.clone(),
        })
        .collect()
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    hub: Arc<WsHub>,
    engine: Arc<AutomationEngine>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, hub: Arc<WsHub>, engine: Arc<AutomationEngine>) -> Self {
        Self {
            registry,
            hub,
            engine,
        }
    }

    pub async fn ingest(&self, device: &str, new_state: Map<String, Value>) {
        let Some(old_state) = self.registry.device_state(device) else {
            tracing::debug!(device = %device, "state update for unknown device ignored");
            return;
        };

        let changes = diff(&old_state, &new_state);

        if let Err(e) = self.registry.update_state(device, new_state.clone()) {
            tracing::error!(device = %device, "failed to apply state update: {}", e);
            return;
        }

        let changed: Vec<&str> = changes.iter().map(|c| c.property.as_str()).collect();
        tracing::debug!(device = %device, changed = ?changed, "device state updated");

        let mut deltas = Map::new();
        for change in &changes {
            deltas.insert(
                change.property.clone(),
                json!({ "old": change.old, "new": change.new }),
            );
        }

        self.hub.broadcast(
            "device_update",
            json!({
                "device": device,
                "state": Value::Object(new_state.clone()),
                "changed": changed,
                "changes": Value::Object(deltas),
            }),
        );

        self.engine
            .check_triggers(device, Some(&old_state), &new_state)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::intents::IntentGenerator;
    use crate::mqtt::{command_channel, Commander};
    use crate::scene::SceneEngine;
    use crate::store::Store;

    fn state_map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn diff_reports_new_and_changed_keys() {
        let old = state_map(json!({"state": "OFF", "brightness": 0}));
        let new = state_map(json!({"state": "ON", "brightness": 0, "color_temp": 300}));

        let changes = diff(&old, &new);
        let props: Vec<&str> = changes.iter().map(|c| c.property.as_str()).collect();
        // brightness is unchanged and must not appear
        assert_eq!(props, vec!["color_temp", "state"]);

        let state_change = changes.iter().find(|c| c.property == "state").unwrap();
        assert_eq!(state_change.old, Some(json!("OFF")));
        assert_eq!(state_change.new, json!("ON"));

        let added = changes.iter().find(|c| c.property == "color_temp").unwrap();
        assert_eq!(added.old, None);
    }

    #[test]
    fn diff_of_identical_maps_is_empty() {
        let state = state_map(json!({"state": "ON", "brightness": 128}));
        assert!(diff(&state, &state).is_empty());
    }

    #[tokio::test]
    async fn ingest_broadcasts_one_device_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let intents = Arc::new(IntentGenerator::new(
            store.clone(),
            dir.path().join("intents.json"),
        ));
        let (tx, _cmd_rx) = command_channel();
        let commander = Commander::new(tx, "zigbee2mqtt");
        let registry = Arc::new(Registry::new(store.clone(), intents, commander.clone()));
        let scenes = Arc::new(SceneEngine::new(store.clone(), registry.clone(), commander.clone()));
        let engine = Arc::new(AutomationEngine::new(
            store,
            registry.clone(),
            scenes,
            commander,
        ));
        let hub = Arc::new(WsHub::new(16));
        let dispatcher = Dispatcher::new(registry.clone(), hub.clone(), engine);

        let lamp: Device = serde_json::from_value(json!({
            "friendly_name": "lamp",
            "ieee_address": "0x0000000000000001",
            "type": "Router",
        }))
        .unwrap();
        registry.merge_broadcast(vec![lamp]).unwrap();
        registry
            .update_state("lamp", state_map(json!({"state": "OFF", "brightness": 0})))
            .unwrap();

        let mut events = hub.register().1;
        dispatcher
            .ingest("lamp", state_map(json!({"state": "ON", "brightness": 128})))
            .await;

        let event: Value = serde_json::from_str(&events.try_recv().unwrap()).unwrap();
        assert_eq!(event["type"], "device_update");
        assert_eq!(event["device"], "lamp");
        assert_eq!(event["state"]["state"], "ON");
        assert_eq!(event["state"]["brightness"], 128);
        assert!(event.get("timestamp").is_some());
        assert!(events.try_recv().is_err(), "exactly one event per update");

        // Registry now holds the merged state
        assert_eq!(
            registry.device_state("lamp").unwrap().get("state"),
            Some(&json!("ON"))
        );
    }

    #[tokio::test]
    async fn ingest_for_unknown_device_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let intents = Arc::new(IntentGenerator::new(
            store.clone(),
            dir.path().join("intents.json"),
        ));
        let (tx, _cmd_rx) = command_channel();
        let commander = Commander::new(tx, "zigbee2mqtt");
        let registry = Arc::new(Registry::new(store.clone(), intents, commander.clone()));
        let scenes = Arc::new(SceneEngine::new(store.clone(), registry.clone(), commander.clone()));
        let engine = Arc::new(AutomationEngine::new(
            store,
            registry.clone(),
            scenes,
            commander,
        ));
        let hub = Arc::new(WsHub::new(16));
        let dispatcher = Dispatcher::new(registry, hub.clone(), engine);

        let mut events = hub.register().1;
        dispatcher
            .ingest("ghost", state_map(json!({"state": "ON"})))
            .await;
        assert!(events.try_recv().is_err());
    }
}
