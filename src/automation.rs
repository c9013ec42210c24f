//! IFTTT automation engine: rule storage, trigger evaluation against state
//! changes, and action dispatch to devices, zones and scenes.
//!
//! Button conditions route through the gesture FSM in `button.rs`; everything
//! else is evaluated inline on the state-ingestion path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::button::{ButtonFsm, Gesture, Press, DOUBLE_PRESS_WINDOW};
use crate::device::DeviceCategory;
use crate::error::Error;
use crate::mqtt::Commander;
use crate::registry::Registry;
use crate::scene::SceneEngine;
use crate::store::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub trigger: Trigger,
    pub action: Action,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_kind() -> String {
    "ifttt".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub device_name: String,
    pub property: String,
    pub condition: Condition,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Equals,
    GreaterThan,
    LessThan,
    Changed,
    Pressed,
    DoublePressed,
    LongPressed,
}

impl Condition {
    fn requires_value(self) -> bool {
        matches!(self, Self::Equals | Self::GreaterThan | Self::LessThan)
    }

    fn is_button(self) -> bool {
        matches!(self, Self::Pressed | Self::DoublePressed | Self::LongPressed)
    }
}

/// Exactly one target: a device, a zone (optionally narrowed by category), or
/// a scene. Validation enforces the exclusivity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub trigger: Trigger,
    pub action: Action,
}

/// Partial update; absent fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutomationPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub trigger: Option<Trigger>,
    pub action: Option<Action>,
}

pub struct AutomationEngine {
    store: Arc<Store>,
    registry: Arc<Registry>,
    scenes: Arc<SceneEngine>,
    commander: Commander,
    buttons: ButtonFsm,
}

impl AutomationEngine {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        scenes: Arc<SceneEngine>,
        commander: Commander,
    ) -> Self {
        Self {
            store,
            registry,
            scenes,
            commander,
            buttons: ButtonFsm::new(),
        }
    }

    // ── CRUD ─────────────────────────────────────────────

    pub fn list(&self) -> Vec<Automation> {
        self.store.with_home(|doc| doc.automations.clone())
    }

    pub fn get(&self, id: &str) -> Result<Automation, Error> {
        self.store
            .with_home(|doc| doc.automations.iter().find(|a| a.id == id).cloned())
            .ok_or_else(|| Error::not_found("automation", id))
    }

    pub fn create(&self, input: AutomationInput) -> Result<Automation, Error> {
        validate(&input.name, &input.kind, &input.trigger, &input.action)?;
        let now = Utc::now();
        let automation = Automation {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name.trim().to_string(),
            description: input.description,
            enabled: input.enabled,
            kind: input.kind,
            trigger: input.trigger,
            action: input.action,
            created_at: now,
            updated_at: now,
        };
        self.store.update_home(|doc| {
            doc.automations.push(automation.clone());
        })?;
        tracing::info!(automation = %automation.name, "automation created");
        Ok(automation)
    }

    pub fn update(&self, id: &str, patch: AutomationPatch) -> Result<Automation, Error> {
        let mut merged = self.get(id)?;
        if let Some(name) = patch.name {
            merged.name = name;
        }
        if let Some(description) = patch.description {
            merged.description = description;
        }
        if let Some(enabled) = patch.enabled {
            merged.enabled = enabled;
        }
        if let Some(kind) = patch.kind {
            merged.kind = kind;
        }
        if let Some(trigger) = patch.trigger {
            merged.trigger = trigger;
        }
        if let Some(action) = patch.action {
            merged.action = action;
        }
        validate(&merged.name, &merged.kind, &merged.trigger, &merged.action)?;
        merged.updated_at = Utc::now();

        let stored = self.store.update_home(|doc| {
            doc.automations.iter_mut().find(|a| a.id == id).map(|slot| {
                *slot = merged.clone();
            })
        })?;
        stored.ok_or_else(|| Error::not_found("automation", id))?;
        Ok(merged)
    }

    pub fn delete(&self, id: &str) -> Result<(), Error> {
        let found = self.store.update_home(|doc| {
            let before = doc.automations.len();
            doc.automations.retain(|a| a.id != id);
            doc.automations.len() != before
        })?;
        if !found {
            return Err(Error::not_found("automation", id));
        }
        Ok(())
    }

    /// Force-run an automation's action, bypassing its trigger. A reference
    /// to a vanished device is a warning, not an error.
    pub async fn run(&self, id: &str) -> Result<bool, Error> {
        let automation = self.get(id)?;
        Ok(self.execute(&automation).await)
    }

    // ── Evaluation ───────────────────────────────────────

    /// Evaluate all enabled rules for one device state change. Called
    /// synchronously from the state-ingestion path; button gestures that need
    /// a debounce window fire later on their own tasks.
    pub async fn check_triggers(
        self: &Arc<Self>,
        device: &str,
        old: Option<&Map<String, Value>>,
        new: &Map<String, Value>,
    ) {
        let rules: Vec<Automation> = self.store.with_home(|doc| {
            doc.automations
                .iter()
                .filter(|a| a.enabled && a.trigger.device_name == device)
                .cloned()
                .collect()
        });
        if rules.is_empty() {
            return;
        }

        for rule in rules.iter().filter(|r| !r.trigger.condition.is_button()) {
            if condition_fires(&rule.trigger, old, new) {
                tracing::info!(automation = %rule.name, device = %device, "automation triggered");
                self.execute(rule).await;
            }
        }

        // Raw press events feed the gesture FSM once per property, not once
        // per rule; matching rules are collected again at fire time.
        for (property, value) in new {
            let keyed = |c: Condition| {
                rules
                    .iter()
                    .any(|r| r.trigger.property == *property && r.trigger.condition == c)
            };
            if is_press_value(value) && (keyed(Condition::Pressed) || keyed(Condition::DoublePressed))
            {
                self.handle_press(device, property);
            } else if is_hold_value(value) {
                self.buttons.cancel_pending(device, property);
                if keyed(Condition::LongPressed) {
                    self.fire_gesture(device, property, Gesture::Long);
                }
            }
        }
    }

    fn handle_press(self: &Arc<Self>, device: &str, property: &str) {
        match self.buttons.register_press(device, property) {
            Press::Double => self.fire_gesture(device, property, Gesture::Double),
            Press::First { generation } => {
                let engine = self.clone();
                let device = device.to_string();
                let property = property.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(DOUBLE_PRESS_WINDOW).await;
                    if engine.buttons.confirm_single(&device, &property, generation) {
                        engine.fire_matching(&device, &property, Gesture::Single).await;
                    }
                });
            }
        }
    }

    fn fire_gesture(self: &Arc<Self>, device: &str, property: &str, gesture: Gesture) {
        let engine = self.clone();
        let device = device.to_string();
        let property = property.to_string();
        tokio::spawn(async move {
            engine.fire_matching(&device, &property, gesture).await;
        });
    }

    async fn fire_matching(&self, device: &str, property: &str, gesture: Gesture) {
        let wanted = match gesture {
            Gesture::Single => Condition::Pressed,
            Gesture::Double => Condition::DoublePressed,
            Gesture::Long => Condition::LongPressed,
        };
        let rules: Vec<Automation> = self.store.with_home(|doc| {
            doc.automations
                .iter()
                .filter(|a| {
                    a.enabled
                        && a.trigger.device_name == device
                        && a.trigger.property == property
                        && a.trigger.condition == wanted
                })
                .cloned()
                .collect()
        });
        for rule in rules {
            tracing::info!(automation = %rule.name, gesture = ?gesture, "button automation fired");
            self.execute(&rule).await;
        }
    }

    // ── Dispatch ─────────────────────────────────────────

    async fn execute(&self, automation: &Automation) -> bool {
        let action = &automation.action;

        if let (Some(scene_name), Some(scene_zone)) = (&action.scene_name, &action.scene_zone) {
            return match self.scenes.apply_by_name(scene_name, scene_zone) {
                Ok(driven) => driven > 0,
                Err(e) => {
                    tracing::warn!(
                        automation = %automation.name,
                        "scene action failed: {}", e
                    );
                    false
                }
            };
        }

        let (Some(property), Some(value)) = (&action.property, &action.value) else {
            tracing::warn!(automation = %automation.name, "action has no property/value");
            return false;
        };
        let mut map = Map::new();
        map.insert(property.clone(), value.clone());
        let payload = Value::Object(map);

        if let Some(zone) = &action.zone {
            let category = action
                .category
                .as_deref()
                .and_then(DeviceCategory::parse);
            let targets = self.registry.devices_in_zone(zone, category);
            if targets.is_empty() {
                tracing::warn!(
                    automation = %automation.name,
                    zone = %zone,
                    "zone action matched no devices"
                );
                return false;
            }
            for target in &targets {
                self.commander.set_device(&target.device.friendly_name, &payload);
            }
            return true;
        }

        if let Some(device) = &action.device_name {
            if self.registry.device(device).is_none() {
                tracing::warn!(
                    automation = %automation.name,
                    device = %device,
                    "automation references a device that no longer exists"
                );
                return false;
            }
            self.commander.set_device(device, &payload);
            return true;
        }

        tracing::warn!(automation = %automation.name, "action has no target");
        false
    }
}

fn condition_fires(
    trigger: &Trigger,
    old: Option<&Map<String, Value>>,
    new: &Map<String, Value>,
) -> bool {
    let Some(new_value) = new.get(&trigger.property) else {
        return false;
    };
    match trigger.condition {
        Condition::Equals => values_equal(new_value, &trigger.value),
        Condition::GreaterThan => match (coerce_number(new_value), coerce_number(&trigger.value)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        Condition::LessThan => match (coerce_number(new_value), coerce_number(&trigger.value)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        Condition::Changed => old
            .and_then(|o| o.get(&trigger.property))
            .is_some_and(|old_value| old_value != new_value),
        Condition::Pressed | Condition::DoublePressed | Condition::LongPressed => false,
    }
}

/// Compare as numbers when both sides coerce, exact values otherwise.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (coerce_number(a), coerce_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_press_value(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
        || matches!(value.as_str(), Some("single") | Some("press"))
}

fn is_hold_value(value: &Value) -> bool {
    matches!(value.as_str(), Some("hold") | Some("long"))
}

fn validate(name: &str, kind: &str, trigger: &Trigger, action: &Action) -> Result<(), Error> {
    let mut fields = Vec::new();

    if name.trim().is_empty() {
        fields.push("name must not be empty".to_string());
    }
    if kind != "ifttt" {
        fields.push(format!("type must be \"ifttt\", got \"{kind}\""));
    }
    if trigger.device_name.trim().is_empty() {
        fields.push("trigger.device_name is required".to_string());
    }
    if trigger.property.trim().is_empty() {
        fields.push("trigger.property is required".to_string());
    }
    if trigger.condition.requires_value() && trigger.value.is_null() {
        fields.push("trigger.value is required for this condition".to_string());
    }

    let is_device = action.device_name.is_some();
    let is_zone = action.zone.is_some();
    let is_scene = action.scene_zone.is_some() || action.scene_name.is_some();
    let branches = usize::from(is_device) + usize::from(is_zone) + usize::from(is_scene);

    if branches != 1 {
        fields.push(
            "action must target exactly one of device_name, zone, or scene_zone+scene_name"
                .to_string(),
        );
    } else if is_scene {
        if action.scene_zone.is_none() || action.scene_name.is_none() {
            fields.push("scene actions require both scene_zone and scene_name".to_string());
        }
        if action.property.is_some() || action.value.is_some() {
            fields.push("scene actions must not carry property or value".to_string());
        }
    } else {
        if action.property.is_none() {
            fields.push("action.property is required for device and zone actions".to_string());
        }
        if action.value.is_none() {
            fields.push("action.value is required for device and zone actions".to_string());
        }
        if is_device && action.category.is_some() {
            fields.push("action.category is only valid for zone actions".to_string());
        }
    }

    if fields.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::intents::IntentGenerator;
    use crate::mqtt::{command_channel, CommandReceiver};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<AutomationEngine>,
        registry: Arc<Registry>,
        rx: CommandReceiver,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let intents = Arc::new(IntentGenerator::new(
            store.clone(),
            dir.path().join("intents.json"),
        ));
        let (tx, rx) = command_channel();
        let commander = Commander::new(tx, "zigbee2mqtt");
        let registry = Arc::new(Registry::new(store.clone(), intents, commander.clone()));
        let scenes = Arc::new(SceneEngine::new(
            store.clone(),
            registry.clone(),
            commander.clone(),
        ));
        let engine = Arc::new(AutomationEngine::new(store, registry.clone(), scenes, commander));
        Fixture { engine, registry, rx, _dir: dir }
    }

    // Non-gateway addresses so repeated one-device broadcasts don't
    // stale-clean earlier seeds.
    fn seed_device(f: &Fixture, name: &str, state: Value) {
        let device: Device = serde_json::from_value(json!({
            "friendly_name": name,
            "ieee_address": format!("test::{name}"),
            "type": "Router",
        }))
        .unwrap();
        f.registry.merge_broadcast(vec![device]).unwrap();
        f.registry
            .update_state(name, state.as_object().cloned().unwrap())
            .unwrap();
    }

    fn rule(name: &str, trigger: Trigger, action: Action) -> AutomationInput {
        AutomationInput {
            name: name.to_string(),
            description: String::new(),
            enabled: true,
            kind: "ifttt".to_string(),
            trigger,
            action,
        }
    }

    fn device_action(device: &str, property: &str, value: Value) -> Action {
        Action {
            device_name: Some(device.to_string()),
            property: Some(property.to_string()),
            value: Some(value),
            ..Default::default()
        }
    }

    fn state_map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn drain(rx: &mut CommandReceiver) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push((cmd.topic, serde_json::from_str(&cmd.payload).unwrap()));
        }
        out
    }

    #[tokio::test]
    async fn equals_trigger_publishes_device_command() {
        let mut f = fixture();
        seed_device(&f, "motion1", json!({"occupancy": false}));
        seed_device(&f, "lamp", json!({"state": "OFF"}));
        f.engine
            .create(rule(
                "motion light",
                Trigger {
                    device_name: "motion1".to_string(),
                    property: "occupancy".to_string(),
                    condition: Condition::Equals,
                    value: json!(true),
                    previous_value: None,
                },
                device_action("lamp", "state", json!("ON")),
            ))
            .unwrap();

        let old = state_map(json!({"occupancy": false}));
        let new = state_map(json!({"occupancy": true}));
        f.engine.check_triggers("motion1", Some(&old), &new).await;

        let commands = drain(&mut f.rx);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, "zigbee2mqtt/lamp/set");
        assert_eq!(commands[0].1, json!({"state": "ON"}));
    }

    #[tokio::test]
    async fn numeric_conditions_coerce_strings() {
        let mut f = fixture();
        seed_device(&f, "sensor", json!({"temperature": 20}));
        seed_device(&f, "fan", json!({"state": "OFF"}));
        f.engine
            .create(rule(
                "too hot",
                Trigger {
                    device_name: "sensor".to_string(),
                    property: "temperature".to_string(),
                    condition: Condition::GreaterThan,
                    value: json!("25"),
                    previous_value: None,
                },
                device_action("fan", "state", json!("ON")),
            ))
            .unwrap();

        let new = state_map(json!({"temperature": 26.5}));
        f.engine.check_triggers("sensor", None, &new).await;
        assert_eq!(drain(&mut f.rx).len(), 1);

        let cooler = state_map(json!({"temperature": 24}));
        f.engine.check_triggers("sensor", None, &cooler).await;
        assert!(drain(&mut f.rx).is_empty());
    }

    #[tokio::test]
    async fn changed_requires_a_previous_value() {
        let mut f = fixture();
        seed_device(&f, "door", json!({"contact": true}));
        seed_device(&f, "lamp", json!({"state": "OFF"}));
        f.engine
            .create(rule(
                "door moved",
                Trigger {
                    device_name: "door".to_string(),
                    property: "contact".to_string(),
                    condition: Condition::Changed,
                    value: Value::Null,
                    previous_value: None,
                },
                device_action("lamp", "state", json!("ON")),
            ))
            .unwrap();

        // No prior state: must not fire
        let new = state_map(json!({"contact": false}));
        f.engine.check_triggers("door", None, &new).await;
        assert!(drain(&mut f.rx).is_empty());

        // Same value: must not fire
        let old = state_map(json!({"contact": false}));
        f.engine.check_triggers("door", Some(&old), &new).await;
        assert!(drain(&mut f.rx).is_empty());

        // Real change fires
        let opened = state_map(json!({"contact": true}));
        f.engine.check_triggers("door", Some(&old), &opened).await;
        assert_eq!(drain(&mut f.rx).len(), 1);
    }

    #[tokio::test]
    async fn disabled_automations_never_fire() {
        let mut f = fixture();
        seed_device(&f, "motion1", json!({"occupancy": false}));
        seed_device(&f, "lamp", json!({"state": "OFF"}));
        let created = f
            .engine
            .create(rule(
                "motion light",
                Trigger {
                    device_name: "motion1".to_string(),
                    property: "occupancy".to_string(),
                    condition: Condition::Equals,
                    value: json!(true),
                    previous_value: None,
                },
                device_action("lamp", "state", json!("ON")),
            ))
            .unwrap();
        f.engine
            .update(&created.id, AutomationPatch { enabled: Some(false), ..Default::default() })
            .unwrap();

        let new = state_map(json!({"occupancy": true}));
        f.engine.check_triggers("motion1", None, &new).await;
        assert!(drain(&mut f.rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn double_press_suppresses_single() {
        let mut f = fixture();
        seed_device(&f, "button1", json!({"action": ""}));
        seed_device(&f, "lamp", json!({"state": "OFF"}));
        f.engine
            .create(rule(
                "single on",
                Trigger {
                    device_name: "button1".to_string(),
                    property: "action".to_string(),
                    condition: Condition::Pressed,
                    value: Value::Null,
                    previous_value: None,
                },
                device_action("lamp", "state", json!("ON")),
            ))
            .unwrap();
        f.engine
            .create(rule(
                "double off",
                Trigger {
                    device_name: "button1".to_string(),
                    property: "action".to_string(),
                    condition: Condition::DoublePressed,
                    value: Value::Null,
                    previous_value: None,
                },
                device_action("lamp", "state", json!("OFF")),
            ))
            .unwrap();

        let press = state_map(json!({"action": "single"}));
        f.engine.check_triggers("button1", None, &press).await;
        tokio::task::yield_now().await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        f.engine.check_triggers("button1", None, &press).await;

        // Let the debounce window expire and all spawned work settle.
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let commands = drain(&mut f.rx);
        assert_eq!(commands.len(), 1, "only the double-press action may fire");
        assert_eq!(commands[0].1, json!({"state": "OFF"}));
    }

    #[tokio::test(start_paused = true)]
    async fn lone_press_fires_single_after_window() {
        let mut f = fixture();
        seed_device(&f, "button1", json!({"action": ""}));
        seed_device(&f, "lamp", json!({"state": "OFF"}));
        f.engine
            .create(rule(
                "single on",
                Trigger {
                    device_name: "button1".to_string(),
                    property: "action".to_string(),
                    condition: Condition::Pressed,
                    value: Value::Null,
                    previous_value: None,
                },
                device_action("lamp", "state", json!("ON")),
            ))
            .unwrap();
        f.engine
            .create(rule(
                "double off",
                Trigger {
                    device_name: "button1".to_string(),
                    property: "action".to_string(),
                    condition: Condition::DoublePressed,
                    value: Value::Null,
                    previous_value: None,
                },
                device_action("lamp", "state", json!("OFF")),
            ))
            .unwrap();

        let press = state_map(json!({"action": "single"}));
        f.engine.check_triggers("button1", None, &press).await;
        tokio::task::yield_now().await;

        // Quiet for the full window: the single press confirms exactly once.
        tokio::time::sleep(Duration::from_millis(700)).await;

        let commands = drain(&mut f.rx);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].1, json!({"state": "ON"}));
    }

    #[tokio::test(start_paused = true)]
    async fn hold_cancels_pending_single_and_fires_long() {
        let mut f = fixture();
        seed_device(&f, "button1", json!({"action": ""}));
        seed_device(&f, "lamp", json!({"state": "OFF"}));
        f.engine
            .create(rule(
                "single on",
                Trigger {
                    device_name: "button1".to_string(),
                    property: "action".to_string(),
                    condition: Condition::Pressed,
                    value: Value::Null,
                    previous_value: None,
                },
                device_action("lamp", "state", json!("ON")),
            ))
            .unwrap();
        f.engine
            .create(rule(
                "long dim",
                Trigger {
                    device_name: "button1".to_string(),
                    property: "action".to_string(),
                    condition: Condition::LongPressed,
                    value: Value::Null,
                    previous_value: None,
                },
                device_action("lamp", "brightness", json!(10)),
            ))
            .unwrap();

        let press = state_map(json!({"action": "single"}));
        f.engine.check_triggers("button1", None, &press).await;
        tokio::task::yield_now().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let hold = state_map(json!({"action": "hold"}));
        f.engine.check_triggers("button1", None, &hold).await;

        tokio::time::sleep(Duration::from_millis(1000)).await;

        let commands = drain(&mut f.rx);
        assert_eq!(commands.len(), 1, "pending single must be cancelled");
        assert_eq!(commands[0].1, json!({"brightness": 10}));
    }

    #[tokio::test]
    async fn zone_action_commands_every_matching_device() {
        let mut f = fixture();
        seed_device(&f, "lamp_a", json!({"brightness": 10}));
        seed_device(&f, "lamp_b", json!({"brightness": 20}));
        seed_device(&f, "sensor_c", json!({"temperature": 20}));
        seed_device(&f, "button1", json!({"occupancy": false}));
        for name in ["lamp_a", "lamp_b", "sensor_c"] {
            f.registry.assign_zone(name, "kitchen").unwrap();
        }
        f.engine
            .create(rule(
                "kitchen on",
                Trigger {
                    device_name: "button1".to_string(),
                    property: "occupancy".to_string(),
                    condition: Condition::Equals,
                    value: json!(true),
                    previous_value: None,
                },
                Action {
                    zone: Some("kitchen".to_string()),
                    category: Some("light".to_string()),
                    property: Some("state".to_string()),
                    value: Some(json!("ON")),
                    ..Default::default()
                },
            ))
            .unwrap();

        let new = state_map(json!({"occupancy": true}));
        f.engine.check_triggers("button1", None, &new).await;

        let mut topics: Vec<String> = drain(&mut f.rx).into_iter().map(|(t, _)| t).collect();
        topics.sort();
        // The sensor is filtered out by category
        assert_eq!(
            topics,
            vec!["zigbee2mqtt/lamp_a/set", "zigbee2mqtt/lamp_b/set"]
        );
    }

    #[tokio::test]
    async fn run_on_dangling_device_warns_but_succeeds() {
        let f = fixture();
        let created = f
            .engine
            .create(rule(
                "ghost",
                Trigger {
                    device_name: "gone".to_string(),
                    property: "state".to_string(),
                    condition: Condition::Equals,
                    value: json!("ON"),
                    previous_value: None,
                },
                device_action("vanished", "state", json!("ON")),
            ))
            .unwrap();

        let fired = f.engine.run(&created.id).await.unwrap();
        assert!(!fired);
    }

    #[test]
    fn validation_collects_every_failing_field() {
        let err = validate(
            "",
            "cron",
            &Trigger {
                device_name: String::new(),
                property: String::new(),
                condition: Condition::Equals,
                value: Value::Null,
                previous_value: None,
            },
            &Action::default(),
        )
        .unwrap_err();

        let Error::Validation { fields } = err else {
            panic!("expected validation error");
        };
        assert_eq!(fields.len(), 6);
    }

    #[test]
    fn validation_rejects_multiple_action_targets() {
        let err = validate(
            "two targets",
            "ifttt",
            &Trigger {
                device_name: "button1".to_string(),
                property: "action".to_string(),
                condition: Condition::Pressed,
                value: Value::Null,
                previous_value: None,
            },
            &Action {
                device_name: Some("lamp".to_string()),
                zone: Some("kitchen".to_string()),
                property: Some("state".to_string()),
                value: Some(json!("ON")),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn validation_rejects_scene_action_with_property() {
        let err = validate(
            "scene with extras",
            "ifttt",
            &Trigger {
                device_name: "button1".to_string(),
                property: "action".to_string(),
                condition: Condition::Pressed,
                value: Value::Null,
                previous_value: None,
            },
            &Action {
                scene_zone: Some("living_room".to_string()),
                scene_name: Some("Sunset".to_string()),
                property: Some("state".to_string()),
                value: Some(json!("ON")),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn scene_action_resolves_by_name() {
        let mut f = fixture();
        seed_device(&f, "lamp_a", json!({"brightness": 10}));
        seed_device(&f, "button1", json!({"action": ""}));
        f.registry.assign_zone("lamp_a", "living_room").unwrap();

        let created = f
            .engine
            .create(rule(
                "evening scene",
                Trigger {
                    device_name: "button1".to_string(),
                    property: "action".to_string(),
                    condition: Condition::Pressed,
                    value: Value::Null,
                    previous_value: None,
                },
                Action {
                    scene_zone: Some("living_room".to_string()),
                    scene_name: Some("Sunset".to_string()),
                    ..Default::default()
                },
            ))
            .unwrap();

        let fired = f.engine.run(&created.id).await.unwrap();
        assert!(fired);

        let commands = drain(&mut f.rx);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, "zigbee2mqtt/lamp_a/set");
        assert_eq!(commands[0].1["state"], "ON");
    }
}
