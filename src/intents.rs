//! Voice-intent table generator.
//!
//! After every registry mutation the speech-to-intent worker gets a fresh
//! snapshot: every device with its category synonyms, zone membership and a
//! per-property table of natural-language phrases mapped to concrete target
//! values. Writes are atomic and serialized so concurrent regenerations never
//! interleave.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Map, Value};

use crate::device::{is_writable, Device, DeviceCategory};
use crate::error::Error;
use crate::registry::effective_category;
use crate::store::{HomeDocument, Store};

pub struct IntentGenerator {
    store: Arc<Store>,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl IntentGenerator {
    pub fn new(store: Arc<Store>, path: PathBuf) -> Self {
        Self {
            store,
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn regenerate(&self) -> Result<(), Error> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let snapshot = self.store.with_home(build_snapshot);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Regeneration failures must never fail the mutation that triggered
    /// them; they are logged instead.
    pub fn regenerate_logged(&self) {
        if let Err(e) = self.regenerate() {
            tracing::warn!("voice intent regeneration failed: {}", e);
        }
    }
}

fn build_snapshot(doc: &HomeDocument) -> Value {
    let display_name = |device: &Device| -> String {
        doc.device_metadata
            .get(&device.friendly_name)
            .and_then(|m| m.custom_name.clone())
            .unwrap_or_else(|| device.friendly_name.clone())
    };

    let devices: Vec<Value> = doc
        .device_cache
        .iter()
        .map(|device| {
            let metadata = doc.device_metadata.get(&device.friendly_name);
            let category = effective_category(device, metadata);
            json!({
                "friendly_name": device.friendly_name,
                "ieee_address": device.ieee_address,
                "custom_name": metadata.and_then(|m| m.custom_name.clone()),
                "categories": category_synonyms(category),
                "zones": doc.device_zones.get(&device.friendly_name).cloned().unwrap_or_default(),
                "properties": property_table(device),
                "voice_patterns": voice_patterns(device, &display_name(device)),
            })
        })
        .collect();

    let mut zones = Map::new();
    for zone in &doc.zones {
        let mut members: Vec<&Device> = doc
            .device_cache
            .iter()
            .filter(|d| {
                doc.device_zones
                    .get(&d.friendly_name)
                    .is_some_and(|zs| zs.iter().any(|z| z == zone))
            })
            .collect();
        members.sort_by(|a, b| display_name(a).cmp(&display_name(b)));
        zones.insert(
            zone.clone(),
            Value::Array(
                members
                    .into_iter()
                    .map(|d| Value::String(d.friendly_name.clone()))
                    .collect(),
            ),
        );
    }

    json!({
        "devices": devices,
        "zones": zones,
        "generated_at": chrono::Utc::now().to_rfc3339(),
    })
}

fn category_synonyms(category: DeviceCategory) -> Vec<&'static str> {
    match category {
        DeviceCategory::Light => vec!["light", "lamp", "bulb"],
        DeviceCategory::Switch => vec!["switch", "plug", "outlet"],
        DeviceCategory::Sensor => vec!["sensor"],
        DeviceCategory::Button => vec!["button", "remote"],
        DeviceCategory::Motion => vec!["motion", "occupancy", "presence", "motion sensor"],
        DeviceCategory::DoorWindow => {
            vec!["door", "window", "contact", "door sensor", "window sensor"]
        }
        DeviceCategory::Thermostat => {
            vec!["thermostat", "climate", "temperature control", "hvac"]
        }
        // Unknown devices are excluded from category-based targeting
        DeviceCategory::Unknown => vec![],
    }
}

fn voice_patterns(device: &Device, display: &str) -> Vec<String> {
    let mut patterns = vec![display.to_lowercase()];
    let spoken_friendly = device.friendly_name.replace(['_', '-'], " ").to_lowercase();
    if !patterns.contains(&spoken_friendly) {
        patterns.push(spoken_friendly);
    }
    patterns
}

/// One entry per writable property: its kind, current value and the phrase →
/// target-value command table.
fn property_table(device: &Device) -> Map<String, Value> {
    let mut table = Map::new();

    for expose in device.flat_exposes() {
        if !is_writable(expose) {
            continue;
        }
        let Some(property) = expose.get("property").and_then(Value::as_str) else {
            continue;
        };
        let kind = expose.get("type").and_then(Value::as_str).unwrap_or("");
        let current = device.state.get(property).cloned();

        let commands = match kind {
            "binary" => binary_commands(expose),
            "numeric" => numeric_commands(expose, property, current.as_ref()),
            "enum" => enum_commands(expose),
            _ => continue,
        };

        let mut entry = Map::new();
        entry.insert("type".to_string(), json!(kind));
        entry.insert("current".to_string(), current.unwrap_or(Value::Null));
        if let Some(unit) = expose.get("unit") {
            entry.insert("unit".to_string(), unit.clone());
        }
        entry.insert("commands".to_string(), Value::Object(commands));
        table.insert(property.to_string(), Value::Object(entry));
    }

    table
}

fn binary_commands(expose: &Value) -> Map<String, Value> {
    let on = expose.get("value_on").cloned().unwrap_or(json!(true));
    let off = expose.get("value_off").cloned().unwrap_or(json!(false));

    let mut commands = Map::new();
    commands.insert("turn on".to_string(), on.clone());
    commands.insert("switch on".to_string(), on);
    commands.insert("turn off".to_string(), off.clone());
    commands.insert("switch off".to_string(), off);
    commands.insert("toggle".to_string(), json!("TOGGLE"));
    commands
}

fn numeric_commands(expose: &Value, property: &str, current: Option<&Value>) -> Map<String, Value> {
    let min = expose.get("value_min").and_then(Value::as_f64);
    let max = expose.get("value_max").and_then(Value::as_f64);

    let step = match (min, max) {
        (Some(lo), Some(hi)) => 0.2 * (hi - lo),
        _ => 10.0,
    };
    let floor = min.unwrap_or(0.0);
    let current = current
        .and_then(coerce_number)
        .unwrap_or(floor);

    let up = match max {
        Some(hi) => (current + step).min(hi),
        None => current + step,
    };
    let down = (current - step).max(floor);

    let mut commands = Map::new();
    for phrase in increase_phrases(property) {
        commands.insert(phrase.to_string(), number(up));
    }
    for phrase in decrease_phrases(property) {
        commands.insert(phrase.to_string(), number(down));
    }
    for phrase in ["minimum", "min", "lowest"] {
        commands.insert(phrase.to_string(), number(floor));
    }
    if let Some(hi) = max {
        for phrase in ["maximum", "max", "highest", "full"] {
            commands.insert(phrase.to_string(), number(hi));
        }
    }
    commands
}

/// Whole values go out as integers so the worker sees `254`, not `254.0`.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

/// Relative synonyms are gated on the property name so a volume control never
/// offers "brighter".
fn increase_phrases(property: &str) -> Vec<&'static str> {
    let mut phrases = vec!["increase", "higher"];
    if property.contains("bright") {
        phrases.push("brighter");
    }
    if property.contains("volume") {
        phrases.push("louder");
    }
    if property.contains("temp") {
        phrases.push("warmer");
    }
    if property.contains("speed") {
        phrases.push("faster");
    }
    phrases
}

fn decrease_phrases(property: &str) -> Vec<&'static str> {
    let mut phrases = vec!["decrease", "lower"];
    if property.contains("bright") {
        phrases.push("dimmer");
    }
    if property.contains("volume") {
        phrases.push("quieter");
    }
    if property.contains("temp") {
        phrases.push("cooler");
    }
    if property.contains("speed") {
        phrases.push("slower");
    }
    phrases
}

fn enum_commands(expose: &Value) -> Map<String, Value> {
    let mut commands = Map::new();
    if let Some(values) = expose.get("values").and_then(Value::as_array) {
        for value in values {
            if let Some(s) = value.as_str() {
                commands.insert(s.to_string(), value.clone());
            }
        }
    }
    commands
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceMetadata;

    fn brightness_device() -> Device {
        serde_json::from_value(json!({
            "friendly_name": "lamp",
            "ieee_address": "0x0000000000000001",
            "type": "Router",
            "definition": {
                "model": "bulb-1",
                "exposes": [{
                    "type": "light",
                    "features": [
                        {"type": "binary", "property": "state", "access": 7,
                         "value_on": "ON", "value_off": "OFF"},
                        {"type": "numeric", "property": "brightness", "access": 7,
                         "value_min": 0, "value_max": 254}
                    ]
                }]
            },
            "state": {"state": "ON", "brightness": 254}
        }))
        .unwrap()
    }

    fn doc_with(device: Device, metadata: Option<DeviceMetadata>) -> HomeDocument {
        let mut doc = HomeDocument {
            zones: vec!["living_room".to_string()],
            ..Default::default()
        };
        doc.device_zones
            .insert(device.friendly_name.clone(), vec!["living_room".to_string()]);
        if let Some(m) = metadata {
            doc.device_metadata.insert(device.friendly_name.clone(), m);
        }
        doc.device_cache.push(device);
        doc
    }

    #[test]
    fn brightness_command_table_matches_range() {
        let doc = doc_with(
            brightness_device(),
            Some(DeviceMetadata {
                custom_name: Some("Right Lamp".to_string()),
                custom_category: None,
            }),
        );
        let snapshot = build_snapshot(&doc);

        let device = &snapshot["devices"][0];
        assert_eq!(device["custom_name"], "Right Lamp");

        let commands = &device["properties"]["brightness"]["commands"];
        assert_eq!(commands["max"], json!(254));
        assert_eq!(commands["minimum"], json!(0));
        // step = 20% of (254 - 0) = 50.8
        assert_eq!(commands["dimmer"], json!(254.0 - 0.2 * 254.0));
        assert_eq!(commands["brighter"], json!(254));
    }

    #[test]
    fn binary_commands_use_declared_values() {
        let doc = doc_with(brightness_device(), None);
        let snapshot = build_snapshot(&doc);

        let commands = &snapshot["devices"][0]["properties"]["state"]["commands"];
        assert_eq!(commands["turn on"], "ON");
        assert_eq!(commands["turn off"], "OFF");
        assert_eq!(commands["toggle"], "TOGGLE");
    }

    #[test]
    fn relative_synonyms_are_gated_by_property_name() {
        let brightness = numeric_commands(
            &json!({"value_min": 0, "value_max": 254}),
            "brightness",
            Some(&json!(100)),
        );
        assert!(brightness.contains_key("brighter"));
        assert!(!brightness.contains_key("louder"));

        let volume = numeric_commands(&json!({}), "volume", Some(&json!(5)));
        assert!(volume.contains_key("louder"));
        assert!(!volume.contains_key("brighter"));
        // No range: step falls back to 10
        assert_eq!(volume["louder"], json!(15));
        // No declared max means no absolute max phrases
        assert!(!volume.contains_key("max"));
    }

    #[test]
    fn unknown_category_has_no_synonyms() {
        let device: Device = serde_json::from_value(json!({
            "friendly_name": "mystery",
            "ieee_address": "0x0000000000000009",
        }))
        .unwrap();
        let doc = doc_with(device, None);
        let snapshot = build_snapshot(&doc);
        assert_eq!(snapshot["devices"][0]["categories"], json!([]));
    }

    #[test]
    fn zones_list_members_in_display_order() {
        let mut doc = doc_with(brightness_device(), None);
        let second: Device = serde_json::from_value(json!({
            "friendly_name": "a_sensor",
            "ieee_address": "0x0000000000000002",
            "state": {"temperature": 20}
        }))
        .unwrap();
        doc.device_zones
            .insert("a_sensor".to_string(), vec!["living_room".to_string()]);
        doc.device_cache.push(second);

        let snapshot = build_snapshot(&doc);
        assert_eq!(
            snapshot["zones"]["living_room"],
            json!(["a_sensor", "lamp"])
        );
    }

    #[test]
    fn regenerate_writes_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let path = dir.path().join("voice").join("intents.json");
        let generator = IntentGenerator::new(store, path.clone());

        generator.regenerate().unwrap();

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written.get("devices").is_some());
        assert!(written.get("zones").is_some());
    }
}
