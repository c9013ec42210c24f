//! Device model as reported by the zigbee2mqtt gateway, plus category
//! inference over the `exposes` schema and current state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A device entry in the registry cache. Gateway-sourced fields are refreshed
/// on every `bridge/devices` broadcast; `state` is owned by the state pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub ieee_address: String,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub definition: Option<DeviceDefinition>,
    #[serde(default)]
    pub supported: bool,
    #[serde(default)]
    pub interview_completed: bool,
    #[serde(default)]
    pub state: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDefinition {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub exposes: Vec<Value>,
}

/// User-editable metadata kept orthogonal to gateway data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    Light,
    Switch,
    Sensor,
    Button,
    DoorWindow,
    Motion,
    Thermostat,
    Unknown,
}

impl DeviceCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Switch => "switch",
            Self::Sensor => "sensor",
            Self::Button => "button",
            Self::DoorWindow => "door_window",
            Self::Motion => "motion",
            Self::Thermostat => "thermostat",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "light" => Some(Self::Light),
            "switch" => Some(Self::Switch),
            "sensor" => Some(Self::Sensor),
            "button" => Some(Self::Button),
            "door_window" => Some(Self::DoorWindow),
            "motion" => Some(Self::Motion),
            "thermostat" => Some(Self::Thermostat),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Device {
    /// Deterministic category guess from exposes schema, current state and
    /// gateway device type. User overrides are applied by the registry on top.
    pub fn infer_category(&self) -> DeviceCategory {
        for expose in self.exposes() {
            match expose.get("type").and_then(Value::as_str) {
                Some("light") => return DeviceCategory::Light,
                Some("switch") => return DeviceCategory::Switch,
                Some("binary") => {
                    match expose.get("property").and_then(Value::as_str) {
                        Some("contact") => return DeviceCategory::DoorWindow,
                        Some("occupancy") | Some("motion") => return DeviceCategory::Motion,
                        Some("state") => return DeviceCategory::Switch,
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        if self
            .flat_exposes()
            .iter()
            .any(|e| e.get("property").and_then(Value::as_str) == Some("action"))
        {
            return DeviceCategory::Button;
        }

        if self.state.contains_key("brightness") {
            return DeviceCategory::Light;
        }
        if self.state.contains_key("temperature") || self.state.contains_key("humidity") {
            return DeviceCategory::Sensor;
        }
        if self.state.contains_key("contact") {
            return DeviceCategory::DoorWindow;
        }
        if self.state.contains_key("motion") || self.state.contains_key("occupancy") {
            return DeviceCategory::Motion;
        }
        if self.state.contains_key("action") {
            return DeviceCategory::Button;
        }
        if self.state.contains_key("power") {
            return DeviceCategory::Switch;
        }

        match self.r#type.as_str() {
            "EndDevice" => DeviceCategory::Sensor,
            "Router" => DeviceCategory::Light,
            _ => DeviceCategory::Unknown,
        }
    }

    /// Top-level exposes entries as published by the gateway.
    pub fn exposes(&self) -> &[Value] {
        self.definition
            .as_ref()
            .map(|d| d.exposes.as_slice())
            .unwrap_or(&[])
    }

    /// Exposes flattened through composite `features` arrays, so every entry
    /// is an individual property descriptor.
    pub fn flat_exposes(&self) -> Vec<&Value> {
        let mut out = Vec::new();
        for expose in self.exposes() {
            flatten_into(expose, &mut out);
        }
        out
    }

    /// True if this device can take part in scene application.
    pub fn is_light_capable(&self) -> bool {
        const LIGHT_KEYS: [&str; 3] = ["brightness", "color", "color_temp"];
        LIGHT_KEYS.iter().any(|k| self.state.contains_key(*k))
            || self.flat_exposes().iter().any(|e| {
                e.get("property")
                    .and_then(Value::as_str)
                    .is_some_and(|p| LIGHT_KEYS.contains(&p))
            })
    }

    /// Whether the gateway manages this device (subject to stale cleanup on
    /// broadcast merges).
    pub fn is_gateway_managed(&self) -> bool {
        self.ieee_address.starts_with("0x")
    }
}

fn flatten_into<'a>(expose: &'a Value, out: &mut Vec<&'a Value>) {
    if let Some(features) = expose.get("features").and_then(Value::as_array) {
        for feature in features {
            flatten_into(feature, out);
        }
    } else {
        out.push(expose);
    }
}

/// Gateway access bitmask: bit 1 = published, bit 2 = settable, bit 4 = gettable.
pub fn is_writable(expose: &Value) -> bool {
    expose
        .get("access")
        .and_then(Value::as_u64)
        .is_some_and(|bits| bits & 0b010 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device(exposes: Vec<Value>, state: Value, device_type: &str) -> Device {
        Device {
            ieee_address: "0x00158d0001234567".to_string(),
            friendly_name: "test".to_string(),
            r#type: device_type.to_string(),
            definition: Some(DeviceDefinition {
                exposes,
                ..Default::default()
            }),
            supported: true,
            interview_completed: true,
            state: state.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn light_expose_wins() {
        let d = device(
            vec![json!({"type": "light", "features": [{"property": "brightness", "access": 7}]})],
            json!({}),
            "Router",
        );
        assert_eq!(d.infer_category(), DeviceCategory::Light);
    }

    #[test]
    fn binary_contact_is_door_window() {
        let d = device(
            vec![json!({"type": "binary", "property": "contact"})],
            json!({}),
            "EndDevice",
        );
        assert_eq!(d.infer_category(), DeviceCategory::DoorWindow);
    }

    #[test]
    fn action_feature_is_button() {
        let d = device(
            vec![json!({"type": "enum", "property": "action", "values": ["single", "double"]})],
            json!({}),
            "EndDevice",
        );
        assert_eq!(d.infer_category(), DeviceCategory::Button);
    }

    #[test]
    fn state_keys_drive_fallback() {
        let d = device(vec![], json!({"temperature": 21.5, "humidity": 40}), "");
        assert_eq!(d.infer_category(), DeviceCategory::Sensor);

        let d = device(vec![], json!({"occupancy": false}), "");
        assert_eq!(d.infer_category(), DeviceCategory::Motion);

        let d = device(vec![], json!({"power": 12}), "");
        assert_eq!(d.infer_category(), DeviceCategory::Switch);
    }

    #[test]
    fn gateway_type_is_last_resort() {
        let d = device(vec![], json!({}), "EndDevice");
        assert_eq!(d.infer_category(), DeviceCategory::Sensor);

        let d = device(vec![], json!({}), "Router");
        assert_eq!(d.infer_category(), DeviceCategory::Light);

        let d = device(vec![], json!({}), "");
        assert_eq!(d.infer_category(), DeviceCategory::Unknown);
    }

    #[test]
    fn flat_exposes_unnests_features() {
        let d = device(
            vec![json!({
                "type": "light",
                "features": [
                    {"property": "state", "access": 7},
                    {"property": "brightness", "access": 7}
                ]
            })],
            json!({}),
            "Router",
        );
        let props: Vec<&str> = d
            .flat_exposes()
            .iter()
            .filter_map(|e| e.get("property").and_then(Value::as_str))
            .collect();
        assert_eq!(props, vec!["state", "brightness"]);
    }

    #[test]
    fn light_capability_from_exposes_or_state() {
        let by_expose = device(
            vec![json!({"type": "light", "features": [{"property": "brightness", "access": 7}]})],
            json!({}),
            "Router",
        );
        assert!(by_expose.is_light_capable());

        let by_state = device(vec![], json!({"color_temp": 300}), "");
        assert!(by_state.is_light_capable());

        let neither = device(vec![], json!({"contact": true}), "");
        assert!(!neither.is_light_capable());
    }

    #[test]
    fn writable_checks_set_bit() {
        assert!(is_writable(&json!({"access": 7})));
        assert!(is_writable(&json!({"access": 2})));
        assert!(!is_writable(&json!({"access": 1})));
        assert!(!is_writable(&json!({"access": 5})));
        assert!(!is_writable(&json!({})));
    }
}
