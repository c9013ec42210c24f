//! Scene model and engine.
//!
//! A scene is an ordered palette of HSV+brightness slots. Applying it to a
//! zone is deterministic: the zone's light-capable devices are sorted by
//! display name and device `i` receives slot `i mod len`, so the same scene
//! always paints the same light the same color.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Error;
use crate::mqtt::Commander;
use crate::registry::{DeviceView, Registry};
use crate::store::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub name: String,
    pub order: u32,
    pub is_custom: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    pub lights: Vec<SceneLight>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One color slot: hue 0–360, saturation 0–1, brightness 0–254.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SceneLight {
    pub hue: f64,
    pub saturation: f64,
    pub brightness: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SceneInput {
    pub name: String,
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default)]
    pub image_path: Option<String>,
    pub lights: Vec<SceneLight>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SceneOrder {
    pub id: String,
    pub order: u32,
}

/// Factory presets seeded into an empty scene document.
pub fn default_scenes() -> Vec<Scene> {
    let presets: [(&str, &str, &[(f64, f64, f64)]); 5] = [
        ("sunset", "Sunset", &[(15.0, 0.85, 200.0), (35.0, 0.75, 180.0), (350.0, 0.6, 160.0)]),
        ("ocean", "Ocean", &[(200.0, 0.8, 200.0), (220.0, 0.7, 180.0), (180.0, 0.5, 220.0)]),
        ("forest", "Forest", &[(120.0, 0.7, 180.0), (90.0, 0.6, 200.0), (140.0, 0.5, 160.0)]),
        ("reading", "Reading", &[(40.0, 0.25, 254.0)]),
        ("relax", "Relax", &[(30.0, 0.5, 120.0), (25.0, 0.6, 100.0)]),
    ];

    let now = Utc::now();
    presets
        .iter()
        .enumerate()
        .map(|(i, (id, name, slots))| Scene {
            id: (*id).to_string(),
            name: (*name).to_string(),
            order: i as u32,
            is_custom: false,
            image_path: None,
            lights: slots
                .iter()
                .map(|(hue, saturation, brightness)| SceneLight {
                    hue: *hue,
                    saturation: *saturation,
                    brightness: *brightness,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        })
        .collect()
}

pub struct SceneEngine {
    store: Arc<Store>,
    registry: Arc<Registry>,
    commander: Commander,
}

impl SceneEngine {
    pub fn new(store: Arc<Store>, registry: Arc<Registry>, commander: Commander) -> Self {
        Self {
            store,
            registry,
            commander,
        }
    }

    /// All scenes, sorted by `order` ascending.
    pub fn list(&self) -> Vec<Scene> {
        let mut scenes = self.store.with_scenes(|doc| doc.scenes.clone());
        scenes.sort_by_key(|s| s.order);
        scenes
    }

    pub fn get(&self, id: &str) -> Result<Scene, Error> {
        self.store
            .with_scenes(|doc| doc.scenes.iter().find(|s| s.id == id).cloned())
            .ok_or_else(|| Error::not_found("scene", id))
    }

    pub fn create(&self, input: SceneInput) -> Result<Scene, Error> {
        validate_input(&input)?;
        let now = Utc::now();
        let scene = self.store.update_scenes(|doc| {
            let order = input
                .order
                .unwrap_or_else(|| doc.scenes.iter().map(|s| s.order + 1).max().unwrap_or(0));
            let scene = Scene {
                id: uuid::Uuid::new_v4().to_string(),
                name: input.name.trim().to_string(),
                order,
                is_custom: true,
                image_path: input.image_path.clone(),
                lights: input.lights.clone(),
                created_at: now,
                updated_at: now,
            };
            doc.scenes.push(scene.clone());
            scene
        })?;
        tracing::info!(scene = %scene.name, "scene created");
        Ok(scene)
    }

    /// Update a scene in place. Factory presets stay non-custom.
    pub fn update(&self, id: &str, input: SceneInput) -> Result<Scene, Error> {
        validate_input(&input)?;
        let updated = self.store.update_scenes(|doc| {
            doc.scenes.iter_mut().find(|s| s.id == id).map(|scene| {
                scene.name = input.name.trim().to_string();
                if let Some(order) = input.order {
                    scene.order = order;
                }
                if input.image_path.is_some() {
                    scene.image_path = input.image_path.clone();
                }
                scene.lights = input.lights.clone();
                scene.updated_at = Utc::now();
                scene.clone()
            })
        })?;
        updated.ok_or_else(|| Error::not_found("scene", id))
    }

    pub fn delete(&self, id: &str) -> Result<(), Error> {
        enum Outcome {
            Deleted,
            Missing,
            Preset,
        }
        let outcome = self.store.update_scenes(|doc| {
            match doc.scenes.iter().position(|s| s.id == id) {
                None => Outcome::Missing,
                Some(idx) if !doc.scenes[idx].is_custom => Outcome::Preset,
                Some(idx) => {
                    doc.scenes.remove(idx);
                    Outcome::Deleted
                }
            }
        })?;
        match outcome {
            Outcome::Missing => Err(Error::not_found("scene", id)),
            Outcome::Preset => Err(Error::Forbidden(
                "built-in scenes cannot be deleted".to_string(),
            )),
            Outcome::Deleted => Ok(()),
        }
    }

    pub fn duplicate(&self, id: &str) -> Result<Scene, Error> {
        let source = self.get(id)?;
        self.create(SceneInput {
            name: format!("{} Copy", source.name),
            order: None,
            image_path: source.image_path,
            lights: source.lights,
        })
    }

    pub fn reorder(&self, orders: Vec<SceneOrder>) -> Result<(), Error> {
        self.store.update_scenes(|doc| {
            for entry in &orders {
                if let Some(scene) = doc.scenes.iter_mut().find(|s| s.id == entry.id) {
                    scene.order = entry.order;
                }
            }
        })?;
        Ok(())
    }

    // ── Application ──────────────────────────────────────

    /// Apply a stored scene to a zone; returns the number of lights driven.
    pub fn apply_in_zone(&self, scene_id: &str, zone: &str) -> Result<usize, Error> {
        let scene = self.get(scene_id)?;
        self.apply_lights(&scene.name, &scene.lights, zone)
    }

    /// Resolve by display name; automation rules reference scenes this way.
    pub fn apply_by_name(&self, scene_name: &str, zone: &str) -> Result<usize, Error> {
        let scene = self
            .store
            .with_scenes(|doc| doc.scenes.iter().find(|s| s.name == scene_name).cloned())
            .ok_or_else(|| Error::not_found("scene", scene_name))?;
        self.apply_lights(&scene.name, &scene.lights, zone)
    }

    /// Apply an ephemeral definition without persisting it.
    pub fn test_in_zone(&self, lights: &[SceneLight], zone: &str) -> Result<usize, Error> {
        self.apply_lights("(test)", lights, zone)
    }

    fn apply_lights(&self, name: &str, lights: &[SceneLight], zone: &str) -> Result<usize, Error> {
        if lights.is_empty() {
            return Err(Error::validation("scene has no color slots"));
        }

        let mut targets: Vec<DeviceView> = self
            .registry
            .devices_in_zone(zone, None)
            .into_iter()
            .filter(|v| v.device.is_light_capable())
            .collect();
        targets.sort_by(|a, b| a.display_name().cmp(b.display_name()));

        if targets.is_empty() {
            return Err(Error::not_found("light devices in zone", zone));
        }

        for (i, target) in targets.iter().enumerate() {
            let slot = &lights[i % lights.len()];
            let payload = json!({
                "state": "ON",
                "brightness": slot.brightness,
                "color": {
                    "hue": slot.hue,
                    "saturation": slot.saturation * 100.0,
                },
                "transition": 0.5,
            });
            self.commander.set_device(&target.device.friendly_name, &payload);
        }

        tracing::info!(scene = %name, zone = %zone, lights = targets.len(), "scene applied");
        Ok(targets.len())
    }
}

fn validate_input(input: &SceneInput) -> Result<(), Error> {
    let mut fields = Vec::new();
    if input.name.trim().is_empty() {
        fields.push("name must not be empty".to_string());
    }
    if input.lights.is_empty() {
        fields.push("lights must contain at least one color".to_string());
    }
    for (i, light) in input.lights.iter().enumerate() {
        if !(0.0..=360.0).contains(&light.hue) {
            fields.push(format!("lights[{i}].hue must be within 0..=360"));
        }
        if !(0.0..=1.0).contains(&light.saturation) {
            fields.push(format!("lights[{i}].saturation must be within 0..=1"));
        }
        if !(0.0..=254.0).contains(&light.brightness) {
            fields.push(format!("lights[{i}].brightness must be within 0..=254"));
        }
    }
    if fields.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation { fields })
    }
}
