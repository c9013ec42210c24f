//! Canonical device registry.
//!
//! A view over the document store: gateway broadcasts refresh the cache while
//! user-owned data (zones, metadata) is preserved, and every mutation saves
//! the document and regenerates the voice-intent table. Availability and
//! bridge health are runtime-only and not persisted.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::device::{Device, DeviceCategory, DeviceMetadata};
use crate::error::Error;
use crate::intents::IntentGenerator;
use crate::mqtt::Commander;
use crate::store::Store;

/// A device enriched with everything clients need: zone membership, user
/// metadata, the effective category and runtime availability.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: Device,
    pub zones: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_category: Option<String>,
    pub category: DeviceCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
}

impl DeviceView {
    /// Custom name when set, friendly name otherwise. Scene application sorts
    /// on this, so it is part of the determinism contract.
    pub fn display_name(&self) -> &str {
        self.custom_name
            .as_deref()
            .unwrap_or(&self.device.friendly_name)
    }
}

/// The effective category: user override first, inference otherwise.
pub fn effective_category(device: &Device, metadata: Option<&DeviceMetadata>) -> DeviceCategory {
    metadata
        .and_then(|m| m.custom_category.as_deref())
        .and_then(DeviceCategory::parse)
        .unwrap_or_else(|| device.infer_category())
}

pub struct Registry {
    store: Arc<Store>,
    intents: Arc<IntentGenerator>,
    commander: Commander,
    bridge_state: RwLock<String>,
    availability: DashMap<String, bool>,
}

impl Registry {
    pub fn new(store: Arc<Store>, intents: Arc<IntentGenerator>, commander: Commander) -> Self {
        Self {
            store,
            intents,
            commander,
            bridge_state: RwLock::new("unknown".to_string()),
            availability: DashMap::new(),
        }
    }

    // ── Gateway broadcast merge ──────────────────────────

    /// Merge a full `bridge/devices` broadcast into the cache. Devices in the
    /// broadcast are preserved with their gateway-sourced fields refreshed;
    /// cached gateway-managed devices absent from the broadcast are dropped.
    pub fn merge_broadcast(&self, incoming: Vec<Device>) -> Result<(), Error> {
        let (added, removed) = self.store.update_home(|doc| {
            let mut seen: HashSet<String> = HashSet::new();
            let mut added = 0usize;

            for device in incoming {
                if device.r#type == "Coordinator" {
                    continue;
                }
                seen.insert(device.friendly_name.clone());

                match doc
                    .device_cache
                    .iter_mut()
                    .find(|d| d.friendly_name == device.friendly_name)
                {
                    Some(existing) => {
                        existing.ieee_address = device.ieee_address;
                        existing.r#type = device.r#type;
                        existing.definition = device.definition;
                        existing.supported = device.supported;
                        existing.interview_completed = device.interview_completed;
                        // state, zones and metadata are user/pipeline-owned
                    }
                    None => {
                        added += 1;
                        doc.device_cache.push(device);
                    }
                }
            }

            let before = doc.device_cache.len();
            doc.device_cache
                .retain(|d| seen.contains(&d.friendly_name) || !d.is_gateway_managed());
            (added, before - doc.device_cache.len())
        })?;

        if added > 0 || removed > 0 {
            tracing::info!(added, removed, "device broadcast merged");
        }
        self.intents.regenerate_logged();
        Ok(())
    }

    /// Replace a cached device's state. Returns false for unknown devices.
    pub fn update_state(&self, device: &str, state: Map<String, Value>) -> Result<bool, Error> {
        let found = self.store.update_home(|doc| {
            match doc
                .device_cache
                .iter_mut()
                .find(|d| d.friendly_name == device)
            {
                Some(d) => {
                    d.state = state;
                    true
                }
                None => false,
            }
        })?;
        if found {
            self.intents.regenerate_logged();
        }
        Ok(found)
    }

    pub fn device_state(&self, device: &str) -> Option<Map<String, Value>> {
        self.store.with_home(|doc| {
            doc.device_cache
                .iter()
                .find(|d| d.friendly_name == device)
                .map(|d| d.state.clone())
        })
    }

    pub fn device(&self, device: &str) -> Option<Device> {
        self.store.with_home(|doc| {
            doc.device_cache
                .iter()
                .find(|d| d.friendly_name == device)
                .cloned()
        })
    }

    pub fn devices(&self) -> Vec<DeviceView> {
        self.store.with_home(|doc| {
            doc.device_cache
                .iter()
                .map(|d| self.view_of(doc, d))
                .collect()
        })
    }

    pub fn view(&self, device: &str) -> Option<DeviceView> {
        self.store.with_home(|doc| {
            doc.device_cache
                .iter()
                .find(|d| d.friendly_name == device)
                .map(|d| self.view_of(doc, d))
        })
    }

    /// Resolve a voice-side identifier: IEEE address, friendly name, or
    /// custom name (case-insensitive). Returns the friendly name.
    pub fn resolve_device(&self, ident: &str) -> Option<String> {
        self.store.with_home(|doc| {
            let lowered = ident.to_lowercase();
            doc.device_cache
                .iter()
                .find(|d| {
                    d.ieee_address == ident
                        || d.friendly_name.to_lowercase() == lowered
                        || doc
                            .device_metadata
                            .get(&d.friendly_name)
                            .and_then(|m| m.custom_name.as_deref())
                            .is_some_and(|n| n.to_lowercase() == lowered)
                })
                .map(|d| d.friendly_name.clone())
        })
    }

    /// Delete a device: cache entry, zone assignments and metadata go, and
    /// the gateway is told to forget it. Automations that still reference the
    /// device are left alone and warn when run.
    pub fn delete_device(&self, device: &str) -> Result<(), Error> {
        let found = self.store.update_home(|doc| {
            let before = doc.device_cache.len();
            doc.device_cache.retain(|d| d.friendly_name != device);
            if doc.device_cache.len() == before {
                return false;
            }
            doc.device_zones.remove(device);
            doc.device_metadata.remove(device);
            true
        })?;

        if !found {
            return Err(Error::not_found("device", device));
        }

        self.availability.remove(device);
        self.commander.forget_device(device);
        self.intents.regenerate_logged();
        tracing::info!(device = %device, "device deleted");
        Ok(())
    }

    /// A device left the network on its own (`bridge/event` device_leave).
    /// Drops the cache entry like stale cleanup does; zone assignments and
    /// metadata survive in case it rejoins.
    pub fn remove_departed(&self, device: &str) {
        let removed = self.store.update_home(|doc| {
            let before = doc.device_cache.len();
            doc.device_cache.retain(|d| d.friendly_name != device);
            doc.device_cache.len() != before
        });
        match removed {
            Ok(true) => {
                self.availability.remove(device);
                self.intents.regenerate_logged();
            }
            Ok(false) => {}
            Err(e) => tracing::error!(device = %device, "failed to drop departed device: {}", e),
        }
    }

    // ── Zones ────────────────────────────────────────────

    pub fn zones(&self) -> Vec<String> {
        self.store.with_home(|doc| doc.zones.clone())
    }

    pub fn create_zone(&self, name: &str) -> Result<(), Error> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("zone name must not be empty"));
        }
        let created = self.store.update_home(|doc| {
            if doc.zones.iter().any(|z| z == name) {
                false
            } else {
                doc.zones.push(name.to_string());
                true
            }
        })?;
        if !created {
            return Err(Error::Conflict(format!("zone already exists: {name}")));
        }
        self.intents.regenerate_logged();
        Ok(())
    }

    /// Rename a zone and update every device's zone list in the same write,
    /// so no intermediate state is observable.
    pub fn rename_zone(&self, old: &str, new: &str) -> Result<(), Error> {
        let new = new.trim();
        if new.is_empty() {
            return Err(Error::validation("new zone name must not be empty"));
        }

        enum Outcome {
            Renamed,
            Missing,
            Duplicate,
        }

        let outcome = self.store.update_home(|doc| {
            let Some(idx) = doc.zones.iter().position(|z| z == old) else {
                return Outcome::Missing;
            };
            if old != new && doc.zones.iter().any(|z| z == new) {
                return Outcome::Duplicate;
            }
            doc.zones[idx] = new.to_string();
            for zones in doc.device_zones.values_mut() {
                for zone in zones.iter_mut() {
                    if zone == old {
                        *zone = new.to_string();
                    }
                }
            }
            Outcome::Renamed
        })?;

        match outcome {
            Outcome::Missing => Err(Error::not_found("zone", old)),
            Outcome::Duplicate => Err(Error::Conflict(format!("zone already exists: {new}"))),
            Outcome::Renamed => {
                self.intents.regenerate_logged();
                Ok(())
            }
        }
    }

    /// Delete a zone; devices lose the assignment but survive.
    pub fn delete_zone(&self, name: &str) -> Result<(), Error> {
        let found = self.store.update_home(|doc| {
            let before = doc.zones.len();
            doc.zones.retain(|z| z != name);
            if doc.zones.len() == before {
                return false;
            }
            for zones in doc.device_zones.values_mut() {
                zones.retain(|z| z != name);
            }
            doc.device_zones.retain(|_, zones| !zones.is_empty());
            true
        })?;
        if !found {
            return Err(Error::not_found("zone", name));
        }
        self.intents.regenerate_logged();
        Ok(())
    }

    pub fn zone_devices(&self, zone: &str) -> Result<Vec<String>, Error> {
        self.store.with_home(|doc| {
            if !doc.zones.iter().any(|z| z == zone) {
                return Err(Error::not_found("zone", zone));
            }
            let mut names: Vec<String> = doc
                .device_zones
                .iter()
                .filter(|(_, zones)| zones.iter().any(|z| z == zone))
                .map(|(device, _)| device.clone())
                .collect();
            names.sort();
            Ok(names)
        })
    }

    pub fn assign_zone(&self, device: &str, zone: &str) -> Result<(), Error> {
        enum Outcome {
            Ok,
            NoZone,
            NoDevice,
        }
        let outcome = self.store.update_home(|doc| {
            if !doc.zones.iter().any(|z| z == zone) {
                return Outcome::NoZone;
            }
            if !doc.device_cache.iter().any(|d| d.friendly_name == device) {
                return Outcome::NoDevice;
            }
            let zones = doc.device_zones.entry(device.to_string()).or_default();
            if !zones.iter().any(|z| z == zone) {
                zones.push(zone.to_string());
            }
            Outcome::Ok
        })?;
        match outcome {
            Outcome::NoZone => Err(Error::not_found("zone", zone)),
            Outcome::NoDevice => Err(Error::not_found("device", device)),
            Outcome::Ok => {
                self.intents.regenerate_logged();
                Ok(())
            }
        }
    }

    pub fn unassign_zone(&self, device: &str, zone: &str) -> Result<(), Error> {
        let found = self.store.update_home(|doc| {
            match doc.device_zones.get_mut(device) {
                Some(zones) => {
                    let before = zones.len();
                    zones.retain(|z| z != zone);
                    let changed = zones.len() != before;
                    if zones.is_empty() {
                        doc.device_zones.remove(device);
                    }
                    changed
                }
                None => false,
            }
        })?;
        if !found {
            return Err(Error::not_found("zone assignment", format!("{device}/{zone}")));
        }
        self.intents.regenerate_logged();
        Ok(())
    }

    /// Devices assigned to a zone, optionally narrowed to one category.
    pub fn devices_in_zone(&self, zone: &str, category: Option<DeviceCategory>) -> Vec<DeviceView> {
        self.store.with_home(|doc| {
            doc.device_cache
                .iter()
                .filter(|d| {
                    doc.device_zones
                        .get(&d.friendly_name)
                        .is_some_and(|zones| zones.iter().any(|z| z == zone))
                })
                .map(|d| self.view_of(doc, d))
                .filter(|v| category.is_none_or(|c| v.category == c))
                .collect()
        })
    }

    // ── Metadata ─────────────────────────────────────────

    pub fn set_custom_name(&self, device: &str, custom_name: Option<String>) -> Result<(), Error> {
        self.mutate_metadata(device, |meta| {
            meta.custom_name = custom_name.filter(|n| !n.trim().is_empty());
        })
    }

    pub fn set_custom_category(&self, device: &str, category: Option<String>) -> Result<(), Error> {
        if let Some(c) = &category {
            if DeviceCategory::parse(c).is_none() {
                return Err(Error::validation(format!("unknown category: {c}")));
            }
        }
        self.mutate_metadata(device, |meta| {
            meta.custom_category = category;
        })
    }

    pub fn metadata(&self, device: &str) -> Result<DeviceMetadata, Error> {
        self.store.with_home(|doc| {
            if !doc.device_cache.iter().any(|d| d.friendly_name == device) {
                return Err(Error::not_found("device", device));
            }
            Ok(doc.device_metadata.get(device).cloned().unwrap_or_default())
        })
    }

    fn mutate_metadata(
        &self,
        device: &str,
        f: impl FnOnce(&mut DeviceMetadata),
    ) -> Result<(), Error> {
        let found = self.store.update_home(|doc| {
            if !doc.device_cache.iter().any(|d| d.friendly_name == device) {
                return false;
            }
            let meta = doc.device_metadata.entry(device.to_string()).or_default();
            f(meta);
            if meta.custom_name.is_none() && meta.custom_category.is_none() {
                doc.device_metadata.remove(device);
            }
            true
        })?;
        if !found {
            return Err(Error::not_found("device", device));
        }
        self.intents.regenerate_logged();
        Ok(())
    }

    // ── Runtime health ───────────────────────────────────

    pub fn set_bridge_state(&self, state: String) {
        *self
            .bridge_state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn bridge_state(&self) -> String {
        self.bridge_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_availability(&self, device: &str, online: bool) {
        self.availability.insert(device.to_string(), online);
    }

    fn view_of(&self, doc: &crate::store::HomeDocument, device: &Device) -> DeviceView {
        let metadata = doc.device_metadata.get(&device.friendly_name);
        DeviceView {
            zones: doc
                .device_zones
                .get(&device.friendly_name)
                .cloned()
                .unwrap_or_default(),
            custom_name: metadata.and_then(|m| m.custom_name.clone()),
            custom_category: metadata.and_then(|m| m.custom_category.clone()),
            category: effective_category(device, metadata),
            available: self
                .availability
                .get(&device.friendly_name)
                .map(|entry| *entry.value()),
            device: device.clone(),
        }
    }
}
