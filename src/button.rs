//! Press-gesture state machine for stateless button devices.
//!
//! The gateway reports raw press events; turning those into single / double /
//! long gestures needs a debounce window per `(device, property)` key. A
//! second press inside the window promotes to a double press and must
//! suppress the pending single; a hold event cancels the pending single and
//! fires immediately.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// A second press within this window counts as a double press.
pub const DOUBLE_PRESS_WINDOW: Duration = Duration::from_millis(600);
/// Hold classification delay for devices that report press/release pairs
/// instead of explicit hold events. Current gateways emit `hold` directly,
/// which fires without waiting on this.
#[allow(dead_code)]
pub const LONG_PRESS_DELAY: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    Single,
    Double,
    Long,
}

/// Outcome of registering a raw press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Press {
    /// First press of a potential sequence; the caller starts the debounce
    /// timer and confirms with [`ButtonFsm::confirm_single`] using this
    /// generation.
    First { generation: u64 },
    /// Second press inside the window; the pending single is cancelled.
    Double,
}

#[derive(Debug, Default)]
struct KeyState {
    last_press: Option<Instant>,
    press_count: u32,
    double_press_pending: bool,
    generation: u64,
}

#[derive(Default)]
pub struct ButtonFsm {
    keys: DashMap<(String, String), KeyState>,
}

impl ButtonFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw press for `(device, property)`.
    pub fn register_press(&self, device: &str, property: &str) -> Press {
        let mut entry = self
            .keys
            .entry((device.to_string(), property.to_string()))
            .or_default();
        let now = Instant::now();

        let within_window = entry
            .last_press
            .is_some_and(|t| now.duration_since(t) < DOUBLE_PRESS_WINDOW);

        if entry.double_press_pending && entry.press_count == 1 && within_window {
            entry.double_press_pending = false;
            entry.press_count = 0;
            Press::Double
        } else {
            entry.press_count = 1;
            entry.last_press = Some(now);
            entry.double_press_pending = true;
            entry.generation += 1;
            Press::First {
                generation: entry.generation,
            }
        }
    }

    /// Called when the debounce window elapses. Returns true exactly once per
    /// press sequence that was not promoted to a double or cancelled by a
    /// hold in the meantime.
    pub fn confirm_single(&self, device: &str, property: &str, generation: u64) -> bool {
        let key = (device.to_string(), property.to_string());
        let Some(mut entry) = self.keys.get_mut(&key) else {
            return false;
        };
        if entry.double_press_pending && entry.generation == generation {
            entry.double_press_pending = false;
            entry.press_count = 0;
            true
        } else {
            false
        }
    }

    /// A hold event arrived; any pending single-press must not fire.
    pub fn cancel_pending(&self, device: &str, property: &str) {
        let key = (device.to_string(), property.to_string());
        if let Some(mut entry) = self.keys.get_mut(&key) {
            entry.double_press_pending = false;
            entry.press_count = 0;
        }
    }
}
