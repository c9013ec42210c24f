//! MQTT adapter for the zigbee2mqtt gateway.
//!
//! Inbound: subscribes to `{base_topic}/#` and routes bridge broadcasts,
//! device state updates and availability messages. Outbound: every producer
//! holds a [`Commander`] that enqueues publishes onto an in-process channel,
//! so issuing a command never blocks on the broker. The event loop reconnects
//! with capped exponential backoff and re-subscribes after each reconnect.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::device::Device;
use crate::dispatch::Dispatcher;
use crate::registry::Registry;

const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Deadline on every outbound broker call; a wedged broker connection must
/// not pin the publisher task.
const EXTERNAL_CALL_DEADLINE: Duration = Duration::from_secs(10);

/// A queued outbound publish.
#[derive(Debug, Clone)]
pub struct MqttPublish {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

pub type CommandSender = mpsc::UnboundedSender<MqttPublish>;
pub type CommandReceiver = mpsc::UnboundedReceiver<MqttPublish>;

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

/// Handle used by the automation engine, scene engine, voice worker and REST
/// layer to issue gateway commands. Cheap to clone; injected at construction.
#[derive(Clone)]
pub struct Commander {
    tx: CommandSender,
    base_topic: Arc<str>,
}

impl Commander {
    pub fn new(tx: CommandSender, base_topic: &str) -> Self {
        Self {
            tx,
            base_topic: base_topic.into(),
        }
    }

    /// Publish a property map to `{base}/{device}/set`.
    pub fn set_device(&self, device: &str, payload: &Value) {
        self.publish(
            format!("{}/{}/set", self.base_topic, device),
            payload.to_string(),
        );
    }

    /// Ask the gateway to forget a device.
    pub fn forget_device(&self, device: &str) {
        self.publish(
            format!("{}/bridge/request/device/remove", self.base_topic),
            serde_json::json!({ "id": device }).to_string(),
        );
    }

    /// Open or close the gateway pairing window.
    pub fn permit_join(&self, value: bool, time_secs: u32) {
        self.publish(
            format!("{}/bridge/request/permit_join", self.base_topic),
            serde_json::json!({ "value": value, "time": time_secs }).to_string(),
        );
    }

    fn publish(&self, topic: String, payload: String) {
        let queued = self.tx.send(MqttPublish {
            topic,
            payload,
            retain: false,
        });
        if queued.is_err() {
            tracing::warn!("MQTT command channel closed, dropping publish");
        }
    }
}

/// Start the MQTT client: one task drains the command channel into the
/// broker, the main task runs the event loop and routes inbound messages.
pub fn start(
    cfg: MqttConfig,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
    mut cmd_rx: CommandReceiver,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut options = MqttOptions::new("sumika", &cfg.broker, cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        if let Some(user) = &cfg.user {
            options.set_credentials(user, cfg.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 256);

        let publisher = client.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                tracing::debug!(topic = %cmd.topic, "MQTT publish");
                let topic = cmd.topic.clone();
                let publish = publisher.publish(cmd.topic, QoS::AtLeastOnce, cmd.retain, cmd.payload);
                match tokio::time::timeout(EXTERNAL_CALL_DEADLINE, publish).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(topic = %topic, "MQTT publish failed: {}", e),
                    Err(_) => tracing::warn!(
                        topic = %topic,
                        "MQTT publish timed out after {:?}", EXTERNAL_CALL_DEADLINE
                    ),
                }
            }
        });

        let subscription = format!("{}/#", cfg.base_topic);
        let mut backoff = Duration::from_secs(1);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = tokio::time::timeout(EXTERNAL_CALL_DEADLINE, client.disconnect()).await;
                    tracing::info!("MQTT client disconnected");
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff = Duration::from_secs(1);
                        tracing::info!(broker = %cfg.broker, "MQTT connected");
                        let subscribe = client.subscribe(&subscription, QoS::AtMostOnce);
                        match tokio::time::timeout(EXTERNAL_CALL_DEADLINE, subscribe).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => tracing::error!("MQTT subscribe failed: {}", e),
                            Err(_) => tracing::error!(
                                "MQTT subscribe timed out after {:?}", EXTERNAL_CALL_DEADLINE
                            ),
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_message(
                            &cfg.base_topic,
                            &publish.topic,
                            &publish.payload,
                            &dispatcher,
                            &registry,
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("MQTT connection error: {} — retrying in {:?}", e, backoff);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    DeviceBroadcast,
    BridgeState,
    BridgeEvent,
    BridgeLog,
    BridgeOther,
    DeviceState(&'a str),
    Availability(&'a str),
    Ignore,
}

fn classify<'a>(base_topic: &str, topic: &'a str) -> Route<'a> {
    let Some(rest) = topic
        .strip_prefix(base_topic)
        .and_then(|r| r.strip_prefix('/'))
    else {
        return Route::Ignore;
    };

    match rest {
        "bridge/devices" => Route::DeviceBroadcast,
        "bridge/state" => Route::BridgeState,
        "bridge/event" => Route::BridgeEvent,
        "bridge/logging" => Route::BridgeLog,
        _ if rest.starts_with("bridge/") => Route::BridgeOther,
        _ => {
            if let Some(name) = rest.strip_suffix("/availability") {
                Route::Availability(name)
            } else if rest.contains('/') {
                // Our own /set publishes echo back through the wildcard.
                Route::Ignore
            } else {
                Route::DeviceState(rest)
            }
        }
    }
}

async fn handle_message(
    base_topic: &str,
    topic: &str,
    payload: &[u8],
    dispatcher: &Dispatcher,
    registry: &Registry,
) {
    match classify(base_topic, topic) {
        Route::DeviceBroadcast => {
            let devices: Vec<Device> = match serde_json::from_slice(payload) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("failed to parse bridge/devices: {}", e);
                    return;
                }
            };
            if let Err(e) = registry.merge_broadcast(devices) {
                tracing::error!("device broadcast merge failed: {}", e);
            }
        }
        Route::BridgeState => {
            let state = parse_bridge_state(payload);
            tracing::info!("gateway bridge state: {}", state);
            registry.set_bridge_state(state);
        }
        Route::BridgeEvent => {
            if let Ok(event) = serde_json::from_slice::<Value>(payload) {
                handle_bridge_event(&event, registry);
            }
        }
        Route::BridgeLog => {
            if let Ok(entry) = serde_json::from_slice::<Value>(payload) {
                let message = entry.get("message").and_then(Value::as_str).unwrap_or("");
                tracing::debug!(gateway = true, "{}", message);
            }
        }
        Route::BridgeOther => {}
        Route::Availability(device) => {
            let text = String::from_utf8_lossy(payload);
            let online = matches!(text.trim().to_lowercase().as_str(), "online" | "true" | "1");
            registry.set_availability(device, online);
        }
        Route::DeviceState(device) => {
            let state: Map<String, Value> = match serde_json::from_slice(payload) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(device = %device, "unparseable state payload: {}", e);
                    return;
                }
            };
            dispatcher.ingest(device, state).await;
        }
        Route::Ignore => {}
    }
}

/// Pairing lifecycle notifications. Joins and interviews are informational
/// (the follow-up `bridge/devices` broadcast carries the real data); a leave
/// drops the device from the cache immediately.
fn handle_bridge_event(event: &Value, registry: &Registry) {
    let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
    let data = event.get("data").cloned().unwrap_or(Value::Null);
    let name = data
        .get("friendly_name")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    match kind {
        "device_joined" => {
            tracing::info!(device = %name, "gateway: device joined");
        }
        "device_interview" => {
            let status = data.get("status").and_then(Value::as_str).unwrap_or("unknown");
            tracing::info!(device = %name, status = %status, "gateway: device interview");
        }
        "device_leave" => {
            tracing::info!(device = %name, "gateway: device left");
            registry.remove_departed(name);
        }
        other => {
            tracing::debug!(kind = %other, "gateway bridge event");
        }
    }
}

/// The gateway publishes bridge state as plain text (`online`) or JSON
/// (`{"state":"online"}`) depending on version.
fn parse_bridge_state(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if let Ok(json) = serde_json::from_str::<Value>(&text) {
        if let Some(state) = json.get("state").and_then(Value::as_str) {
            return state.to_string();
        }
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_routes_bridge_topics() {
        assert_eq!(
            classify("zigbee2mqtt", "zigbee2mqtt/bridge/devices"),
            Route::DeviceBroadcast
        );
        assert_eq!(
            classify("zigbee2mqtt", "zigbee2mqtt/bridge/state"),
            Route::BridgeState
        );
        assert_eq!(
            classify("zigbee2mqtt", "zigbee2mqtt/bridge/event"),
            Route::BridgeEvent
        );
        assert_eq!(
            classify("zigbee2mqtt", "zigbee2mqtt/bridge/logging"),
            Route::BridgeLog
        );
        assert_eq!(
            classify("zigbee2mqtt", "zigbee2mqtt/bridge/info"),
            Route::BridgeOther
        );
    }

    #[test]
    fn classify_routes_device_topics() {
        assert_eq!(
            classify("zigbee2mqtt", "zigbee2mqtt/kitchen_lamp"),
            Route::DeviceState("kitchen_lamp")
        );
        assert_eq!(
            classify("zigbee2mqtt", "zigbee2mqtt/kitchen_lamp/availability"),
            Route::Availability("kitchen_lamp")
        );
        // Command echoes and foreign roots are ignored
        assert_eq!(
            classify("zigbee2mqtt", "zigbee2mqtt/kitchen_lamp/set"),
            Route::Ignore
        );
        assert_eq!(classify("zigbee2mqtt", "homeassistant/x/config"), Route::Ignore);
    }

    #[test]
    fn bridge_state_accepts_both_forms() {
        assert_eq!(parse_bridge_state(b"online"), "online");
        assert_eq!(parse_bridge_state(br#"{"state":"offline"}"#), "offline");
        assert_eq!(parse_bridge_state(b"  offline \n"), "offline");
    }

    #[tokio::test]
    async fn commander_builds_set_topics() {
        let (tx, mut rx) = command_channel();
        let commander = Commander::new(tx, "zigbee2mqtt");

        commander.set_device("lamp", &serde_json::json!({"state": "ON"}));
        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.topic, "zigbee2mqtt/lamp/set");
        assert_eq!(cmd.payload, r#"{"state":"ON"}"#);
        assert!(!cmd.retain);
    }

    #[tokio::test]
    async fn commander_forget_targets_bridge_request() {
        let (tx, mut rx) = command_channel();
        let commander = Commander::new(tx, "zigbee2mqtt");

        commander.forget_device("old_sensor");
        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.topic, "zigbee2mqtt/bridge/request/device/remove");
        assert_eq!(cmd.payload, r#"{"id":"old_sensor"}"#);
    }
}
