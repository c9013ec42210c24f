//! Voice worker supervision.
//!
//! The speech-to-intent worker is an external subprocess. It reads the intent
//! table this process generates and emits newline-delimited JSON events on
//! stdout: wake detections, transcriptions, resolved intents, status and
//! errors. This module owns the lifecycle — spawn, event loop, restart with
//! capped backoff — and turns worker events into WebSocket broadcasts plus
//! gateway commands. A machine without a working audio stack degrades to
//! retries and warnings; it never takes the controller down.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::VoiceConfig;
use crate::mqtt::Commander;
use crate::registry::Registry;
use crate::websocket::WsHub;

const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(60);
/// Deadline on subprocess control calls (kill, exit-status reap). Reads have
/// no deadline: the worker emits events only when someone speaks.
const EXTERNAL_CALL_DEADLINE: Duration = Duration::from_secs(10);

/// One stdout line from the worker.
#[derive(Debug, Deserialize)]
struct WorkerEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    property: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub fn spawn(
    cfg: VoiceConfig,
    registry: Arc<Registry>,
    commander: Commander,
    hub: Arc<WsHub>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some((program, args)) = cfg.worker_command.split_first() else {
            tracing::warn!("voice worker command is empty, voice disabled");
            return;
        };

        let mut backoff = Duration::from_secs(1);
        loop {
            let mut child = match tokio::process::Command::new(program)
                .args(args)
                .arg("--intents")
                .arg(&cfg.intents_path)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    tracing::warn!("voice worker failed to start: {} — retrying in {:?}", e, backoff);
                    hub.broadcast("voice_error", json!({ "message": e.to_string() }));
                    if wait_or_shutdown(&mut shutdown, backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
                    continue;
                }
            };

            let Some(stdout) = child.stdout.take() else {
                tracing::warn!("voice worker has no stdout, voice disabled");
                let _ = tokio::time::timeout(EXTERNAL_CALL_DEADLINE, child.kill()).await;
                return;
            };

            hub.broadcast("voice_status_changed", json!({ "status": "listening" }));
            tracing::info!("voice worker started");
            backoff = Duration::from_secs(1);

            let mut lines = BufReader::new(stdout).lines();
            let stopped = loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        let _ = tokio::time::timeout(EXTERNAL_CALL_DEADLINE, child.kill()).await;
                        break true;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => handle_line(&line, &registry, &commander, &hub),
                        Ok(None) => break false,
                        Err(e) => {
                            tracing::warn!("voice worker read error: {}", e);
                            break false;
                        }
                    }
                }
            };

            if stopped {
                tracing::info!("voice worker stopped");
                return;
            }

            let status = tokio::time::timeout(EXTERNAL_CALL_DEADLINE, child.wait()).await;
            tracing::warn!(?status, "voice worker exited — restarting in {:?}", backoff);
            hub.broadcast("voice_status_changed", json!({ "status": "restarting" }));
            if wait_or_shutdown(&mut shutdown, backoff).await {
                return;
            }
            backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
        }
    })
}

/// Sleep for `delay`, returning true if shutdown was signalled first.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn handle_line(line: &str, registry: &Registry, commander: &Commander, hub: &WsHub) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let event: WorkerEvent = match serde_json::from_str(line) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!("unparseable voice worker line: {} ({})", line, e);
            return;
        }
    };

    match event.kind.as_str() {
        "wake" => {
            hub.broadcast("voice_wake_detected", json!({}));
        }
        "transcription" => {
            hub.broadcast(
                "voice_transcription",
                json!({ "text": event.text.unwrap_or_default() }),
            );
        }
        "intent" => dispatch_intent(event, registry, commander, hub),
        "status" => {
            hub.broadcast(
                "voice_status_update",
                json!({ "status": event.status.unwrap_or_default() }),
            );
        }
        "error" => {
            hub.broadcast(
                "voice_error",
                json!({ "message": event.message.unwrap_or_default() }),
            );
        }
        other => {
            tracing::debug!(kind = %other, "unknown voice worker event");
        }
    }
}

fn dispatch_intent(event: WorkerEvent, registry: &Registry, commander: &Commander, hub: &WsHub) {
    let (Some(target), Some(property), Some(value)) =
        (event.device.as_deref(), event.property.as_deref(), event.value)
    else {
        hub.broadcast(
            "voice_intent_failed",
            json!({ "message": "intent missing device, property or value" }),
        );
        return;
    };

    let Some(device) = registry.resolve_device(target) else {
        tracing::warn!(target = %target, "voice intent names an unknown device");
        hub.broadcast(
            "voice_intent_failed",
            json!({ "message": format!("unknown device: {target}") }),
        );
        return;
    };

    // "TOGGLE" passes through untouched; the gateway flips binary properties
    // natively.
    let mut payload = serde_json::Map::new();
    payload.insert(property.to_string(), value.clone());
    commander.set_device(&device, &Value::Object(payload));
    hub.broadcast(
        "voice_command_processed",
        json!({
            "device": device,
            "property": property,
            "value": value,
            "text": event.text,
        }),
    );
}
