// Talks to a running ComfyUI server.
// Everything interesting (sampling, LoRA blending, decoding) happens over there; we just
// queue the graph, watch it run, and fetch the results.

use std::{collections::BTreeSet, time::Instant};

use anyhow::{bail, Context, Result};
use futures::{select, FutureExt, Stream, StreamExt};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite as ws;
use tungstenite::Message;

use crate::{config::BackendConfig, flow::Flow};

/// How long we wait for websocket traffic before polling history anyway.
const IDLE_POLL_SECS: u64 = 30;

/// One image produced by an output node, as listed in /history.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "output".to_string()
}

#[derive(Debug, Clone)]
pub struct ComfyBackend {
    host: String,
    port: u16,
    client_id: String,
    timeout: std::time::Duration,
    http: reqwest::Client,
}

impl ComfyBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            timeout: std::time::Duration::from_secs(config.timeout_secs),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub async fn is_alive(&self) -> bool {
        match self.http.get(self.url("/system_stats")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                trace!("ComfyUI not reachable: {}", e);
                false
            }
        }
    }

    /// Names of every node class the server has loaded, custom nodes included.
    pub async fn registered_node_classes(&self) -> Result<BTreeSet<String>> {
        let info: Value = self
            .http
            .get(self.url("/object_info"))
            .send()
            .await
            .context("failed to fetch object_info")?
            .json()
            .await
            .context("failed to parse object_info")?;
        let info = info.as_object().context("object_info not an object")?;
        Ok(info.keys().cloned().collect())
    }

    pub async fn check_node_classes(&self, required: &BTreeSet<&str>) -> Result<()> {
        let registered = self.registered_node_classes().await?;
        debug!("Server knows {} node classes", registered.len());
        let missing = missing_classes(required, &registered);
        if !missing.is_empty() {
            bail!(
                "ComfyUI is missing node classes: {}. Are the custom node packs installed?",
                missing.join(", ")
            );
        }
        Ok(())
    }

    /// Queues the flow and returns its prompt ID.
    pub async fn submit(&self, flow: &Flow) -> Result<String> {
        #[derive(Serialize)]
        struct Request<'a> {
            prompt: Value,
            client_id: &'a str,
        }
        #[derive(Deserialize)]
        struct Response {
            prompt_id: String,
            #[allow(dead_code)]
            number: u32,
        }

        let request = Request {
            prompt: flow.to_prompt(),
            client_id: &self.client_id,
        };
        let response = self
            .http
            .post(self.url("/prompt"))
            .json(&request)
            .send()
            .await
            .context("failed to send prompt")?;
        let status = response.status();
        let text = response.text().await.context("failed to read response")?;
        trace!("Response: {}", text);
        if !status.is_success() {
            bail!("ComfyUI rejected the prompt ({}): {}", status, describe_rejection(&text));
        }
        let parsed = serde_json::from_str::<Response>(&text).context("failed to parse response")?;
        debug!("Got prompt ID {}", parsed.prompt_id);
        Ok(parsed.prompt_id)
    }

    /// Waits until the prompt shows up in history, and returns the images it produced.
    ///
    /// `events` is the server's websocket. We only use it to know when to poll; if it
    /// dies we keep polling on a timer.
    pub async fn wait_for_images<S>(&self, events: &mut S, prompt_id: &str) -> Result<Vec<ImageRef>>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let started = Instant::now();
        let mut ws_open = true;
        loop {
            // No sleep below may outlast the deadline.
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                bail!("timed out waiting for prompt {}", prompt_id);
            }
            let idle = remaining.min(std::time::Duration::from_secs(IDLE_POLL_SECS));
            let mut should_poll = true;
            if ws_open {
                select! {
                    msg = events.next().fuse() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let WsEvent::Error(e) = handle_ws_text(&text, prompt_id) {
                                    bail!("prompt {} failed: {}", prompt_id, e);
                                }
                            },
                            // Binary messages are latent previews.
                            Some(Ok(_)) => should_poll = false,
                            Some(Err(e)) => {
                                warn!("Websocket error, falling back to polling: {}", e);
                                ws_open = false;
                            },
                            None => {
                                warn!("Websocket closed, falling back to polling");
                                ws_open = false;
                            },
                        }
                    },
                    _ = futures_time::task::sleep(idle.into()).fuse() => {
                        trace!("Websocket idle");
                    },
                };
            } else {
                let tick = remaining.min(std::time::Duration::from_secs(1));
                futures_time::task::sleep(tick.into()).await;
            }

            if !should_poll {
                continue;
            }
            trace!("Polling history");
            let history: Value = self
                .http
                .get(self.url(&format!("/history/{}", prompt_id)))
                .send()
                .await
                .context("failed to poll history")?
                .json()
                .await
                .context("failed to parse history")?;
            if let Some(images) = parse_history(&history, prompt_id)? {
                return Ok(images);
            }
        }
    }

    pub async fn download(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(self.url("/view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await
            .context("failed to download image")?
            .error_for_status()
            .with_context(|| format!("server refused to serve {}", image.filename))?
            .bytes()
            .await
            .context("failed to read image")?;
        Ok(bytes.into())
    }

    /// Runs one flow end to end: queue it, wait for it, download what it saved.
    pub async fn generate(&self, flow: &Flow) -> Result<Vec<Vec<u8>>> {
        // Connect first, so we can't miss the prompt's own messages.
        let url = format!("ws://{}:{}/ws?clientId={}", self.host, self.port, self.client_id);
        let mut events = ws::connect_async(url)
            .await
            .context("failed to connect to websocket")?
            .0;
        let prompt_id = self.submit(flow).await?;
        info!("Queued prompt {}", prompt_id);
        let images = self.wait_for_images(&mut events, &prompt_id).await?;
        if images.is_empty() {
            bail!("prompt {} finished without producing images", prompt_id);
        }
        let mut data = Vec::with_capacity(images.len());
        for image in &images {
            data.push(self.download(image).await?);
        }
        Ok(data)
    }
}

fn missing_classes<'a>(
    required: &BTreeSet<&'a str>,
    registered: &BTreeSet<String>,
) -> Vec<&'a str> {
    required
        .iter()
        .filter(|c| !registered.contains(**c))
        .copied()
        .collect()
}

/// Pulls something readable out of a /prompt validation failure.
fn describe_rejection(text: &str) -> String {
    let Ok(body) = serde_json::from_str::<Value>(text) else {
        return text.to_string();
    };
    let mut parts = vec![];
    if let Some(message) = body.pointer("/error/message").and_then(|m| m.as_str()) {
        parts.push(message.to_string());
    }
    if let Some(node_errors) = body.get("node_errors").and_then(|n| n.as_object()) {
        for (node, error) in node_errors {
            let class = error.get("class_type").and_then(|c| c.as_str()).unwrap_or("?");
            let reasons = error
                .get("errors")
                .and_then(|e| e.as_array())
                .map(|errors| {
                    errors
                        .iter()
                        .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .unwrap_or_default();
            parts.push(format!("node {} ({}): {}", node, class, reasons));
        }
    }
    if parts.is_empty() {
        text.to_string()
    } else {
        parts.join(", ")
    }
}

#[derive(Debug, PartialEq)]
enum WsEvent {
    Progress { value: u64, max: u64 },
    Executing(Option<String>),
    Error(String),
    Other,
}

fn parse_ws_event(text: &str, prompt_id: &str) -> WsEvent {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return WsEvent::Other;
    };
    let data = &message["data"];
    // Messages about other clients' prompts are none of our business.
    if let Some(id) = data.get("prompt_id").and_then(|p| p.as_str()) {
        if id != prompt_id {
            return WsEvent::Other;
        }
    }
    match message["type"].as_str() {
        Some("progress") => WsEvent::Progress {
            value: data["value"].as_u64().unwrap_or(0),
            max: data["max"].as_u64().unwrap_or(0),
        },
        Some("executing") => WsEvent::Executing(data["node"].as_str().map(str::to_owned)),
        Some("execution_error") => WsEvent::Error(
            data["exception_message"]
                .as_str()
                .unwrap_or("unknown error")
                .trim()
                .to_string(),
        ),
        _ => WsEvent::Other,
    }
}

fn handle_ws_text(text: &str, prompt_id: &str) -> WsEvent {
    let event = parse_ws_event(text, prompt_id);
    match &event {
        WsEvent::Progress { value, max } => info!("Sampling: step {}/{}", value, max),
        WsEvent::Executing(Some(node)) => debug!("Executing node {}", node),
        WsEvent::Executing(None) => debug!("Execution finished"),
        WsEvent::Error(e) => warn!("Execution error: {}", e),
        WsEvent::Other => trace!("Got websocket message: {}", text),
    }
    event
}

/// Returns None while the prompt hasn't finished yet.
fn parse_history(history: &Value, prompt_id: &str) -> Result<Option<Vec<ImageRef>>> {
    let Some(entry) = history.get(prompt_id) else {
        return Ok(None);
    };
    trace!("History: {:?}", entry);
    if entry.pointer("/status/status_str").and_then(|s| s.as_str()) == Some("error") {
        let messages = entry
            .pointer("/status/messages")
            .map(|m| m.to_string())
            .unwrap_or_default();
        bail!("prompt {} failed on the server: {}", prompt_id, messages);
    }
    // They're at history[prompt_id].outputs.<node>.images[<index>].
    let outputs = entry
        .get("outputs")
        .and_then(|o| o.as_object())
        .context("history missing outputs")?;
    let mut images = Vec::new();
    for (node, output) in outputs {
        let Some(list) = output.get("images") else {
            continue;
        };
        let refs: Vec<ImageRef> = serde_json::from_value(list.clone())
            .with_context(|| format!("bad image list for node {}", node))?;
        for image in refs {
            // Preview nodes write to "temp"; we only want what was saved.
            if image.kind == "output" {
                images.push(image);
            } else {
                trace!("Skipping {} image {}", image.kind, image.filename);
            }
        }
    }
    Ok(Some(images))
}
