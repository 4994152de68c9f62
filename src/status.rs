//! Server-list (status) responses
//!
//! The proxy answers status queries itself. While the backend is down it
//! serves a placeholder document with an annotated description; while the
//! backend is online it asks the backend and either merges the answer into
//! the placeholder or replays the backend's raw response.

use crate::codec::{self, HANDSHAKE_PACKET_ID};
use crate::config::{split_host_port, LifecycleConfig, StatusConfig};
use crate::error::{CodecError, ProxyError};
use crate::handshake::{Handshake, NextState};
use crate::lifecycle::{BackendManager, Lifecycle};
use crate::relay::{backend_io, dial_backend};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Port assumed for a backend address without a usable port
const DEFAULT_GAME_PORT: u16 = 25565;

/// JSON status document as shown in the server list
#[derive(Debug, Clone, PartialEq)]
pub struct StatusDocument(Value);

impl StatusDocument {
    /// Document shown before the backend has ever answered
    pub fn placeholder(config: &StatusConfig) -> Self {
        Self(json!({
            "version": {
                "name": config.version_name,
                "protocol": config.protocol,
            },
            "players": {
                "max": config.max_players,
                "online": 0,
            },
            "description": {
                "text": config.description,
            },
        }))
    }

    /// Parse a backend response. Only JSON objects are accepted.
    pub fn parse(json: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(json) {
            Ok(value @ Value::Object(_)) => Some(Self(value)),
            _ => None,
        }
    }

    /// Description text, whether stored as a bare string or as `{"text": ...}`
    pub fn description(&self) -> String {
        match self.0.get("description") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Object(obj)) => obj
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        }
    }

    /// Replace the description text, keeping its shape
    pub fn set_description(&mut self, text: String) {
        match self.0.get_mut("description") {
            Some(Value::String(current)) => *current = text,
            Some(Value::Object(obj)) => {
                obj.insert("text".to_string(), Value::String(text));
            }
            _ => {
                if let Value::Object(root) = &mut self.0 {
                    root.insert("description".to_string(), json!({ "text": text }));
                }
            }
        }
    }

    /// Copy of this document with `(note)` appended to the description
    pub fn annotated(&self, note: &str) -> Self {
        let mut copy = self.clone();
        copy.set_description(format!("{} ({})", self.description(), note));
        copy
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn to_json(&self) -> String {
        self.0.to_string()
    }
}

/// How status queries are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    /// Serve the placeholder, refreshed from the backend while it is online
    Merged,
    /// Replay the backend's last raw response frame
    RawCache,
}

/// Builds status responses for the status branch of the handshake
pub struct StatusResponder {
    mode: StatusMode,
    placeholder: Mutex<StatusDocument>,
    cached_response: Mutex<Option<Vec<u8>>>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl StatusResponder {
    pub fn new(status: &StatusConfig, lifecycle: &LifecycleConfig) -> Self {
        let mode = if status.cache {
            StatusMode::RawCache
        } else {
            StatusMode::Merged
        };
        Self {
            mode,
            placeholder: Mutex::new(StatusDocument::placeholder(status)),
            cached_response: Mutex::new(None),
            connect_timeout: lifecycle.connect_timeout(),
            io_timeout: lifecycle.io_timeout(),
        }
    }

    pub fn mode(&self) -> StatusMode {
        self.mode
    }

    /// Current unannotated placeholder
    pub fn placeholder(&self) -> StatusDocument {
        self.placeholder.lock().clone()
    }

    /// Last raw response frame captured from the backend
    pub fn cached_response(&self) -> Option<Vec<u8>> {
        self.cached_response.lock().clone()
    }

    /// Build the complete response frame for a status request.
    ///
    /// `handshake_raw` and `request_raw` are the exact bytes the client sent,
    /// replayed to the backend in raw-cache mode.
    pub async fn respond(
        &self,
        manager: &BackendManager,
        handshake: &Handshake,
        handshake_raw: &[u8],
        request_raw: &[u8],
    ) -> Result<Vec<u8>, ProxyError> {
        match self.mode {
            StatusMode::Merged => {
                let json = self.merged_status(manager, handshake.protocol_version).await;
                Ok(response_frame(&json)?)
            }
            StatusMode::RawCache => {
                let mut raw = Vec::with_capacity(handshake_raw.len() + request_raw.len());
                raw.extend_from_slice(handshake_raw);
                raw.extend_from_slice(request_raw);
                self.raw_status(manager, &raw).await
            }
        }
    }

    /// Status JSON for merged mode
    pub async fn merged_status(&self, manager: &BackendManager, protocol_version: u32) -> String {
        match manager.lifecycle() {
            Lifecycle::Offline => self.annotated_placeholder("idle"),
            Lifecycle::Starting => self.annotated_placeholder("starting"),
            Lifecycle::Online => {
                let fetched = fetch_status_json(
                    manager.backend_addr(),
                    protocol_version,
                    self.connect_timeout,
                    self.io_timeout,
                )
                .await;

                match fetched {
                    Ok(json) => match StatusDocument::parse(&json) {
                        Some(document) => {
                            *self.placeholder.lock() = document;
                            json
                        }
                        None => {
                            debug!("Backend status is not a JSON object yet");
                            self.annotated_placeholder("readying up")
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "Status fetch failed");
                        manager.mark_unreachable();
                        self.annotated_placeholder("idle")
                    }
                }
            }
        }
    }

    /// Response frame for raw-cache mode
    async fn raw_status(
        &self,
        manager: &BackendManager,
        request: &[u8],
    ) -> Result<Vec<u8>, ProxyError> {
        let mut lifecycle = manager.lifecycle();

        if lifecycle == Lifecycle::Online {
            match forward_status_request(
                manager.backend_addr(),
                request,
                self.connect_timeout,
                self.io_timeout,
            )
            .await
            {
                Ok(response) => {
                    *self.cached_response.lock() = Some(response.clone());
                    return Ok(response);
                }
                Err(e) => {
                    warn!(error = %e, "Status forward failed");
                    manager.mark_unreachable();
                    lifecycle = Lifecycle::Offline;
                }
            }
        }

        if let Some(cached) = self.cached_response() {
            return Ok(cached);
        }

        let note = match lifecycle {
            Lifecycle::Starting => "starting",
            _ => "idle",
        };
        Ok(response_frame(&self.annotated_placeholder(note))?)
    }

    fn annotated_placeholder(&self, note: &str) -> String {
        self.placeholder.lock().annotated(note).to_json()
    }
}

fn response_frame(json: &str) -> Result<Vec<u8>, CodecError> {
    codec::encode_frame(HANDSHAKE_PACKET_ID, &codec::encode_string(json))
}

/// Ask the backend for its status JSON over a fresh connection
async fn fetch_status_json(
    addr: &str,
    protocol_version: u32,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<String, ProxyError> {
    let (host, port) = split_host_port(addr).unwrap_or((addr, DEFAULT_GAME_PORT));
    let handshake = Handshake {
        protocol_version,
        server_address: host.to_string(),
        port,
        next_state: NextState::Status,
    };
    let mut request = handshake.encode()?;
    request.extend_from_slice(&codec::encode_frame(HANDSHAKE_PACKET_ID, &[])?);

    let response = forward_status_request(addr, &request, connect_timeout, io_timeout).await?;
    let mut stream: &[u8] = &response;
    let frame = codec::read_frame(&mut stream).await?;
    let (json, _) = codec::decode_string(&frame.payload)
        .map_err(|e| ProxyError::backend_unavailable(addr, e))?;
    Ok(json)
}

/// Send `request` to the backend and return its raw status response frame
async fn forward_status_request(
    addr: &str,
    request: &[u8],
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<Vec<u8>, ProxyError> {
    let mut stream = dial_backend(addr, connect_timeout).await?;
    backend_io(addr, io_timeout, stream.write_all(request)).await?;

    let frame = backend_io(addr, io_timeout, codec::read_frame(&mut stream)).await?;
    if !frame.is(HANDSHAKE_PACKET_ID) {
        return Err(ProxyError::backend_unavailable(
            addr,
            format!("unexpected status response (packet id {:#04x})", frame.id),
        ));
    }
    Ok(frame.raw)
}
