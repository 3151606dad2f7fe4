//! Minimal Chrome DevTools Protocol client.
//!
//! Commands are issued one at a time: [`CdpConnection::call`] sends a
//! command and reads the socket until the matching response arrives,
//! queueing any events it sees on the way so [`CdpConnection::wait_for_event`]
//! can pick them up later.

use std::collections::VecDeque;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::trace;

use pagesnap_core::RenderError;

/// Full-page captures of long pages arrive as one large base64 message.
const MAX_MESSAGE_BYTES: usize = 256 << 20;

/// An event pushed by the browser.
#[derive(Debug, Clone, PartialEq)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Incoming {
    Response {
        id: u64,
        result: std::result::Result<Value, String>,
    },
    Event(CdpEvent),
}

fn parse_incoming(text: &str) -> Result<Incoming, RenderError> {
    let mut value: Value = serde_json::from_str(text)
        .map_err(|e| RenderError::Protocol(format!("invalid DevTools message: {e}")))?;

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Ok(Incoming::Response {
                id,
                result: Err(message.to_string()),
            });
        }
        return Ok(Incoming::Response {
            id,
            result: Ok(value.get_mut("result").map(Value::take).unwrap_or(Value::Null)),
        });
    }

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| RenderError::Protocol("message has neither id nor method".into()))?
        .to_string();
    Ok(Incoming::Event(CdpEvent {
        method,
        params: value.get_mut("params").map(Value::take).unwrap_or(Value::Null),
        session_id: value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(String::from),
    }))
}

/// A DevTools WebSocket connection to a browser.
pub struct CdpConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    events: VecDeque<CdpEvent>,
}

impl CdpConnection {
    /// Connect to a browser-level DevTools endpoint (`ws://…/devtools/browser/…`).
    pub async fn connect(ws_url: &str) -> Result<Self, RenderError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_MESSAGE_BYTES);
        config.max_frame_size = Some(MAX_MESSAGE_BYTES);

        let (ws, _) = tokio_tungstenite::connect_async_with_config(ws_url, Some(config), true)
            .await
            .map_err(|e| RenderError::Launch(format!("DevTools connection failed: {e}")))?;
        Ok(Self {
            ws,
            next_id: 1,
            events: VecDeque::new(),
        })
    }

    /// Send a command and wait for its result.
    pub async fn call(
        &mut self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, RenderError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut command = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            command["sessionId"] = Value::String(session_id.to_string());
        }
        trace!(id, method, "DevTools command");
        self.ws
            .send(Message::Text(command.to_string()))
            .await
            .map_err(|e| RenderError::Crashed(format!("DevTools connection lost: {e}")))?;

        loop {
            match self.next_incoming().await? {
                Incoming::Response { id: got, result } if got == id => {
                    return result.map_err(|message| {
                        RenderError::Protocol(format!("{method} failed: {message}"))
                    });
                }
                Incoming::Response { id: other, .. } => {
                    trace!(id = other, "Ignoring response to unknown command");
                }
                Incoming::Event(event) => self.push_event(event)?,
            }
        }
    }

    /// Wait for the next event named `method` (for the given session, if any).
    pub async fn wait_for_event(
        &mut self,
        method: &str,
        session_id: Option<&str>,
    ) -> Result<CdpEvent, RenderError> {
        let matches = |event: &CdpEvent| {
            event.method == method
                && session_id.map_or(true, |s| event.session_id.as_deref() == Some(s))
        };

        if let Some(pos) = self.events.iter().position(matches) {
            if let Some(event) = self.events.remove(pos) {
                return Ok(event);
            }
        }

        loop {
            if let Incoming::Event(event) = self.next_incoming().await? {
                if matches(&event) {
                    return Ok(event);
                }
                self.push_event(event)?;
            }
        }
    }

    /// Close the socket without waiting for the browser.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    fn push_event(&mut self, event: CdpEvent) -> Result<(), RenderError> {
        if event.method == "Inspector.targetCrashed" {
            return Err(RenderError::Crashed("page target crashed".into()));
        }
        self.events.push_back(event);
        Ok(())
    }

    async fn next_incoming(&mut self) -> Result<Incoming, RenderError> {
        loop {
            let message = self
                .ws
                .next()
                .await
                .ok_or_else(|| RenderError::Crashed("DevTools connection closed".into()))?
                .map_err(|e| RenderError::Crashed(format!("DevTools connection lost: {e}")))?;

            match message {
                Message::Text(text) => return parse_incoming(&text),
                Message::Binary(bytes) => {
                    let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
                        RenderError::Protocol(format!("non UTF-8 DevTools message: {e}"))
                    })?;
                    return parse_incoming(&text);
                }
                Message::Close(_) => {
                    return Err(RenderError::Crashed("DevTools connection closed".into()))
                }
                _ => continue,
            }
        }
    }
}
