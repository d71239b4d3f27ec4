//! WebSocket client for the list sync server.
//!
//! Requests carry a fresh correlation id and wait for the frame echoing
//! it. A request without a reply after the timeout (3 s by default) fails
//! with [`ClientError::Timeout`]; a reply arriving later is ignored.
//! Broadcasts surface as [`ListEvent`]s.

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::model::{Item, ItemBroadcast, ItemDraft, ItemId, NestedList};
use crate::protocol::{
    CreateListResponse, ErrorBody, InboundFrame, ItemAck, OutboundFrame, ProtocolError,
    TYPE_CREATE_LIST, TYPE_DELETE_ITEM, TYPE_ERROR, TYPE_GET_LIST, TYPE_RESPONSE, TYPE_SAVE_ITEM,
};

/// How long a request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Request {0} timed out")]
    Timeout(String),
    #[error("{0}")]
    Server(ErrorBody),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl ClientError {
    /// Wire error code, when the failure has one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Timeout(_) => Some(ErrorCode::Timeout),
            ClientError::Server(body) => Some(body.code),
            _ => None,
        }
    }
}

/// Server-initiated notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ListEvent {
    ItemSaved(ItemBroadcast),
    ItemDeleted(Item),
    /// Error frame not matching any pending request.
    Error(ErrorBody),
    Disconnected,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<OutboundFrame>>>>;

/// Connected list client.
pub struct ListClient {
    outgoing: mpsc::Sender<String>,
    pending: Pending,
    events: Option<mpsc::Receiver<ListEvent>>,
    connected: Arc<AtomicBool>,
    timeout: Duration,
}

impl ListClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:3000`).
    ///
    /// Spawns a writer task and a reader task for the socket.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::text(text)).await {
                    log::debug!("Client write failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route replies to pending requests, broadcasts to events
        let reader_pending = pending.clone();
        let reader_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match OutboundFrame::decode(text.as_str()) {
                        Ok(frame) => route(frame, &reader_pending, &event_tx).await,
                        Err(e) => log::warn!("Client received undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            // Dropping the senders fails every in-flight request.
            reader_pending.lock().await.clear();
            let _ = event_tx.send(ListEvent::Disconnected).await;
        });

        Ok(Self {
            outgoing: out_tx,
            pending,
            events: Some(event_rx),
            connected,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ListEvent>> {
        self.events.take()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send one request and wait for the frame echoing its id.
    pub async fn request(
        &self,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let frame = InboundFrame {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            data,
        };
        let text = serde_json::to_string(&frame)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(frame.id.clone(), tx);

        if self.outgoing.send(text).await.is_err() {
            self.pending.lock().await.remove(&frame.id);
            return Err(ClientError::NotConnected);
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ClientError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&frame.id);
                log::warn!("{kind} request {} timed out", frame.id);
                return Err(ClientError::Timeout(frame.id));
            }
        };

        match (reply.error, reply.data) {
            (Some(error), _) => Err(ClientError::Server(error)),
            (None, Some(data)) => Ok(data),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<T, ClientError> {
        let value = self.request(kind, data).await?;
        serde_json::from_value(value).map_err(|e| ClientError::UnexpectedReply(e.to_string()))
    }

    /// Create a list; the client is subscribed to it.
    pub async fn create_list(&self) -> Result<Uuid, ClientError> {
        let created: CreateListResponse = self.call(TYPE_CREATE_LIST, serde_json::json!({})).await?;
        Ok(created.id)
    }

    /// Fetch a list's ordered tree and subscribe to it.
    pub async fn get_list(&self, uuid: Uuid) -> Result<NestedList, ClientError> {
        self.call(TYPE_GET_LIST, serde_json::json!({ "uuid": uuid })).await
    }

    pub async fn save_item(
        &self,
        uuid: Uuid,
        item: &ItemDraft,
        index: Option<i64>,
    ) -> Result<ItemAck, ClientError> {
        let mut data = serde_json::json!({ "uuid": uuid, "item": item });
        if let Some(index) = index {
            data["index"] = serde_json::json!(index);
        }
        self.call(TYPE_SAVE_ITEM, data).await
    }

    pub async fn delete_item(&self, uuid: Uuid, id: ItemId) -> Result<ItemAck, ClientError> {
        self.call(TYPE_DELETE_ITEM, serde_json::json!({ "uuid": uuid, "item": { "id": id } }))
            .await
    }
}

async fn route(frame: OutboundFrame, pending: &Pending, events: &mpsc::Sender<ListEvent>) {
    let event = match frame.kind.as_str() {
        TYPE_RESPONSE | TYPE_ERROR => {
            let waiter = pending.lock().await.remove(&frame.id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(frame);
                    None
                }
                None => match frame.error {
                    Some(error) => Some(ListEvent::Error(error)),
                    None => {
                        log::debug!("Ignoring late reply {}", frame.id);
                        None
                    }
                },
            }
        }
        TYPE_SAVE_ITEM => decode_payload(frame.data).map(ListEvent::ItemSaved),
        TYPE_DELETE_ITEM => decode_payload(frame.data).map(ListEvent::ItemDeleted),
        other => {
            log::debug!("Ignoring frame of type {other}");
            None
        }
    };

    if let Some(event) = event {
        let _ = events.send(event).await;
    }
}

fn decode_payload<T: DeserializeOwned>(data: Option<serde_json::Value>) -> Option<T> {
    let data = data?;
    match serde_json::from_value(data) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Client received malformed broadcast: {e}");
            None
        }
    }
}
