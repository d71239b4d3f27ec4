//! Inbound frame dispatch.
//!
//! Frames of one connection are handled one at a time, in arrival order.
//! Recognized errors become an error frame for the origin; fatal ones also
//! close the origin's connection.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::error::{ErrorCode, SyncError};
use crate::protocol::{
    DeleteItemRequest, GetListRequest, InboundFrame, OutboundFrame, RequestKind, SaveItemRequest,
};
use crate::report::SharedReporter;
use crate::service::ListService;

/// What the connection task does after a frame.
///
/// Replies to the origin travel back to its socket task here rather than
/// through the outbound queue, so a queue filled by fan-out never costs
/// the origin its answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Nothing to answer
    Ignore,
    /// Answer the origin and keep reading
    Reply(OutboundFrame),
    /// Answer the origin, then close its connection
    Close(OutboundFrame),
}

impl Dispatch {
    pub fn reply(&self) -> Option<&OutboundFrame> {
        match self {
            Dispatch::Ignore => None,
            Dispatch::Reply(frame) | Dispatch::Close(frame) => Some(frame),
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Dispatch::Close(_))
    }
}

pub struct Router {
    service: Arc<ListService>,
    registry: Arc<ConnectionRegistry>,
    reporter: SharedReporter,
    fatal_errors: AtomicU64,
}

impl Router {
    pub fn new(
        service: Arc<ListService>,
        registry: Arc<ConnectionRegistry>,
        reporter: SharedReporter,
    ) -> Self {
        Self {
            service,
            registry,
            reporter,
            fatal_errors: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &Arc<ListService> {
        &self.service
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn fatal_errors(&self) -> u64 {
        self.fatal_errors.load(Ordering::Relaxed)
    }

    /// Handle one raw text frame from `conn`.
    pub async fn dispatch(&self, conn: ConnectionId, raw: &str) -> Dispatch {
        let frame = match InboundFrame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Undecodable frame from {conn}: {e}");
                return Dispatch::Reply(OutboundFrame::error(
                    Uuid::new_v4().to_string(),
                    SyncError::InvalidRequest(e.to_string()).to_string(),
                    ErrorCode::Unknown,
                ));
            }
        };

        let Some(kind) = RequestKind::parse(&frame.kind) else {
            log::warn!("Ignoring frame {} of unknown type '{}' from {conn}", frame.id, frame.kind);
            return Dispatch::Ignore;
        };
        self.reporter
            .breadcrumb("ws", &format!("{} {} from {conn}", kind.as_str(), frame.id));

        match self.handle(conn, kind, &frame).await {
            Ok(data) => Dispatch::Reply(OutboundFrame::response(frame.id, data)),
            Err(err) => self.fail(conn, &frame, err).await,
        }
    }

    async fn handle(
        &self,
        conn: ConnectionId,
        kind: RequestKind,
        frame: &InboundFrame,
    ) -> Result<serde_json::Value, SyncError> {
        match kind {
            RequestKind::CreateList => to_value(self.service.create_list(conn).await?),
            RequestKind::GetList => {
                let req: GetListRequest = frame.payload()?;
                to_value(self.service.get_list(conn, req.uuid).await?)
            }
            RequestKind::SaveItem => {
                let req: SaveItemRequest = frame.payload()?;
                to_value(self.service.save_item(req.uuid, req.item, req.index).await?)
            }
            RequestKind::DeleteItem => {
                let req: DeleteItemRequest = frame.payload()?;
                to_value(self.service.delete_item(req.uuid, req.item.id).await?)
            }
        }
    }

    async fn fail(&self, conn: ConnectionId, frame: &InboundFrame, err: SyncError) -> Dispatch {
        let reply = OutboundFrame::error(frame.id.clone(), err.client_message(), err.code());

        if err.is_fatal() {
            self.fatal_errors.fetch_add(1, Ordering::Relaxed);
            log::error!("{} {} from {conn} failed: {err}; closing", frame.kind, frame.id);
            self.reporter.capture(&err);
            // No further fan-out reaches this connection.
            self.registry.disconnect(&conn).await;
            return Dispatch::Close(reply);
        }

        if let SyncError::Corrupted(corruption) = &err {
            log::error!("List data corrupted: {corruption}");
            self.reporter.capture(corruption);
        } else {
            log::debug!("{} {} from {conn} rejected: {err}", frame.kind, frame.id);
        }
        Dispatch::Reply(reply)
    }
}

fn to_value<T: Serialize>(value: T) -> Result<serde_json::Value, SyncError> {
    serde_json::to_value(value).map_err(|e| SyncError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheService;
    use crate::connection::Outbound;
    use crate::error::GENERIC_ERROR_MESSAGE;
    use crate::model::{ItemId, ItemWrite, List, ListId};
    use crate::report::RecordingReporter;
    use crate::storage::{MemoryStorage, Storage, StorageError};
    use crate::subscription::SubscriptionTracker;
    use async_trait::async_trait;
    use serde_json::json;

    /// Storage whose reads work and whose writes fail.
    struct ReadOnlyStorage(MemoryStorage);

    #[async_trait]
    impl Storage for ReadOnlyStorage {
        async fn create_list(&self) -> Result<List, StorageError> {
            self.0.create_list().await
        }
        async fn find_list(&self, id: &Uuid, items: bool) -> Result<Option<List>, StorageError> {
            self.0.find_list(id, items).await
        }
        async fn save_item(&self, _: ListId, _: ItemWrite) -> Result<crate::model::Item, StorageError> {
            Err(StorageError::Database("read-only".into()))
        }
        async fn delete_items(&self, _: &[ItemId]) -> Result<(), StorageError> {
            Err(StorageError::Database("read-only".into()))
        }
    }

    fn router_with(storage: Arc<dyn Storage>) -> (Router, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::new());
        let registry = Arc::new(ConnectionRegistry::new(64));
        let tracker = Arc::new(SubscriptionTracker::new(registry.clone()));
        let cache = Arc::new(CacheService::in_memory(reporter.clone()));
        let service = Arc::new(ListService::new(storage, cache, tracker, reporter.clone()));
        (Router::new(service, registry, reporter.clone()), reporter)
    }

    fn router() -> (Router, Arc<RecordingReporter>) {
        router_with(Arc::new(MemoryStorage::new()))
    }

    fn reply(outcome: Dispatch) -> OutboundFrame {
        match outcome {
            Dispatch::Reply(frame) => frame,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    fn request(id: &str, kind: &str, data: serde_json::Value) -> String {
        json!({ "id": id, "type": kind, "data": data }).to_string()
    }

    #[tokio::test]
    async fn test_create_then_get_echoes_ids() {
        let (router, _) = router();
        let (conn, _rx) = router.registry().register().await;

        let created = reply(router.dispatch(conn, &request("c1", "createList", json!({}))).await);
        assert_eq!(created.id, "c1");
        assert_eq!(created.kind, "response");
        let uuid = created.data.unwrap()["id"].clone();

        let list = reply(
            router
                .dispatch(conn, &request("g1", "getList", json!({ "uuid": uuid })))
                .await,
        );
        assert_eq!(list.id, "g1");
        assert_eq!(list.data.unwrap()["items"], json!([]));
    }

    #[tokio::test]
    async fn test_reply_survives_full_outbound_queue() {
        let reporter = Arc::new(RecordingReporter::new());
        let registry = Arc::new(ConnectionRegistry::new(1));
        let tracker = Arc::new(SubscriptionTracker::new(registry.clone()));
        let cache = Arc::new(CacheService::in_memory(reporter.clone()));
        let service = Arc::new(ListService::new(
            Arc::new(MemoryStorage::new()),
            cache,
            tracker,
            reporter.clone(),
        ));
        let router = Router::new(service, registry, reporter);
        let (conn, mut rx) = router.registry().register().await;

        let created = reply(router.dispatch(conn, &request("c1", "createList", json!({}))).await);
        let uuid = created.data.unwrap()["id"].clone();

        // The save broadcast fills the queue; the second one is dropped.
        for id in ["s1", "s2"] {
            let ack = reply(
                router
                    .dispatch(
                        conn,
                        &request(id, "saveItem", json!({ "uuid": uuid, "item": { "name": id } })),
                    )
                    .await,
            );
            assert_eq!(ack.id, id);
            assert_eq!(ack.data.unwrap()["status"], json!("ok"));
        }

        let stats = router.registry().stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Text(_))));
    }

    #[tokio::test]
    async fn test_not_found_keeps_connection_open() {
        let (router, _) = router();
        let (conn, _rx) = router.registry().register().await;

        let reply = reply(
            router
                .dispatch(conn, &request("g1", "getList", json!({ "uuid": Uuid::new_v4() })))
                .await,
        );
        assert!(reply.is_error());
        assert_eq!(reply.id, "g1");
        let error = reply.error.unwrap();
        assert_eq!(error.code, ErrorCode::NotFound);
        assert_eq!(error.message, "No such list");
        assert!(router.registry().is_connected(&conn).await);
    }

    #[tokio::test]
    async fn test_undecodable_frame_gets_fresh_id_error() {
        let (router, _) = router();
        let (conn, _rx) = router.registry().register().await;

        let reply = reply(router.dispatch(conn, "not json").await);
        assert!(reply.is_error());
        assert!(Uuid::parse_str(&reply.id).is_ok());
        assert_eq!(reply.error.unwrap().code, ErrorCode::Unknown);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_invalid_request() {
        let (router, _) = router();
        let (conn, _rx) = router.registry().register().await;

        let reply = reply(
            router
                .dispatch(conn, &request("s1", "saveItem", json!({ "uuid": "nope" })))
                .await,
        );
        assert_eq!(reply.id, "s1");
        assert_eq!(reply.error.unwrap().code, ErrorCode::Unknown);
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let (router, _) = router();
        let (conn, mut rx) = router.registry().register().await;

        let outcome = router.dispatch(conn, &request("x", "renameList", json!({}))).await;
        assert_eq!(outcome, Dispatch::Ignore);
        assert!(outcome.reply().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_storage_failure_is_fatal() {
        let (router, reporter) = router_with(Arc::new(ReadOnlyStorage(MemoryStorage::new())));
        let (conn, mut rx) = router.registry().register().await;

        let created = reply(router.dispatch(conn, &request("c1", "createList", json!({}))).await);
        let uuid = created.data.unwrap()["id"].clone();

        let outcome = router
            .dispatch(
                conn,
                &request("s1", "saveItem", json!({ "uuid": uuid, "item": { "name": "x" } })),
            )
            .await;
        assert!(outcome.is_close());

        let reply = outcome.reply().cloned().unwrap();
        assert_eq!(reply.id, "s1");
        let error = reply.error.unwrap();
        assert_eq!(error.message, GENERIC_ERROR_MESSAGE);
        assert_eq!(error.code, ErrorCode::Internal);
        assert_eq!(rx.try_recv().ok(), Some(Outbound::Close));

        assert!(!router.registry().is_connected(&conn).await);
        assert_eq!(router.fatal_errors(), 1);
        assert_eq!(reporter.errors().len(), 1);
    }
}
