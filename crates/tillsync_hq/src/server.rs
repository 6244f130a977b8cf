//! The HQ server facade.

use crate::config::HqConfig;
use crate::error::HqResult;
use crate::handler::{HandlerContext, RequestHandler, StoreSession};
use std::sync::Arc;
use tillsync_engine::{AckSummary, ApplyReport, LocalRepository, SyncNode};
use tillsync_protocol::{BatchAck, BatchEnvelope, StoreId};

/// A request from a store.
#[derive(Debug, Clone)]
pub enum HqRequest {
    /// Apply an upload batch.
    Upload(BatchEnvelope),
    /// Hand out the next download batch.
    Pull(StoreId),
    /// Settle a download batch.
    Ack(BatchAck),
}

/// HQ's answer to an [`HqRequest`].
#[derive(Debug, Clone)]
pub enum HqResponse {
    /// Per-record outcomes of an upload.
    Ack(BatchAck),
    /// The next download batch, if any.
    Download(Option<BatchEnvelope>),
    /// What a download ack settled.
    Settled(AckSummary),
}

/// The HQ side of store synchronization.
///
/// Wraps an HQ [`SyncNode`] and answers store requests. It is transport
/// agnostic; a network front end would call [`handle_message`] per request.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tillsync_engine::{MemoryRepository, NodeKind, SyncConfiguration, SyncNode, SystemClock};
/// use tillsync_hq::{HqConfig, HqServer};
/// use tillsync_protocol::{StoreId, SyncEntityRule};
///
/// let node = SyncNode::in_memory(
///     NodeKind::Hq,
///     Arc::new(MemoryRepository::new()),
///     Arc::new(SystemClock),
/// )
/// .unwrap();
/// node.configure(SyncConfiguration::new(StoreId(1)).with_rule(SyncEntityRule::new("Product")))
///     .unwrap();
/// let server = HqServer::new(HqConfig::default(), Arc::new(node));
/// assert!(server.handle_pull(StoreId(1)).unwrap().is_none());
/// ```
///
/// [`handle_message`]: HqServer::handle_message
pub struct HqServer<R: LocalRepository> {
    handler: RequestHandler<R>,
    context: Arc<HandlerContext<R>>,
}

impl<R: LocalRepository> HqServer<R> {
    /// Creates a server over an HQ node.
    pub fn new(config: HqConfig, node: Arc<SyncNode<R>>) -> Self {
        let context = Arc::new(HandlerContext::new(config, node));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self { handler, context }
    }

    /// Returns the HQ node.
    pub fn node(&self) -> &Arc<SyncNode<R>> {
        &self.context.node
    }

    /// Returns what HQ has seen of a store.
    pub fn session(&self, store_id: StoreId) -> Option<StoreSession> {
        self.context.session(store_id)
    }

    /// Applies an upload batch.
    pub fn handle_upload(&self, batch: &BatchEnvelope) -> HqResult<ApplyReport> {
        self.handler.handle_upload(batch)
    }

    /// Hands out the next download batch for a store.
    pub fn handle_pull(&self, store_id: StoreId) -> HqResult<Option<BatchEnvelope>> {
        self.handler.handle_pull(store_id)
    }

    /// Settles a download batch.
    pub fn handle_ack(&self, ack: &BatchAck) -> HqResult<AckSummary> {
        self.handler.handle_ack(ack)
    }

    /// Handles a request (dispatches to the matching handler).
    pub fn handle_message(&self, request: HqRequest) -> HqResult<HqResponse> {
        match request {
            HqRequest::Upload(batch) => self
                .handle_upload(&batch)
                .map(|report| HqResponse::Ack(report.ack)),
            HqRequest::Pull(store_id) => self.handle_pull(store_id).map(HqResponse::Download),
            HqRequest::Ack(ack) => self.handle_ack(&ack).map(HqResponse::Settled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HqError;
    use tillsync_engine::{
        BatchStatus, Change, ManualClock, MemoryRepository, NodeKind, QueueStatus,
        SyncConfiguration,
    };
    use tillsync_protocol::{
        BatchDirection, BatchId, ChangeOperation, EntityEnvelope, RecordId, SyncEntityRule,
        Timestamp,
    };

    const STORE: StoreId = StoreId(1);

    fn server(config: HqConfig) -> (HqServer<MemoryRepository>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let node = SyncNode::in_memory(
            NodeKind::Hq,
            Arc::new(MemoryRepository::new()),
            clock.clone(),
        )
        .unwrap();
        node.configure(SyncConfiguration::new(STORE).with_rule(SyncEntityRule::new("Product")))
            .unwrap();
        (HqServer::new(config, Arc::new(node)), clock)
    }

    fn upload(store: StoreId, batch: u64, ids: &[&str]) -> BatchEnvelope {
        let mut envelope =
            BatchEnvelope::new(BatchId(batch), store, BatchDirection::Upload, "Product");
        for (i, id) in ids.iter().enumerate() {
            envelope.push(
                RecordId(i as u64 + 1),
                EntityEnvelope::new(
                    "Product",
                    *id,
                    ChangeOperation::Create,
                    Timestamp::from_millis(10),
                    Some(id.as_bytes().to_vec()),
                ),
            );
        }
        envelope
    }

    #[test]
    fn upload_is_applied_and_counted() {
        let (server, _) = server(HqConfig::default());
        let report = server.handle_upload(&upload(STORE, 1, &["a", "b"])).unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.ack.outcomes.len(), 2);

        let again = server.handle_upload(&upload(STORE, 1, &["a", "b"])).unwrap();
        assert!(again.replayed);

        let session = server.session(STORE).unwrap();
        assert_eq!(session.uploads, 1);
        assert_eq!(session.last_seen, Some(Timestamp::from_millis(1_000)));
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let (server, _) = server(HqConfig::new().with_max_upload_records(1));
        let err = server.handle_upload(&upload(STORE, 1, &["a", "b"])).unwrap_err();
        assert!(matches!(err, HqError::InvalidRequest(_)));
        assert!(server.node().repository().is_empty());
    }

    #[test]
    fn unknown_and_disabled_stores() {
        let (server, _) = server(HqConfig::default());
        assert!(matches!(
            server.handle_upload(&upload(StoreId(7), 1, &["a"])),
            Err(HqError::UnknownStore(StoreId(7)))
        ));

        server
            .node()
            .configure(
                SyncConfiguration::new(STORE)
                    .with_enabled(false)
                    .with_rule(SyncEntityRule::new("Product")),
            )
            .unwrap();
        let err = server.handle_pull(STORE).unwrap_err();
        assert!(matches!(err, HqError::StoreDisabled(STORE)));
        assert!(err.is_retryable());
    }

    #[test]
    fn pull_then_ack_completes_download() {
        let (server, _) = server(HqConfig::default());
        let item = server
            .node()
            .enqueue_for(
                STORE,
                Change::update("Product", "9", b"new".to_vec(), Timestamp::from_millis(5)),
            )
            .unwrap();

        let batch = server.handle_pull(STORE).unwrap().unwrap();
        assert_eq!(batch.direction, BatchDirection::Download);
        assert!(server.handle_pull(STORE).unwrap().is_none());

        let response = server
            .handle_message(HqRequest::Ack(tillsync_engine::ack_all(&batch)))
            .unwrap();
        let HqResponse::Settled(summary) = response else {
            panic!("expected a settled response");
        };
        assert_eq!(summary.completed, 1);
        assert_eq!(server.session(STORE).unwrap().downloads, 1);
        assert_eq!(
            server.node().store().read().queue[&item].status,
            QueueStatus::Completed
        );
    }

    #[test]
    fn ack_needs_an_admitted_owning_store() {
        let (server, _) = server(HqConfig::default());
        server
            .node()
            .configure(SyncConfiguration::new(StoreId(2)).with_rule(SyncEntityRule::new("Product")))
            .unwrap();
        let item = server
            .node()
            .enqueue_for(
                STORE,
                Change::update("Product", "9", b"new".to_vec(), Timestamp::from_millis(5)),
            )
            .unwrap();
        let batch = server.handle_pull(STORE).unwrap().unwrap();
        let ack = tillsync_engine::ack_all(&batch);

        let mut stranger = ack.clone();
        stranger.store_id = StoreId(7);
        assert!(matches!(
            server.handle_ack(&stranger),
            Err(HqError::UnknownStore(StoreId(7)))
        ));
        let mut other = ack.clone();
        other.store_id = StoreId(2);
        assert!(matches!(server.handle_ack(&other), Err(HqError::Sync(_))));
        assert_eq!(
            server.node().store().read().queue[&item].status,
            QueueStatus::InProgress
        );

        server
            .node()
            .configure(
                SyncConfiguration::new(STORE)
                    .with_enabled(false)
                    .with_rule(SyncEntityRule::new("Product")),
            )
            .unwrap();
        assert!(matches!(
            server.handle_ack(&ack),
            Err(HqError::StoreDisabled(STORE))
        ));
    }

    #[test]
    fn overdue_download_is_sent_again() {
        let (server, clock) = server(HqConfig::new().with_ack_timeout(std::time::Duration::from_secs(10)));
        server
            .node()
            .enqueue_for(
                STORE,
                Change::update("Product", "9", b"new".to_vec(), Timestamp::from_millis(5)),
            )
            .unwrap();
        let first = server.handle_pull(STORE).unwrap().unwrap();

        clock.advance(std::time::Duration::from_secs(11));
        assert!(server.handle_pull(STORE).unwrap().is_none());
        // Backoff has passed.
        clock.advance(std::time::Duration::from_secs(60));
        let second = server.handle_pull(STORE).unwrap().unwrap();
        assert_ne!(first.batch_id, second.batch_id);
        assert_eq!(first.records[0].entity, second.records[0].entity);
    }

    #[test]
    fn message_dispatch() {
        let (server, _) = server(HqConfig::default());
        let response = server
            .handle_message(HqRequest::Upload(upload(STORE, 3, &["x"])))
            .unwrap();
        assert!(matches!(response, HqResponse::Ack(ack) if ack.batch_id == BatchId(3)));

        let response = server.handle_message(HqRequest::Pull(STORE)).unwrap();
        assert!(matches!(response, HqResponse::Download(None)));
    }
}
