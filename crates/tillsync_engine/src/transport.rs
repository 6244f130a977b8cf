//! Transport layer abstraction for batch exchange.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tillsync_protocol::{AckOutcome, BatchAck, BatchEnvelope, RecordAck, StoreId};

/// Moves batches between a store node and HQ.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (in-process loopback, HTTP, mock for testing).
///
/// Errors must say whether retrying can help: a retryable
/// [`SyncError::Transport`] or [`SyncError::Timeout`] puts the batch's queue
/// items back for retry, anything else dead-letters them.
pub trait BatchTransport: Send + Sync {
    /// Sends an upload batch and waits for the peer's ack.
    fn send(&self, batch: &BatchEnvelope) -> SyncResult<BatchAck>;

    /// Fetches the next download batch for `store`, if any.
    fn receive(&self, store: StoreId) -> SyncResult<Option<BatchEnvelope>>;

    /// Returns the ack for a batch obtained through [`receive`](Self::receive).
    fn acknowledge(&self, ack: &BatchAck) -> SyncResult<()>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Scripted reply of [`MockTransport::send`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Ack every record as applied.
    AckAll,
    /// Return this ack.
    Ack(BatchAck),
    /// Fail with a transport error.
    Fail {
        /// Error message.
        message: String,
        /// Whether the error is retryable.
        retryable: bool,
    },
    /// Time out.
    Timeout,
}

/// A mock transport for testing.
///
/// Sends are answered from a script, falling back to [`MockReply::AckAll`]
/// once the script runs out.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    replies: Mutex<VecDeque<MockReply>>,
    inbound: Mutex<VecDeque<BatchEnvelope>>,
    sent: Mutex<Vec<BatchEnvelope>>,
    acks: Mutex<Vec<BatchAck>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            replies: Mutex::new(VecDeque::new()),
            inbound: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
        }
    }

    /// Queues the reply for a future send.
    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// Queues a download batch.
    pub fn push_inbound(&self, batch: BatchEnvelope) {
        self.inbound.lock().push_back(batch);
    }

    /// Returns every batch sent so far.
    pub fn sent(&self) -> Vec<BatchEnvelope> {
        self.sent.lock().clone()
    }

    /// Returns every ack received so far.
    pub fn acknowledged(&self) -> Vec<BatchAck> {
        self.acks.lock().clone()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("not connected"))
        }
    }
}

/// Builds an ack marking every record of `batch` as applied.
pub fn ack_all(batch: &BatchEnvelope) -> BatchAck {
    let mut ack = BatchAck::new(batch.batch_id, batch.store_id);
    ack.outcomes = batch
        .records
        .iter()
        .map(|r| RecordAck {
            record_id: r.record_id,
            entity_id: r.entity.entity_id.clone(),
            outcome: AckOutcome::Applied,
        })
        .collect();
    ack
}

impl BatchTransport for MockTransport {
    fn send(&self, batch: &BatchEnvelope) -> SyncResult<BatchAck> {
        self.ensure_connected()?;
        self.sent.lock().push(batch.clone());
        let reply = self.replies.lock().pop_front().unwrap_or(MockReply::AckAll);
        match reply {
            MockReply::AckAll => Ok(ack_all(batch)),
            MockReply::Ack(ack) => Ok(ack),
            MockReply::Fail { message, retryable } => {
                Err(SyncError::Transport { message, retryable })
            }
            MockReply::Timeout => Err(SyncError::Timeout),
        }
    }

    fn receive(&self, store: StoreId) -> SyncResult<Option<BatchEnvelope>> {
        self.ensure_connected()?;
        let mut inbound = self.inbound.lock();
        let position = inbound.iter().position(|b| b.store_id == store);
        Ok(position.and_then(|i| inbound.remove(i)))
    }

    fn acknowledge(&self, ack: &BatchAck) -> SyncResult<()> {
        self.ensure_connected()?;
        self.acks.lock().push(ack.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_protocol::{
        BatchDirection, BatchId, ChangeOperation, EntityEnvelope, RecordId, Timestamp,
    };

    fn batch(store: u32) -> BatchEnvelope {
        let mut batch =
            BatchEnvelope::new(BatchId(1), StoreId(store), BatchDirection::Upload, "Product");
        batch.push(
            RecordId(10),
            EntityEnvelope::new(
                "Product",
                "42",
                ChangeOperation::Create,
                Timestamp::from_millis(1),
                Some(b"P".to_vec()),
            ),
        );
        batch
    }

    #[test]
    fn mock_transport_not_connected_error() {
        let transport = MockTransport::new();
        transport.set_connected(false);

        let err = transport.send(&batch(1)).unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn mock_transport_scripted_replies() {
        let transport = MockTransport::new();
        transport.push_reply(MockReply::Fail {
            message: "rejected".into(),
            retryable: false,
        });

        assert!(transport.send(&batch(1)).unwrap_err().is_permanent());
        let ack = transport.send(&batch(1)).unwrap();
        assert_eq!(ack.outcome_for(RecordId(10)), Some(&AckOutcome::Applied));
        assert_eq!(transport.sent().len(), 2);
    }

    #[test]
    fn mock_transport_receive_by_store() {
        let transport = MockTransport::new();
        transport.push_inbound(batch(1));
        transport.push_inbound(batch(2));

        let got = transport.receive(StoreId(2)).unwrap().unwrap();
        assert_eq!(got.store_id, StoreId(2));
        assert!(transport.receive(StoreId(2)).unwrap().is_none());
        assert!(transport.receive(StoreId(1)).unwrap().is_some());
    }
}
