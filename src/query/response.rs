//! Collection side of an issued query.
//!
//! The engine keeps a [`PendingQuery`] per outstanding query and feeds it the
//! acks and responses that come back. The caller consumes them through the
//! [`QueryResponse`] handle until the deadline closes both streams.

use crate::clock::LamportTime;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One node's answer to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResponse {
    pub from: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuerySummary {
    pub acks: usize,
    pub responses: usize,
}

/// Outcome of feeding one inbound response into a pending query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    Duplicate,
    Finished,
    /// The consumer is not keeping up; the response was dropped.
    Dropped,
}

struct PendingInner {
    closed: bool,
    acks: HashSet<String>,
    responses: HashSet<String>,
    ack_tx: Option<mpsc::Sender<String>>,
    response_tx: Option<mpsc::Sender<NodeResponse>>,
}

/// Engine-side record of an outstanding query.
pub(crate) struct PendingQuery {
    pub ltime: LamportTime,
    pub deadline: Instant,
    inner: Mutex<PendingInner>,
}

impl PendingQuery {
    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Marks the query finished and ends both streams.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.ack_tx = None;
        inner.response_tx = None;
    }

    pub fn deliver_ack(&self, from: &str) -> Delivery {
        let mut inner = self.lock();
        if inner.closed || Instant::now() >= self.deadline {
            return Delivery::Finished;
        }
        if inner.acks.contains(from) {
            return Delivery::Duplicate;
        }

        let sent = match &inner.ack_tx {
            Some(tx) => tx.try_send(from.to_string()).is_ok(),
            None => false,
        };
        if !sent {
            return Delivery::Dropped;
        }
        inner.acks.insert(from.to_string());
        Delivery::Delivered
    }

    pub fn deliver_response(&self, resp: NodeResponse) -> Delivery {
        let mut inner = self.lock();
        if inner.closed || Instant::now() >= self.deadline {
            return Delivery::Finished;
        }
        if inner.responses.contains(&resp.from) {
            return Delivery::Duplicate;
        }

        // Only delivered responses count, so a dropped one can arrive again
        let from = resp.from.clone();
        let sent = match &inner.response_tx {
            Some(tx) => tx.try_send(resp).is_ok(),
            None => false,
        };
        if !sent {
            return Delivery::Dropped;
        }
        inner.responses.insert(from);
        Delivery::Delivered
    }

    fn summary(&self) -> QuerySummary {
        let inner = self.lock();
        QuerySummary {
            acks: inner.acks.len(),
            responses: inner.responses.len(),
        }
    }
}

/// Handle returned to the caller that issued a query.
///
/// Both streams end at the deadline. Responses arriving later are discarded
/// by the engine and never show up here.
pub struct QueryResponse {
    id: u32,
    ltime: LamportTime,
    deadline: Instant,
    pending: Arc<PendingQuery>,
    ack_rx: Option<mpsc::Receiver<String>>,
    response_rx: mpsc::Receiver<NodeResponse>,
}

impl QueryResponse {
    pub(crate) fn new(
        id: u32,
        ltime: LamportTime,
        deadline: Instant,
        request_ack: bool,
        capacity: usize,
    ) -> (Self, Arc<PendingQuery>) {
        let capacity = capacity.max(1);
        let (response_tx, response_rx) = mpsc::channel(capacity);
        let (ack_tx, ack_rx) = if request_ack {
            let (tx, rx) = mpsc::channel(capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let pending = Arc::new(PendingQuery {
            ltime,
            deadline,
            inner: Mutex::new(PendingInner {
                closed: false,
                acks: HashSet::new(),
                responses: HashSet::new(),
                ack_tx,
                response_tx: Some(response_tx),
            }),
        });

        let handle = Self {
            id,
            ltime,
            deadline,
            pending: pending.clone(),
            ack_rx,
            response_rx,
        };
        (handle, pending)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn ltime(&self) -> LamportTime {
        self.ltime
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn finished(&self) -> bool {
        self.pending.is_closed() || Instant::now() >= self.deadline
    }

    /// Stops collecting early. Later arrivals are dropped.
    pub fn close(&self) {
        self.pending.close();
    }

    /// Next response, or `None` once the deadline passed or the query was closed.
    pub async fn next_response(&mut self) -> Option<NodeResponse> {
        tokio::time::timeout_at(self.deadline, self.response_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next acknowledging node. Always `None` when no ack was requested.
    pub async fn next_ack(&mut self) -> Option<String> {
        let rx = self.ack_rx.as_mut()?;
        tokio::time::timeout_at(self.deadline, rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Drains every response until the deadline.
    pub async fn collect(&mut self) -> Vec<NodeResponse> {
        let mut responses = Vec::new();
        while let Some(resp) = self.next_response().await {
            responses.push(resp);
        }
        responses
    }

    /// Counts of distinct acks and responses received so far.
    pub fn summary(&self) -> QuerySummary {
        self.pending.summary()
    }
}
