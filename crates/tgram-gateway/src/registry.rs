//! In-flight request registry.
//!
//! Each configured service owns one registry. An entry tracks one accepted
//! client connection from the moment it is admitted until a response is
//! delivered, its TTL expires, or its connection handler gives up. The
//! connection handler holds the receiving half of a one-shot channel; the
//! registry holds the sending half and is the only place that signals it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tgram_core::{TgramError, TgramResult};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Identifier of a request within one service's registry.
pub type RequestId = u32;

/// Smallest id handed out; ids wrap back here after `RequestId::MAX`.
pub const MIN_REQUEST_ID: RequestId = 1;

/// What a waiting connection handler eventually receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Response bytes to write to the client.
    Response(Vec<u8>),
    /// No response will arrive.
    Cancelled(CancelReason),
}

/// Why a request was retired without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Older than the service's request TTL.
    TimedOut,
    /// The connection handler marked its delivery channel closed.
    Closed,
    /// A newer request took over the same client connection handle.
    Superseded,
    /// The gateway is shutting down.
    Shutdown,
}

/// Client connection handle recorded for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    /// The client peer address this request is serving.
    Connected(SocketAddr),
    /// Handle cleared because a newer request uses the same peer address.
    Cleared,
}

/// Sending side of a request's delivery channel.
#[derive(Debug)]
enum DeliveryChannel {
    Open(oneshot::Sender<Delivery>),
    Closed,
}

#[derive(Debug)]
struct RequestEntry {
    created_at: Instant,
    connection: Connection,
    channel: DeliveryChannel,
}

impl RequestEntry {
    /// Signal the waiting handler, at most once.
    fn signal(self, delivery: Delivery) -> bool {
        match self.channel {
            DeliveryChannel::Open(tx) => tx.send(delivery).is_ok(),
            DeliveryChannel::Closed => false,
        }
    }
}

/// A freshly admitted request, handed to its connection handler.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: RequestId,
    pub delivery: oneshot::Receiver<Delivery>,
}

/// Snapshot of a registered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub id: RequestId,
    pub age: Duration,
    pub connection: Connection,
    pub closed: bool,
}

#[derive(Debug)]
struct RegistryInner {
    next_id: RequestId,
    requests: HashMap<RequestId, RequestEntry>,
}

/// Registry of in-flight requests for one service.
#[derive(Debug)]
pub struct RequestRegistry {
    inner: Mutex<RegistryInner>,
    /// Most requests that may be live at once.
    limit: usize,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    /// Create an empty registry bounded only by the id space.
    pub fn new() -> Self {
        Self::with_limit(RequestId::MAX as usize)
    }

    /// Create an empty registry holding at most `limit` live requests.
    pub fn with_limit(limit: usize) -> Self {
        Self::build(MIN_REQUEST_ID, limit)
    }

    /// Create an empty registry whose first id is `first_id`.
    pub fn starting_at(first_id: RequestId) -> Self {
        Self::build(first_id, RequestId::MAX as usize)
    }

    fn build(first_id: RequestId, limit: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_id: first_id.max(MIN_REQUEST_ID),
                requests: HashMap::new(),
            }),
            limit,
        }
    }

    /// Register a new request for the client at `peer`.
    ///
    /// Ids increase monotonically, wrapping to [`MIN_REQUEST_ID`] after
    /// `RequestId::MAX`. An id still held by a live request is skipped.
    /// Fails while the registry is at its limit.
    pub async fn create(&self, peer: SocketAddr) -> TgramResult<PendingRequest> {
        let mut inner = self.inner.lock().await;
        if inner.requests.len() >= self.limit {
            return Err(TgramError::Other(format!(
                "request registry full ({} live)",
                self.limit
            )));
        }

        let mut id = inner.next_id;
        let mut skipped: u64 = 0;
        while inner.requests.contains_key(&id) {
            id = next_after(id);
            skipped += 1;
            if skipped > u64::from(RequestId::MAX) {
                return Err(TgramError::Other("request id space exhausted".into()));
            }
        }
        inner.next_id = next_after(id);

        let (tx, rx) = oneshot::channel();
        inner.requests.insert(
            id,
            RequestEntry {
                created_at: Instant::now(),
                connection: Connection::Connected(peer),
                channel: DeliveryChannel::Open(tx),
            },
        );
        debug!(request_id = id, peer = %peer, count = inner.requests.len(), "request created");

        Ok(PendingRequest { id, delivery: rx })
    }

    /// Look up a request by id.
    pub async fn find(&self, id: RequestId) -> Option<RequestInfo> {
        let inner = self.inner.lock().await;
        inner.requests.get(&id).map(|entry| RequestInfo {
            id,
            age: entry.created_at.elapsed(),
            connection: entry.connection,
            closed: matches!(entry.channel, DeliveryChannel::Closed),
        })
    }

    /// Retire a request and hand its response to the waiting handler.
    ///
    /// Returns `false` if no such request exists or its handler is gone.
    pub async fn deliver(&self, id: RequestId, response: Vec<u8>) -> bool {
        let entry = self.inner.lock().await.requests.remove(&id);
        match entry {
            Some(entry) => entry.signal(Delivery::Response(response)),
            None => false,
        }
    }

    /// Retire a request without signalling it. Returns whether it existed.
    pub async fn remove(&self, id: RequestId) -> bool {
        self.inner.lock().await.requests.remove(&id).is_some()
    }

    /// Mark a request's delivery channel closed; the next sweep retires it.
    pub async fn mark_closed(&self, id: RequestId) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.requests.get_mut(&id) {
            entry.channel = DeliveryChannel::Closed;
        }
    }

    /// Clear the connection handle of every request recorded for `peer`.
    ///
    /// Called before registering a freshly accepted connection so a stale
    /// entry can never be mistaken for the active one. Returns how many
    /// handles were cleared.
    pub async fn clear_connection(&self, peer: SocketAddr) -> usize {
        let mut inner = self.inner.lock().await;
        let mut cleared = 0;
        for entry in inner.requests.values_mut() {
            if entry.connection == Connection::Connected(peer) {
                entry.connection = Connection::Cleared;
                cleared += 1;
            }
        }
        if cleared > 0 {
            warn!(peer = %peer, count = cleared, "cleared stale requests for reused connection");
        }
        cleared
    }

    /// Number of registered requests.
    pub async fn count(&self) -> usize {
        self.inner.lock().await.requests.len()
    }

    /// Retire requests older than `ttl`, closed by their handler, or whose
    /// connection handle was cleared. Each retired request's handler is
    /// signalled exactly once.
    ///
    /// Returns the retired ids with the reason for each.
    pub async fn sweep(&self, ttl: Duration) -> Vec<(RequestId, CancelReason)> {
        self.sweep_at(Instant::now(), ttl).await
    }

    async fn sweep_at(&self, now: Instant, ttl: Duration) -> Vec<(RequestId, CancelReason)> {
        let mut inner = self.inner.lock().await;

        let doomed: Vec<(RequestId, CancelReason)> = inner
            .requests
            .iter()
            .filter_map(|(id, entry)| {
                let reason = if now.saturating_duration_since(entry.created_at) > ttl {
                    CancelReason::TimedOut
                } else if matches!(entry.channel, DeliveryChannel::Closed) {
                    CancelReason::Closed
                } else if entry.connection == Connection::Cleared {
                    CancelReason::Superseded
                } else {
                    return None;
                };
                Some((*id, reason))
            })
            .collect();

        for (id, reason) in &doomed {
            if let Some(entry) = inner.requests.remove(id) {
                entry.signal(Delivery::Cancelled(*reason));
            }
        }

        if !doomed.is_empty() {
            debug!(count = doomed.len(), remaining = inner.requests.len(), "GC removed requests");
        }
        doomed
    }

    /// Retire every request, signalling each with `reason`.
    pub async fn cancel_all(&self, reason: CancelReason) -> usize {
        let mut inner = self.inner.lock().await;
        let count = inner.requests.len();
        for (_, entry) in inner.requests.drain() {
            entry.signal(Delivery::Cancelled(reason));
        }
        count
    }
}

fn next_after(id: RequestId) -> RequestId {
    if id == RequestId::MAX {
        MIN_REQUEST_ID
    } else {
        id + 1
    }
}
