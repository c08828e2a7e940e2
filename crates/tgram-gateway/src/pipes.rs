//! Pipes and the service bindings agents announce through them.
//!
//! A pipe is created for every registration request and lives for the
//! gateway's lifetime. Its datagram peer is refreshed from each valid
//! envelope that names it, so an agent that rebinds keeps its pipe.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One service an agent announced on a pipe.
#[derive(Debug, Clone)]
pub struct ServiceDef {
    pub service_id: String,
    pub name: String,
    pub announced_at: Instant,
}

/// A datagram association with one agent.
#[derive(Debug)]
pub struct Pipe {
    pub id: String,
    peer: RwLock<SocketAddr>,
    service_defs: RwLock<HashMap<String, ServiceDef>>,
}

impl Pipe {
    fn new(id: String, peer: SocketAddr) -> Self {
        Self {
            id,
            peer: RwLock::new(peer),
            service_defs: RwLock::new(HashMap::new()),
        }
    }

    /// Current datagram address of the agent.
    pub async fn peer(&self) -> SocketAddr {
        *self.peer.read().await
    }

    /// Point the pipe at `peer`.
    pub async fn set_peer(&self, peer: SocketAddr) {
        let mut current = self.peer.write().await;
        let old = *current;
        if old != peer {
            info!(pipe_id = %self.id, old = %old, new = %peer, "pipe peer moved");
            *current = peer;
        }
    }

    /// Record (or re-announce) a service binding. Returns whether it is new.
    pub async fn register_service(&self, service_id: &str, name: &str) -> bool {
        let def = ServiceDef {
            service_id: service_id.to_string(),
            name: name.to_string(),
            announced_at: Instant::now(),
        };
        let previous = self
            .service_defs
            .write()
            .await
            .insert(service_id.to_string(), def);
        debug!(pipe_id = %self.id, service = %service_id, name, "service announced");
        previous.is_none()
    }

    pub async fn service_def(&self, service_id: &str) -> Option<ServiceDef> {
        self.service_defs.read().await.get(service_id).cloned()
    }

    pub async fn has_service(&self, service_id: &str) -> bool {
        self.service_defs.read().await.contains_key(service_id)
    }

    pub async fn service_count(&self) -> usize {
        self.service_defs.read().await.len()
    }
}

/// All pipes known to the gateway, keyed by pipe id.
#[derive(Debug, Default)]
pub struct PipeTable {
    pipes: RwLock<HashMap<String, Arc<Pipe>>>,
}

impl PipeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh pipe id for the agent at `peer`.
    pub async fn create(&self, peer: SocketAddr) -> Arc<Pipe> {
        let id = uuid::Uuid::new_v4().to_string();
        let pipe = Arc::new(Pipe::new(id.clone(), peer));
        let mut pipes = self.pipes.write().await;
        pipes.insert(id.clone(), pipe.clone());
        info!(pipe_id = %id, peer = %peer, total = pipes.len(), "pipe created");
        pipe
    }

    pub async fn get(&self, pipe_id: &str) -> Option<Arc<Pipe>> {
        self.pipes.read().await.get(pipe_id).cloned()
    }

    /// The pipe whose binding for `service_id` was announced most recently.
    pub async fn route(&self, service_id: &str) -> Option<Arc<Pipe>> {
        let candidates: Vec<Arc<Pipe>> = self.pipes.read().await.values().cloned().collect();

        let mut best: Option<(Instant, Arc<Pipe>)> = None;
        for pipe in candidates {
            let Some(def) = pipe.service_def(service_id).await else {
                continue;
            };
            if best
                .as_ref()
                .map_or(true, |(announced_at, _)| def.announced_at >= *announced_at)
            {
                best = Some((def.announced_at, pipe));
            }
        }
        best.map(|(_, pipe)| pipe)
    }

    pub async fn count(&self) -> usize {
        self.pipes.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn create_assigns_unique_ids() {
        let table = PipeTable::new();
        let a = table.create(peer(1)).await;
        let b = table.create(peer(1)).await;
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 36);
        assert_eq!(table.count().await, 2);
        assert!(table.get(&a.id).await.is_some());
        assert!(table.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn route_requires_a_binding() {
        let table = PipeTable::new();
        let pipe = table.create(peer(1)).await;
        assert!(table.route("svc").await.is_none());

        assert!(pipe.register_service("svc", "web").await);
        assert!(!pipe.register_service("svc", "web").await);
        assert_eq!(pipe.service_count().await, 1);
        assert_eq!(table.route("svc").await.unwrap().id, pipe.id);
        assert!(table.route("other").await.is_none());
    }

    #[tokio::test]
    async fn route_prefers_latest_announcement() {
        let table = PipeTable::new();
        let first = table.create(peer(1)).await;
        let second = table.create(peer(2)).await;

        first.register_service("svc", "web").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        second.register_service("svc", "web").await;
        assert_eq!(table.route("svc").await.unwrap().id, second.id);

        tokio::time::sleep(Duration::from_millis(5)).await;
        first.register_service("svc", "web").await;
        assert_eq!(table.route("svc").await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn peer_is_refreshed() {
        let table = PipeTable::new();
        let pipe = table.create(peer(1)).await;
        pipe.set_peer(peer(2)).await;
        assert_eq!(pipe.peer().await, peer(2));
    }
}
