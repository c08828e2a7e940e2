//! Periodic expiry of requests and partial messages.
//!
//! The watchdog is the only place a request is retired for age. Connection
//! handlers never time themselves out; they wait until the registry
//! signals them.

use crate::gateway::GatewayState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// How often registries and the reassembly table are swept.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(50);

/// Sweep every service registry and the reassembly table until shutdown.
pub(crate) async fn run(state: Arc<GatewayState>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => break,
        }
        sweep_once(&state).await;
    }
    debug!("watchdog stopped");
}

/// One watchdog pass. Returns how many requests were retired.
pub(crate) async fn sweep_once(state: &GatewayState) -> usize {
    let mut retired = 0;
    for service in state.services.iter() {
        let removed = service.requests.sweep(service.request_ttl).await;
        for (request_id, reason) in &removed {
            info!(service = %service.id, request_id, ?reason, "request retired by watchdog");
        }
        retired += removed.len();
    }

    let expired = state.endpoint.sweep();
    if expired > 0 {
        debug!(count = expired, "expired partial messages discarded");
    }
    retired
}
