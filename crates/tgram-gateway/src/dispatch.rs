//! Inbound datagram dispatch.
//!
//! Every reassembled message from an agent lands here. Registration
//! requests get a fresh pipe, announcements bind services to a pipe, and
//! service responses are handed to the waiting request. Anything malformed
//! or addressed to an unknown pipe is logged and dropped.

use crate::config::SERVICE_UUID_LEN;
use crate::gateway::GatewayState;
use crate::registry::RequestId;
use std::net::SocketAddr;
use tgram_core::{
    Envelope, Inbound, Payload, ServiceAck, ServiceAnnouncement, ServiceStatus, TgramResult,
    BAD_GATEWAY_RESPONSE,
};
use tracing::{debug, info, warn};

/// Handle one reassembled message.
///
/// Only a failed datagram send is returned as an error; protocol faults are
/// logged and swallowed.
pub(crate) async fn handle_inbound(state: &GatewayState, inbound: Inbound) -> TgramResult<()> {
    let Inbound { peer, message } = inbound;

    let envelope = match Envelope::decode(&message) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(peer = %peer, error = %e, len = message.len(), "dropping undecodable envelope");
            return Ok(());
        }
    };
    debug!(
        peer = %peer,
        kind = envelope.kind(),
        pipe_id = ?envelope.pipe_id(),
        "envelope received"
    );

    match envelope {
        Envelope::RegistrationRequest => handle_registration_request(state, peer).await,
        Envelope::Announcement { pipe_id, services } => {
            handle_announcement(state, peer, pipe_id, services).await
        }
        Envelope::ServiceResponse {
            pipe_id,
            service_id,
            request_id,
            payload,
        } => {
            handle_service_response(state, peer, &pipe_id, &service_id, request_id, payload)
                .await;
            Ok(())
        }
        other => {
            warn!(peer = %peer, kind = other.kind(), "unexpected envelope from agent, dropping");
            Ok(())
        }
    }
}

async fn handle_registration_request(state: &GatewayState, peer: SocketAddr) -> TgramResult<()> {
    let pipe = state.pipes.create(peer).await;
    state
        .endpoint
        .send_envelope(&build_registration(&pipe.id, Vec::new()), peer)
        .await
}

async fn handle_announcement(
    state: &GatewayState,
    peer: SocketAddr,
    pipe_id: String,
    services: Vec<ServiceAnnouncement>,
) -> TgramResult<()> {
    let Some(pipe) = state.pipes.get(&pipe_id).await else {
        warn!(peer = %peer, pipe_id = %pipe_id, "announcement for unknown pipe, dropping");
        return Ok(());
    };
    pipe.set_peer(peer).await;

    let mut acks = Vec::with_capacity(services.len());
    for announced in services {
        if announced.uuid.len() != SERVICE_UUID_LEN {
            warn!(pipe_id = %pipe_id, uuid = %announced.uuid, "malformed service uuid in announcement, skipping");
            continue;
        }
        let added = pipe.register_service(&announced.uuid, &announced.name).await;
        let status = if state.services.get(&announced.uuid).is_some() {
            ServiceStatus::Registered
        } else {
            ServiceStatus::Unknown
        };
        if added {
            info!(
                pipe_id = %pipe_id,
                service = %announced.uuid,
                name = %announced.name,
                ?status,
                "service bound to pipe"
            );
        }
        acks.push(ServiceAck {
            uuid: announced.uuid,
            status,
        });
    }

    state
        .endpoint
        .send_envelope(&build_registration(&pipe_id, acks), peer)
        .await
}

async fn handle_service_response(
    state: &GatewayState,
    peer: SocketAddr,
    pipe_id: &str,
    service_id: &str,
    request_id: u64,
    payload: Payload,
) {
    let Some(pipe) = state.pipes.get(pipe_id).await else {
        warn!(peer = %peer, pipe_id, request_id, "response on unknown pipe, dropping");
        return;
    };
    pipe.set_peer(peer).await;

    if !pipe.has_service(service_id).await {
        warn!(pipe_id, service = %service_id, request_id, "response for service not bound to this pipe, dropping");
        return;
    }
    let Some(service) = state.services.get(service_id) else {
        warn!(pipe_id, service = %service_id, request_id, "response for unconfigured service, dropping");
        return;
    };
    let Ok(id) = RequestId::try_from(request_id) else {
        warn!(pipe_id, service = %service_id, request_id, "request id out of range, dropping");
        return;
    };

    let response = match payload {
        Payload::Data(bytes) => bytes,
        Payload::Error(reason) => {
            warn!(service = %service_id, request_id, reason = %reason, "agent reported backend error");
            BAD_GATEWAY_RESPONSE.to_vec()
        }
    };
    let len = response.len();

    if service.requests.deliver(id, response).await {
        debug!(service = %service_id, request_id, len, "response delivered");
    } else {
        warn!(service = %service_id, request_id, "response for unknown or expired request, dropping");
    }
}

// ── Message builders ─────────────────────────────────────────────────

/// Registration response carrying `pipe_id` and any service acks.
fn build_registration(pipe_id: &str, acks: Vec<ServiceAck>) -> Envelope {
    Envelope::Registration {
        pipe_id: pipe_id.to_string(),
        acks,
    }
}

/// Service request carrying a client's bytes to the agent.
pub(crate) fn build_service_request(
    pipe_id: &str,
    service_id: &str,
    request_id: RequestId,
    payload: Vec<u8>,
) -> Envelope {
    Envelope::ServiceRequest {
        pipe_id: pipe_id.to_string(),
        service_id: service_id.to_string(),
        request_id: u64::from(request_id),
        payload: Payload::Data(payload),
    }
}
