//! Per-service client acceptors and connection handlers.
//!
//! A connection moves through `accepted -> forwarding -> awaiting response`
//! and ends in exactly one of: response written, cancelled (timed out,
//! superseded, shut down), or client gone. Whatever the outcome the
//! request is retired from its registry before the handler returns.

use crate::dispatch::build_service_request;
use crate::gateway::GatewayState;
use crate::registry::{CancelReason, Delivery, PendingRequest, RequestId};
use crate::service::Service;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tgram_core::{TgramError, BAD_GATEWAY_RESPONSE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Pause between admission checks while a service is saturated.
const ADMISSION_RETRY: Duration = Duration::from_millis(1);

/// Extra delay per in-flight request applied after admission.
const LOAD_SHED_STEP: Duration = Duration::from_micros(50);

/// Pause between attempts to register a request while no id is free.
const REGISTER_RETRY: Duration = Duration::from_millis(20);

/// Pause after a failed `accept`.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept clients for one service until shutdown.
pub(crate) async fn accept_loop(
    state: Arc<GatewayState>,
    service: Arc<Service>,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.recv() => {
                debug!(service = %service.id, "accept loop cancelled");
                break;
            }
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(service = %service.id, error = %e, "accept failed");
                    sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        admit(&service).await;

        // A reused client address must not be confused with a stale request.
        service.requests.clear_connection(peer).await;

        let Some(pending) = register(&service, peer).await else {
            warn!(service = %service.id, peer = %peer, "no request slot within TTL, dropping client");
            continue;
        };

        debug!(service = %service.id, request_id = pending.id, peer = %peer, "client accepted");
        tokio::spawn(handle_connection(
            state.clone(),
            service.clone(),
            stream,
            peer,
            pending,
        ));
    }
}

/// Hold the acceptor while the service is above its admission ceiling,
/// then apply a load-proportional delay.
async fn admit(service: &Service) {
    let mut waited = false;
    while service.requests.count().await > service.max_connections {
        if !waited {
            debug!(service = %service.id, max = service.max_connections, "service saturated, holding accept");
            waited = true;
        }
        service.requests.sweep(service.request_ttl).await;
        sleep(ADMISSION_RETRY).await;
    }

    let load = service.requests.count().await;
    if load > 0 {
        sleep(LOAD_SHED_STEP * load as u32).await;
    }
}

/// Register a request for `peer`, retrying until the service's TTL elapses.
async fn register(service: &Service, peer: SocketAddr) -> Option<PendingRequest> {
    let deadline = Instant::now() + service.request_ttl;
    loop {
        match service.requests.create(peer).await {
            Ok(pending) => return Some(pending),
            Err(e) => {
                if Instant::now() >= deadline {
                    return None;
                }
                debug!(service = %service.id, error = %e, "request registration failed, retrying");
                sleep(REGISTER_RETRY).await;
            }
        }
    }
}

/// Drive one client connection to completion.
async fn handle_connection(
    state: Arc<GatewayState>,
    service: Arc<Service>,
    mut stream: TcpStream,
    peer: SocketAddr,
    pending: PendingRequest,
) {
    let PendingRequest { id, mut delivery } = pending;

    let mut buf = vec![0u8; service.request_buffer];
    let read = tokio::select! {
        result = stream.read(&mut buf) => result,
        outcome = &mut delivery => {
            finish(&state, &service, &mut stream, id, outcome).await;
            return;
        }
    };
    let len = match read {
        Ok(0) => {
            debug!(service = %service.id, request_id = id, peer = %peer, "client closed before sending");
            service.requests.remove(id).await;
            return;
        }
        Ok(n) => n,
        Err(e) => {
            debug!(service = %service.id, request_id = id, error = %e, "client read failed");
            service.requests.remove(id).await;
            return;
        }
    };
    buf.truncate(len);

    match forward(&state, &service, id, buf).await {
        Forward::Sent => {}
        Forward::Rejected => {
            let outcome = Ok(Delivery::Response(BAD_GATEWAY_RESPONSE.to_vec()));
            finish(&state, &service, &mut stream, id, outcome).await;
            return;
        }
        Forward::Failed => {
            service.requests.mark_closed(id).await;
            return;
        }
    }

    let outcome = await_delivery(&service, &mut stream, id, &mut delivery).await;
    match outcome {
        Some(outcome) => finish(&state, &service, &mut stream, id, outcome).await,
        None => {
            debug!(service = %service.id, request_id = id, peer = %peer, "client went away while waiting");
            service.requests.mark_closed(id).await;
        }
    }
}

/// Outcome of handing a client's bytes to a pipe.
#[derive(Debug, PartialEq, Eq)]
enum Forward {
    /// Sent, or no pipe serves the service yet and the request waits out
    /// its TTL.
    Sent,
    /// The request cannot be carried in one message; only this client fails.
    Rejected,
    /// The datagram send failed, which stops the gateway.
    Failed,
}

/// Send the client's bytes to the pipe serving this service.
async fn forward(state: &GatewayState, service: &Service, id: RequestId, payload: Vec<u8>) -> Forward {
    let Some(pipe) = state.pipes.route(&service.id).await else {
        warn!(service = %service.id, request_id = id, "no pipe serves this service, request will expire");
        return Forward::Sent;
    };

    let len = payload.len();
    let envelope = build_service_request(&pipe.id, &service.id, id, payload);
    let peer = pipe.peer().await;
    match state.endpoint.send_envelope(&envelope, peer).await {
        Ok(()) => {
            debug!(service = %service.id, request_id = id, pipe_id = %pipe.id, len, "request forwarded");
            Forward::Sent
        }
        Err(e @ (TgramError::InvalidGram(_) | TgramError::Codec(_))) => {
            warn!(service = %service.id, request_id = id, len, error = %e, "request does not fit in one message");
            Forward::Rejected
        }
        Err(e) => {
            error!(service = %service.id, request_id = id, error = %e, "datagram send failed");
            let _ = state.fatal_tx.try_send(e);
            Forward::Failed
        }
    }
}

/// Wait for the registry to signal this request while watching the client.
///
/// Returns `None` if the client closed or errored first. Extra bytes the
/// client sends after its request are discarded.
async fn await_delivery(
    service: &Service,
    stream: &mut TcpStream,
    id: RequestId,
    delivery: &mut oneshot::Receiver<Delivery>,
) -> Option<Result<Delivery, oneshot::error::RecvError>> {
    let mut scratch = [0u8; 1024];
    loop {
        tokio::select! {
            outcome = &mut *delivery => return Some(outcome),
            read = stream.read(&mut scratch) => match read {
                Ok(0) | Err(_) => return None,
                Ok(n) => {
                    debug!(service = %service.id, request_id = id, extra = n, "discarding bytes sent after request");
                }
            },
        }
    }
}

/// Write the outcome to the client, close it, and retire the request.
async fn finish(
    state: &GatewayState,
    service: &Service,
    stream: &mut TcpStream,
    id: RequestId,
    outcome: Result<Delivery, oneshot::error::RecvError>,
) {
    let reply: Option<&[u8]> = match &outcome {
        Ok(Delivery::Response(bytes)) => Some(bytes.as_slice()),
        Ok(Delivery::Cancelled(reason)) => {
            info!(service = %service.id, request_id = id, ?reason, "request cancelled");
            match reason {
                CancelReason::TimedOut | CancelReason::Closed if state.gateway_error_on_timeout => {
                    Some(BAD_GATEWAY_RESPONSE)
                }
                _ => None,
            }
        }
        Err(_) => None,
    };

    if let Some(bytes) = reply {
        if let Err(e) = stream.write_all(bytes).await {
            debug!(service = %service.id, request_id = id, error = %e, "client write failed");
        } else {
            debug!(service = %service.id, request_id = id, len = bytes.len(), "response written");
        }
    }
    let _ = stream.shutdown().await;
    service.requests.remove(id).await;
}
