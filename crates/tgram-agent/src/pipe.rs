//! Agent side of one pipe.
//!
//! A pipe starts `Unregistered`, sends a registration request and becomes
//! `Registering`, and turns `Active` once the gateway assigns a pipe id. The
//! registration request is re-sent every `registration_retry` until that
//! happens; announcements are re-sent on the same schedule until the gateway
//! has acknowledged each service.

use crate::backend;
use crate::config::{BackendService, PipeConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tgram_core::{
    DatagramEndpoint, Envelope, Payload, ServiceAck, ServiceAnnouncement, ServiceStatus,
    TgramError, TgramResult,
};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Reassembly table capacity on the agent side.
pub const AGENT_REASSEMBLY_CAPACITY: usize = 100;

/// How often expired partial messages are discarded.
const REASSEMBLY_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Registration progress of a pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeState {
    Unregistered,
    Registering,
    Active { pipe_id: String },
}

/// A configured backend and the gateway's verdict on it.
#[derive(Debug)]
struct LocalService {
    backend: BackendService,
    /// `None` until the gateway acknowledges the announcement.
    status: RwLock<Option<ServiceStatus>>,
}

/// One pipe to one gateway.
pub struct AgentPipe {
    config: PipeConfig,
    gateway: SocketAddr,
    endpoint: Arc<DatagramEndpoint>,
    state: RwLock<PipeState>,
    services: HashMap<String, LocalService>,
}

impl AgentPipe {
    /// Resolve the gateway address and bind a datagram endpoint for it.
    pub async fn bind(config: PipeConfig) -> TgramResult<Self> {
        let gateway = tokio::net::lookup_host(config.gateway.as_str())
            .await
            .map_err(|e| TgramError::Config(format!("cannot resolve gateway {}: {e}", config.gateway)))?
            .next()
            .ok_or_else(|| TgramError::Config(format!("gateway {} has no address", config.gateway)))?;

        let local: SocketAddr = if gateway.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let endpoint = DatagramEndpoint::bind(local, AGENT_REASSEMBLY_CAPACITY).await?;
        info!(gateway = %gateway, local = %endpoint.local_addr()?, "pipe endpoint bound");

        let services = config
            .services
            .iter()
            .map(|backend| {
                (
                    backend.uuid.clone(),
                    LocalService {
                        backend: backend.clone(),
                        status: RwLock::new(None),
                    },
                )
            })
            .collect();

        Ok(Self {
            config,
            gateway,
            endpoint: Arc::new(endpoint),
            state: RwLock::new(PipeState::Unregistered),
            services,
        })
    }

    /// Gateway this pipe talks to.
    pub fn gateway(&self) -> SocketAddr {
        self.gateway
    }

    /// Current registration state.
    pub async fn state(&self) -> PipeState {
        self.state.read().await.clone()
    }

    /// Assigned pipe id, once active.
    pub async fn pipe_id(&self) -> Option<String> {
        match &*self.state.read().await {
            PipeState::Active { pipe_id } => Some(pipe_id.clone()),
            _ => None,
        }
    }

    /// Gateway's acknowledgement of a service, if one has arrived.
    pub async fn service_status(&self, uuid: &str) -> Option<ServiceStatus> {
        match self.services.get(uuid) {
            Some(service) => *service.status.read().await,
            None => None,
        }
    }

    /// Whether the gateway confirmed it serves clients for `uuid`.
    pub async fn is_registered(&self, uuid: &str) -> bool {
        self.service_status(uuid).await == Some(ServiceStatus::Registered)
    }

    /// Drive the pipe until shutdown or a datagram send fails.
    ///
    /// In-flight backend requests are aborted on the way out.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> TgramResult<()> {
        let mut retry = tokio::time::interval(self.config.registration_retry);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(REASSEMBLY_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<TgramError>(1);
        let mut requests = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = shutdown.recv() => break Ok(()),
                Some(e) = fatal_rx.recv() => break Err(e),
                _ = retry.tick() => {
                    if let Err(e) = self.on_retry_tick().await {
                        break Err(e);
                    }
                }
                _ = sweep.tick() => {
                    let expired = self.endpoint.sweep();
                    if expired > 0 {
                        debug!(count = expired, "expired partial messages discarded");
                    }
                }
                received = self.endpoint.recv() => match received {
                    Ok(inbound) => {
                        if inbound.peer != self.gateway {
                            warn!(peer = %inbound.peer, "message from unexpected peer, dropping");
                            continue;
                        }
                        match Envelope::decode(&inbound.message) {
                            Ok(envelope) => {
                                if let Err(e) = self.handle_envelope(envelope, &mut requests, &fatal_tx).await {
                                    break Err(e);
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping undecodable envelope"),
                        }
                    }
                    Err(e) => warn!(error = %e, "datagram receive failed"),
                },
                Some(joined) = requests.join_next(), if !requests.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "request task panicked");
                        }
                    }
                }
            }
        };

        let in_flight = requests.len();
        requests.shutdown().await;
        if in_flight > 0 {
            info!(in_flight, "aborted in-flight requests");
        }
        result
    }

    /// Re-send whatever the gateway has not answered yet.
    async fn on_retry_tick(&self) -> TgramResult<()> {
        let state = self.state().await;
        match state {
            PipeState::Unregistered | PipeState::Registering => {
                if state == PipeState::Registering {
                    debug!(gateway = %self.gateway, "no pipe id yet, retrying registration");
                }
                *self.state.write().await = PipeState::Registering;
                self.endpoint
                    .send_envelope(&Envelope::RegistrationRequest, self.gateway)
                    .await
            }
            PipeState::Active { pipe_id } => {
                for service in self.services.values() {
                    if service.status.read().await.is_none() {
                        self.announce(&pipe_id, &service.backend).await?;
                    }
                }
                Ok(())
            }
        }
    }

    async fn announce(&self, pipe_id: &str, backend: &BackendService) -> TgramResult<()> {
        let envelope = Envelope::Announcement {
            pipe_id: pipe_id.to_string(),
            services: vec![ServiceAnnouncement {
                uuid: backend.uuid.clone(),
                name: backend.name.clone(),
            }],
        };
        debug!(pipe_id, service = %backend.uuid, "announcing service");
        self.endpoint.send_envelope(&envelope, self.gateway).await
    }

    async fn handle_envelope(
        &self,
        envelope: Envelope,
        requests: &mut JoinSet<()>,
        fatal_tx: &mpsc::Sender<TgramError>,
    ) -> TgramResult<()> {
        match envelope {
            Envelope::Registration { pipe_id, acks } if acks.is_empty() => {
                self.on_pipe_assigned(pipe_id).await
            }
            Envelope::Registration { pipe_id, acks } => {
                self.on_acks(&pipe_id, acks).await;
                Ok(())
            }
            Envelope::ServiceRequest {
                pipe_id,
                service_id,
                request_id,
                payload,
            } => {
                self.on_service_request(pipe_id, service_id, request_id, payload, requests, fatal_tx)
                    .await;
                Ok(())
            }
            other => {
                warn!(kind = other.kind(), "unexpected envelope from gateway, dropping");
                Ok(())
            }
        }
    }

    async fn on_pipe_assigned(&self, pipe_id: String) -> TgramResult<()> {
        {
            let mut state = self.state.write().await;
            if let PipeState::Active { pipe_id: current } = &*state {
                if *current != pipe_id {
                    debug!(current = %current, ignored = %pipe_id, "already registered, ignoring extra pipe id");
                }
                return Ok(());
            }
            *state = PipeState::Active {
                pipe_id: pipe_id.clone(),
            };
        }
        info!(pipe_id = %pipe_id, gateway = %self.gateway, "pipe active");

        for service in self.services.values() {
            self.announce(&pipe_id, &service.backend).await?;
        }
        Ok(())
    }

    async fn on_acks(&self, pipe_id: &str, acks: Vec<ServiceAck>) {
        if self.pipe_id().await.as_deref() != Some(pipe_id) {
            warn!(pipe_id, "acknowledgement for another pipe, dropping");
            return;
        }
        for ack in acks {
            let Some(service) = self.services.get(&ack.uuid) else {
                warn!(service = %ack.uuid, "acknowledgement for unconfigured service");
                continue;
            };
            let previous = service.status.write().await.replace(ack.status);
            if previous == Some(ack.status) {
                continue;
            }
            match ack.status {
                ServiceStatus::Registered => {
                    info!(pipe_id, service = %ack.uuid, name = %service.backend.name, "service registered")
                }
                ServiceStatus::Unknown => {
                    warn!(pipe_id, service = %ack.uuid, name = %service.backend.name, "gateway has no listener for service")
                }
            }
        }
    }

    async fn on_service_request(
        &self,
        pipe_id: String,
        service_id: String,
        request_id: u64,
        payload: Payload,
        requests: &mut JoinSet<()>,
        fatal_tx: &mpsc::Sender<TgramError>,
    ) {
        if self.pipe_id().await.as_deref() != Some(pipe_id.as_str()) {
            warn!(pipe_id = %pipe_id, request_id, "request for another pipe, dropping");
            return;
        }
        let Some(service) = self.services.get(&service_id) else {
            warn!(service = %service_id, request_id, "request for unconfigured service, dropping");
            return;
        };

        let address = service.backend.address();
        let io_timeout = self.config.backend_timeout;
        let cap = self.config.response_cap;
        let endpoint = self.endpoint.clone();
        let gateway = self.gateway;
        let fatal_tx = fatal_tx.clone();

        requests.spawn(async move {
            let response = match payload {
                Payload::Data(bytes) => {
                    debug!(service = %service_id, request_id, len = bytes.len(), "forwarding to backend");
                    match backend::exchange(&address, &bytes, io_timeout, cap).await {
                        Ok(body) => Payload::Data(body),
                        Err(e) => {
                            warn!(service = %service_id, request_id, backend = %address, error = %e, "backend exchange failed");
                            Payload::Error(e.to_string())
                        }
                    }
                }
                Payload::Error(reason) => {
                    warn!(service = %service_id, request_id, reason = %reason, "undecodable request payload");
                    Payload::Error(reason)
                }
            };

            let sent =
                send_response(&endpoint, gateway, pipe_id, service_id, request_id, response).await;
            if let Err(e) = sent {
                error!(request_id, error = %e, "datagram send failed");
                let _ = fatal_tx.try_send(e);
            }
        });
    }
}

/// Send a service response, replacing a payload too large for one message
/// with an error marker so only this request fails.
///
/// Returns an error only when the datagram send itself failed.
async fn send_response(
    endpoint: &DatagramEndpoint,
    gateway: SocketAddr,
    pipe_id: String,
    service_id: String,
    request_id: u64,
    payload: Payload,
) -> TgramResult<()> {
    let envelope = Envelope::ServiceResponse {
        pipe_id: pipe_id.clone(),
        service_id: service_id.clone(),
        request_id,
        payload,
    };
    let e = match endpoint.send_envelope(&envelope, gateway).await {
        Err(e @ (TgramError::InvalidGram(_) | TgramError::Codec(_))) => e,
        other => return other,
    };

    warn!(service = %service_id, request_id, error = %e, "response does not fit in one message");
    let fallback = Envelope::ServiceResponse {
        pipe_id,
        service_id,
        request_id,
        payload: Payload::Error(e.to_string()),
    };
    endpoint.send_envelope(&fallback, gateway).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgram_core::MAX_PAYLOAD_LEN;
    use tokio::time::timeout;

    const PIPE: &str = "6f1c8f5e-3c1a-4b8e-9d2a-0a1b2c3d4e5f";
    const SERVICE: &str = "0b5f6a9e-3c1d-4e8f-9a2b-7c6d5e4f3a21";
    const WAIT: Duration = Duration::from_secs(5);

    async fn endpoints() -> (DatagramEndpoint, DatagramEndpoint, SocketAddr) {
        let agent = DatagramEndpoint::bind("127.0.0.1:0", 20).await.unwrap();
        let gateway = DatagramEndpoint::bind("127.0.0.1:0", 20).await.unwrap();
        let gateway_addr = gateway.local_addr().unwrap();
        (agent, gateway, gateway_addr)
    }

    async fn recv_payload(gateway: &DatagramEndpoint) -> (u64, Payload) {
        let inbound = timeout(WAIT, gateway.recv()).await.expect("timed out").unwrap();
        let Envelope::ServiceResponse {
            pipe_id,
            service_id,
            request_id,
            payload,
        } = Envelope::decode(&inbound.message).unwrap()
        else {
            panic!("expected service response");
        };
        assert_eq!(pipe_id, PIPE);
        assert_eq!(service_id, SERVICE);
        (request_id, payload)
    }

    #[tokio::test]
    async fn response_is_sent_as_is() {
        let (agent, gateway, gateway_addr) = endpoints().await;
        let body = b"HTTP/1.1 200 OK\r\n\r\nhi".to_vec();
        send_response(&agent, gateway_addr, PIPE.into(), SERVICE.into(), 7, Payload::Data(body.clone()))
            .await
            .unwrap();
        assert_eq!(recv_payload(&gateway).await, (7, Payload::Data(body)));
    }

    #[tokio::test]
    async fn oversized_response_becomes_error_marker() {
        let (agent, gateway, gateway_addr) = endpoints().await;
        let body = vec![b'x'; MAX_PAYLOAD_LEN + 1024 * 1024];
        send_response(&agent, gateway_addr, PIPE.into(), SERVICE.into(), 9, Payload::Data(body))
            .await
            .unwrap();

        let (request_id, payload) = recv_payload(&gateway).await;
        assert_eq!(request_id, 9);
        let Payload::Error(reason) = payload else {
            panic!("expected error marker");
        };
        assert!(reason.contains("fragments"), "{reason}");
    }
}
