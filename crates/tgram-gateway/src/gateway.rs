//! Gateway runtime: owns the datagram endpoint, the service listeners and
//! the tasks that drive them.

use crate::acceptor;
use crate::config::GatewayConfig;
use crate::dispatch;
use crate::pipes::PipeTable;
use crate::registry::CancelReason;
use crate::service::{bind_addr, Service, ServiceTable};
use crate::watchdog;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tgram_core::{DatagramEndpoint, TgramError, TgramResult};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Reassembly table capacity on the gateway side.
pub const GATEWAY_REASSEMBLY_CAPACITY: usize = 20;

/// Pause after a socket-level receive error.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// State shared by every gateway task.
pub(crate) struct GatewayState {
    pub(crate) services: ServiceTable,
    pub(crate) pipes: Arc<PipeTable>,
    pub(crate) endpoint: DatagramEndpoint,
    pub(crate) gateway_error_on_timeout: bool,
    /// Reports a failed datagram send; the first one stops the gateway.
    pub(crate) fatal_tx: mpsc::Sender<TgramError>,
}

/// A bound, not yet running gateway.
pub struct Gateway {
    pub(crate) state: Arc<GatewayState>,
    listeners: Vec<(Arc<Service>, TcpListener)>,
    fatal_rx: mpsc::Receiver<TgramError>,
}

impl Gateway {
    /// Bind the datagram port and every service listener.
    pub async fn bind(config: GatewayConfig) -> TgramResult<Self> {
        let datagram_addr = bind_addr(config.inaddr_any, config.listener_port);
        let endpoint = DatagramEndpoint::bind(datagram_addr, GATEWAY_REASSEMBLY_CAPACITY)
            .await
            .map_err(|e| TgramError::Config(format!("cannot bind datagram port {datagram_addr}: {e}")))?;
        info!(addr = %endpoint.local_addr()?, "datagram endpoint bound");

        let services = ServiceTable::new(&config.services);
        let mut listeners = Vec::with_capacity(services.len());
        for service in services.iter() {
            let addr = service.bind_addr();
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                TgramError::Config(format!("cannot bind service {} on {addr}: {e}", service.name))
            })?;
            info!(
                service = %service.id,
                name = %service.name,
                addr = %listener.local_addr()?,
                max_connections = service.max_connections,
                request_ttl = service.request_ttl.as_secs(),
                "service listening"
            );
            listeners.push((service.clone(), listener));
        }

        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let state = Arc::new(GatewayState {
            services,
            pipes: Arc::new(PipeTable::new()),
            endpoint,
            gateway_error_on_timeout: config.gateway_error_on_timeout,
            fatal_tx,
        });

        Ok(Self {
            state,
            listeners,
            fatal_rx,
        })
    }

    /// Address of the datagram endpoint agents talk to.
    pub fn datagram_addr(&self) -> TgramResult<SocketAddr> {
        self.state.endpoint.local_addr()
    }

    /// Address the listener for `service_id` is bound to.
    pub fn service_addr(&self, service_id: &str) -> TgramResult<SocketAddr> {
        let (_, listener) = self
            .listeners
            .iter()
            .find(|(service, _)| service.id == service_id)
            .ok_or_else(|| TgramError::UnknownService(service_id.to_string()))?;
        Ok(listener.local_addr()?)
    }

    /// The pipe table, for inspection while the gateway runs.
    pub fn pipes(&self) -> Arc<PipeTable> {
        self.state.pipes.clone()
    }

    /// Run until `shutdown` completes or a datagram send fails.
    ///
    /// On the way out every outstanding request is cancelled so connection
    /// handlers close their clients promptly.
    pub async fn run<F>(self, shutdown: F) -> TgramResult<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            state,
            listeners,
            mut fatal_rx,
        } = self;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut tasks = JoinSet::new();

        tasks.spawn(watchdog::run(state.clone(), shutdown_tx.subscribe()));
        for (service, listener) in listeners {
            tasks.spawn(acceptor::accept_loop(
                state.clone(),
                service,
                listener,
                shutdown_tx.subscribe(),
            ));
        }
        tasks.spawn(receive_loop(state.clone(), shutdown_tx.subscribe()));

        let result = tokio::select! {
            _ = shutdown => {
                info!("shutdown requested");
                Ok(())
            }
            fatal = fatal_rx.recv() => match fatal {
                Some(e) => {
                    error!(error = %e, "fatal transport error");
                    Err(e)
                }
                None => Ok(()),
            },
        };

        // Acceptors must be gone before the final cancel, or one still
        // admitting a client could register a request nobody will signal.
        let _ = shutdown_tx.send(());
        tasks.shutdown().await;
        let mut cancelled = 0;
        for service in state.services.iter() {
            cancelled += service.requests.cancel_all(CancelReason::Shutdown).await;
        }
        info!(cancelled, "outstanding requests cancelled");

        result
    }
}

/// Read reassembled messages and dispatch them until shutdown.
async fn receive_loop(state: Arc<GatewayState>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let inbound = tokio::select! {
            _ = shutdown.recv() => break,
            received = state.endpoint.recv() => received,
        };
        match inbound {
            Ok(inbound) => {
                if let Err(e) = dispatch::handle_inbound(&state, inbound).await {
                    error!(error = %e, "datagram send failed");
                    let _ = state.fatal_tx.try_send(e);
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "datagram receive failed");
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
}
