//! tgram-gateway: the public side of a tgram tunnel.
//!
//! Each configured service gets a TCP listener. A client's first read is
//! wrapped in a service request and sent over the datagram endpoint to the
//! agent that most recently announced that service; the agent's response
//! is written back and the client is closed. A watchdog retires requests
//! that outlive their service's TTL.

mod acceptor;
pub mod config;
mod dispatch;
mod gateway;
pub mod pipes;
pub mod registry;
pub mod service;
mod watchdog;

pub use config::{GatewayConfig, ServiceConfig};
pub use gateway::{Gateway, GATEWAY_REASSEMBLY_CAPACITY};
pub use pipes::{Pipe, PipeTable, ServiceDef};
pub use registry::{CancelReason, Delivery, RequestId, RequestRegistry};
pub use watchdog::WATCHDOG_INTERVAL;
