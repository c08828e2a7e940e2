//! tgram-agent: the private side of a tgram tunnel.
//!
//! The agent registers with a gateway over a datagram pipe, announces the
//! backends it can reach, and answers each forwarded request by running one
//! request/response exchange against the matching backend.

mod agent;
pub mod backend;
pub mod config;
pub mod pipe;

pub use agent::Agent;
pub use config::{AgentConfig, BackendService, PipeConfig};
pub use pipe::{AgentPipe, PipeState, AGENT_REASSEMBLY_CAPACITY};
