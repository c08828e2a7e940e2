//! tgram-core: Shared protocol library for the tgram reverse tunnel.
//!
//! Provides the gram wire format (fragmentation of large messages into
//! bounded datagrams), the reassembler that recovers message boundaries,
//! the envelope documents exchanged between gateway and agent, and a
//! datagram endpoint that serializes multi-gram sends.

pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod gram;
pub mod reassembly;

// Re-export commonly used items at crate root.
pub use endpoint::{DatagramEndpoint, Inbound};
pub use envelope::{
    Envelope, Payload, ServiceAck, ServiceAnnouncement, ServiceStatus, MAX_PAYLOAD_LEN,
};
pub use error::{TgramError, TgramResult};
pub use gram::{
    split, split_with, Gram, HEADER_LEN, MAX_FRAGMENTS, MAX_FRAGMENT_PAYLOAD, MAX_MESSAGE_LEN,
};
pub use reassembly::{Reassembler, Reassembly, RejectReason, REASSEMBLY_TTL};

/// Canned response written to a client when the tunnel cannot produce one.
pub const BAD_GATEWAY_RESPONSE: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 27\r\nContent-Type: text/plain\r\n\r\nBad Gateway: Routing Error.";
