//! Datagram endpoint: sends messages as grams and yields reassembled messages.
//!
//! Each endpoint owns one UDP socket. Sending a message takes the endpoint's
//! send lock for the whole gram sequence, so grams of concurrent messages
//! never interleave on the wire and every message gets its own msgid.

use crate::envelope::Envelope;
use crate::error::{TgramError, TgramResult};
use crate::gram::{split_with, Gram, HEADER_LEN, MAX_FRAGMENT_PAYLOAD};
use crate::reassembly::{Reassembler, Reassembly};
use std::net::SocketAddr;
use std::sync::{Mutex as SyncMutex, MutexGuard};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Receive buffer size: the largest UDP payload plus slack.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// A complete message received from a peer.
#[derive(Debug)]
pub struct Inbound {
    /// Address the message's grams came from.
    pub peer: SocketAddr,
    /// Reassembled message bytes.
    pub message: Vec<u8>,
}

/// UDP socket speaking the gram protocol.
pub struct DatagramEndpoint {
    socket: UdpSocket,
    /// Guards the send sequence; holds the next msgid to allocate.
    send_lock: Mutex<u64>,
    /// Never held across an await, which keeps [`recv`](Self::recv) cancel-safe.
    reassembler: SyncMutex<Reassembler>,
    fragment_size: usize,
}

impl DatagramEndpoint {
    /// Bind a UDP socket at `addr` with a reassembly table of `capacity` messages.
    pub async fn bind<A: ToSocketAddrs>(addr: A, capacity: usize) -> TgramResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, capacity))
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: UdpSocket, capacity: usize) -> Self {
        Self {
            socket,
            send_lock: Mutex::new(1),
            reassembler: SyncMutex::new(Reassembler::new(capacity)),
            fragment_size: MAX_FRAGMENT_PAYLOAD,
        }
    }

    /// Use fragments of at most `size` bytes instead of the protocol maximum.
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size.clamp(1, MAX_FRAGMENT_PAYLOAD);
        self
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> TgramResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one message to `peer` as a sequence of grams.
    ///
    /// A failed `send_to` is returned as [`TgramError::Transport`]; there is
    /// no retry at this layer.
    pub async fn send_message(&self, message: &[u8], peer: SocketAddr) -> TgramResult<()> {
        let mut next_msgid = self.send_lock.lock().await;
        let msgid = *next_msgid;
        *next_msgid = if msgid == u64::MAX { 1 } else { msgid + 1 };

        let grams = split_with(message, msgid, self.fragment_size)?;
        let total = grams.len();
        for gram in grams {
            let datagram = gram.encode();
            trace!(
                peer = %peer,
                msgid,
                index = gram.index,
                total,
                head = %hex::encode(&gram.payload[..gram.payload.len().min(16)]),
                "sending gram"
            );
            self.socket
                .send_to(&datagram, peer)
                .await
                .map_err(|e| TgramError::Transport(format!("send_to {peer} failed: {e}")))?;
        }

        debug!(peer = %peer, msgid, grams = total, len = message.len(), "message sent");
        Ok(())
    }

    /// Encode and send an envelope.
    pub async fn send_envelope(&self, envelope: &Envelope, peer: SocketAddr) -> TgramResult<()> {
        let message = envelope.encode()?;
        self.send_message(&message, peer).await
    }

    /// Receive datagrams until one completes a message.
    ///
    /// Malformed and rejected grams are logged and skipped. Socket errors are
    /// returned to the caller. Cancel-safe: a gram is either fully accepted
    /// into the reassembly table or never read.
    pub async fn recv(&self) -> TgramResult<Inbound> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE + HEADER_LEN];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;

            let gram = match Gram::decode(&buf[..len]) {
                Ok(gram) => gram,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "dropping malformed datagram");
                    continue;
                }
            };

            trace!(
                peer = %peer,
                msgid = gram.msgid,
                index = gram.index,
                total = gram.total,
                head = %hex::encode(&gram.payload[..gram.payload.len().min(16)]),
                "received gram"
            );

            let outcome = self.reassembler().accept(peer, gram);
            match outcome {
                Reassembly::Complete(message) => return Ok(Inbound { peer, message }),
                Reassembly::Pending => {}
                Reassembly::Rejected(reason) => {
                    debug!(peer = %peer, ?reason, "gram rejected");
                }
            }
        }
    }

    /// Discard expired partial messages. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.reassembler().sweep()
    }

    /// Number of partial messages awaiting fragments.
    pub fn pending(&self) -> usize {
        self.reassembler().pending()
    }

    fn reassembler(&self) -> MutexGuard<'_, Reassembler> {
        // A panic mid-accept leaves the table consistent enough to keep using.
        self.reassembler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn pair() -> (Arc<DatagramEndpoint>, Arc<DatagramEndpoint>) {
        let a = DatagramEndpoint::bind("127.0.0.1:0", 8).await.unwrap();
        let b = DatagramEndpoint::bind("127.0.0.1:0", 8).await.unwrap();
        (Arc::new(a), Arc::new(b))
    }

    #[tokio::test]
    async fn message_larger_than_one_gram_arrives_intact() {
        let (a, b) = pair().await;
        let message: Vec<u8> = (0..MAX_FRAGMENT_PAYLOAD + 4096)
            .map(|i| (i % 256) as u8)
            .collect();

        let receiver = {
            let b = b.clone();
            tokio::spawn(async move { b.recv().await })
        };
        a.send_message(&message, b.local_addr().unwrap()).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .expect("timed out")
            .unwrap()
            .unwrap();
        assert_eq!(inbound.peer, a.local_addr().unwrap());
        assert_eq!(inbound.message, message);
    }

    #[tokio::test]
    async fn concurrent_sends_do_not_interleave() {
        let a = Arc::new(
            DatagramEndpoint::bind("127.0.0.1:0", 8)
                .await
                .unwrap()
                .with_fragment_size(16),
        );
        let b = Arc::new(DatagramEndpoint::bind("127.0.0.1:0", 8).await.unwrap());
        let target = b.local_addr().unwrap();

        let mut senders = Vec::new();
        for n in 0..8u8 {
            let a = a.clone();
            senders.push(tokio::spawn(async move {
                let message = vec![n; 100];
                a.send_message(&message, target).await
            }));
        }
        for sender in senders {
            sender.await.unwrap().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let inbound = tokio::time::timeout(Duration::from_secs(5), b.recv())
                .await
                .expect("timed out")
                .unwrap();
            assert_eq!(inbound.message.len(), 100);
            let first = inbound.message[0];
            assert!(inbound.message.iter().all(|&byte| byte == first));
            seen.push(first);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn envelopes_travel_between_endpoints() {
        let (a, b) = pair().await;
        a.send_envelope(&Envelope::RegistrationRequest, b.local_addr().unwrap())
            .await
            .unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(5), b.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(
            Envelope::decode(&inbound.message).unwrap(),
            Envelope::RegistrationRequest
        );
        assert_eq!(b.pending(), 0);
    }
}
