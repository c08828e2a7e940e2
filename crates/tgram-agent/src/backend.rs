//! One request/response exchange with a local backend.

use std::time::Duration;
use tgram_core::{TgramError, TgramResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Initial size of the response buffer.
const INITIAL_READ_BUFFER: usize = 4 * 1024;

/// Connect to `address`, write `payload`, and read the response.
///
/// The read buffer starts small and doubles each time a read fills all of
/// its free space, up to `cap` bytes. A read that leaves space free, or
/// EOF, ends the response. Every I/O step is bounded by `io_timeout`.
pub async fn exchange(
    address: &str,
    payload: &[u8],
    io_timeout: Duration,
    cap: usize,
) -> TgramResult<Vec<u8>> {
    let mut stream = timeout(io_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| TgramError::Timeout)??;
    debug!(backend = %address, len = payload.len(), "backend connected");

    timeout(io_timeout, stream.write_all(payload))
        .await
        .map_err(|_| TgramError::Timeout)??;

    let cap = cap.max(1);
    let mut buf = vec![0u8; INITIAL_READ_BUFFER.min(cap)];
    let mut filled = 0;
    loop {
        let free = buf.len() - filled;
        let n = timeout(io_timeout, stream.read(&mut buf[filled..]))
            .await
            .map_err(|_| TgramError::Timeout)??;
        filled += n;

        if n == 0 || n < free {
            break;
        }
        if buf.len() >= cap {
            warn!(backend = %address, cap, "backend response reached size cap, truncating");
            break;
        }
        let grown = (buf.len() * 2).min(cap);
        buf.resize(grown, 0);
    }

    buf.truncate(filled);
    debug!(backend = %address, len = filled, "backend response read");
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const IO_TIMEOUT: Duration = Duration::from_secs(5);

    /// Backend that reads one request and answers with `response`.
    async fn backend(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request).await.unwrap();
            stream.write_all(&response).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn small_response_is_returned_verbatim() {
        let addr = backend(b"hello\0world".to_vec()).await;
        let response = exchange(&addr, b"GET /", IO_TIMEOUT, 1 << 20).await.unwrap();
        assert_eq!(response, b"hello\0world");
    }

    #[tokio::test]
    async fn empty_response_on_immediate_close() {
        let addr = backend(Vec::new()).await;
        let response = exchange(&addr, b"ping", IO_TIMEOUT, 1 << 20).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn response_is_capped() {
        let addr = backend(vec![7u8; 64 * 1024]).await;
        let response = exchange(&addr, b"big", IO_TIMEOUT, 100).await.unwrap();
        assert!(response.len() <= 100);
        assert!(response.iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(exchange(&addr, b"x", IO_TIMEOUT, 1024).await.is_err());
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _held = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });
        let result = exchange(&addr, b"x", Duration::from_millis(200), 1024).await;
        assert!(matches!(result, Err(TgramError::Timeout)));
    }
}
