//! # Control-Channel Messaging
//!
//! Byte-accurate send and receive over the nonblocking control connection.
//! Every transfer is bounded by a deadline taken from the request's timeout
//! parameter; a transfer that cannot complete in time fails with a timed-out
//! error, and a connection the peer has abandoned is reported as the peer
//! not responding. The caller names the item being moved so failures read as
//! "failed to receive stats: timed out" rather than a bare I/O error.

use anyhow::{anyhow, Result};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// One side of the control connection.
pub struct Channel {
    stream: TcpStream,
    /// Role name of the peer, for error reporting
    peer: &'static str,
}

fn peer_gone(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
    )
}

impl Channel {
    pub fn new(stream: TcpStream, peer: &'static str) -> Self {
        Channel { stream, peer }
    }

    /// Send the whole buffer within `secs` seconds.
    pub async fn send(&mut self, buf: &[u8], secs: u32, item: &str) -> Result<()> {
        let deadline = Duration::from_secs(secs.max(1) as u64);
        let io = async {
            self.stream.write_all(buf).await?;
            self.stream.flush().await
        };
        match timeout(deadline, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if peer_gone(e.kind()) => {
                Err(anyhow!("failed to send {}: {} not responding", item, self.peer))
            }
            Ok(Err(e)) => Err(anyhow!("failed to send {}: {}", item, e)),
            Err(_) => Err(anyhow!("failed to send {}: timed out", item)),
        }
    }

    /// Fill the whole buffer within `secs` seconds.
    pub async fn recv(&mut self, buf: &mut [u8], secs: u32, item: &str) -> Result<()> {
        let deadline = Duration::from_secs(secs.max(1) as u64);
        match timeout(deadline, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if peer_gone(e.kind()) => {
                Err(anyhow!("failed to receive {}: {} not responding", item, self.peer))
            }
            Ok(Err(e)) => Err(anyhow!("failed to receive {}: {}", item, e)),
            Err(_) => Err(anyhow!("failed to receive {}: timed out", item)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn transfers_are_byte_accurate() {
        let (a, b) = pair().await;
        let mut tx = Channel::new(a, "client");
        let mut rx = Channel::new(b, "server");

        tx.send(b"0123456789", 5, "payload").await.unwrap();
        let mut got = [0u8; 10];
        rx.recv(&mut got, 5, "payload").await.unwrap();
        assert_eq!(&got, b"0123456789");
    }

    #[tokio::test]
    async fn recv_times_out_against_a_silent_peer() {
        let (_silent, b) = pair().await;
        let mut rx = Channel::new(b, "server");

        let start = Instant::now();
        let mut buf = [0u8; 64];
        let err = rx.recv(&mut buf, 1, "stats").await.unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(err.to_string(), "failed to receive stats: timed out");
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn recv_reports_a_closed_peer() {
        let (closed, b) = pair().await;
        drop(closed);
        let mut rx = Channel::new(b, "server");

        let mut buf = [0u8; 8];
        let err = rx.recv(&mut buf, 2, "sync").await.unwrap_err();
        assert_eq!(err.to_string(), "failed to receive sync: server not responding");
    }
}
