//! Full-duplex byte relay between the client and the tunnel target.
//!
//! The relay returns as soon as the *first* direction finishes; the other
//! direction is cancelled and both ends are shut down, so a one-sided close
//! ends the whole tunnel.
//!
//! Both ends share one absolute deadline, set when the relay starts. It caps
//! the lifetime of the whole session and is not reset by traffic, so a
//! tunnel that is still transferring data is cut off once the deadline
//! passes.

use log::debug;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, sleep_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToTarget => f.write_str("client -> target"),
            Direction::TargetToClient => f.write_str("target -> client"),
        }
    }
}

/// What ended the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// This direction reached end-of-stream or failed first.
    Finished(Direction),
    /// The session deadline passed before either direction finished.
    DeadlineExceeded,
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub end: RelayEnd,
    /// Bytes moved by the finishing direction. Zero on deadline.
    pub bytes: u64,
    pub error: Option<io::Error>,
}

impl RelayOutcome {
    fn finished(direction: Direction, result: io::Result<u64>) -> Self {
        match result {
            Ok(bytes) => Self {
                end: RelayEnd::Finished(direction),
                bytes,
                error: None,
            },
            Err(error) => Self {
                end: RelayEnd::Finished(direction),
                bytes: 0,
                error: Some(error),
            },
        }
    }
}

/// Copies bytes both ways until one direction ends or `session_timeout`
/// elapses. Consumes both streams; they are closed when this returns.
pub async fn relay<C, T>(client: C, target: T, session_timeout: Duration) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + session_timeout;

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let outcome = tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut target_write) => {
            RelayOutcome::finished(Direction::ClientToTarget, result)
        }
        result = tokio::io::copy(&mut target_read, &mut client_write) => {
            RelayOutcome::finished(Direction::TargetToClient, result)
        }
        _ = sleep_until(deadline) => RelayOutcome {
            end: RelayEnd::DeadlineExceeded,
            bytes: 0,
            error: None,
        },
    };

    // Best effort: the peer may already be gone.
    if let Err(e) = client_write.shutdown().await {
        debug!("Client shutdown after relay: {}", e);
    }
    if let Err(e) = target_write.shutdown().await {
        debug!("Target shutdown after relay: {}", e);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn test_client_eof_ends_relay() {
        let (client, mut client_peer) = duplex(1024);
        let (target, mut target_peer) = duplex(1024);

        let handle = tokio::spawn(relay(client, target, Duration::from_secs(5)));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Closing the client side ends the relay even though the target
        // never closes.
        drop(client_peer);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.end, RelayEnd::Finished(Direction::ClientToTarget));
        assert_eq!(outcome.bytes, 4);
        assert!(outcome.error.is_none());

        // Target side observes the close.
        let mut rest = Vec::new();
        target_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_target_eof_ends_relay() {
        let (client, mut client_peer) = duplex(1024);
        let (target, mut target_peer) = duplex(1024);

        let handle = tokio::spawn(relay(client, target, Duration::from_secs(5)));

        target_peer.write_all(b"hello client").await.unwrap();
        drop(target_peer);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.end, RelayEnd::Finished(Direction::TargetToClient));
        assert_eq!(outcome.bytes, 12);

        let mut received = Vec::new();
        client_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello client");
    }

    #[tokio::test]
    async fn test_deadline_cuts_active_session() {
        let (client, mut client_peer) = duplex(1024);
        let (target, mut target_peer) = duplex(1024);

        let handle = tokio::spawn(relay(client, target, Duration::from_millis(200)));

        // Keep traffic flowing; the deadline is absolute and still fires.
        let writer = tokio::spawn(async move {
            for _ in 0..20 {
                if client_peer.write_all(b"x").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        let drain = tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = target_peer.read_to_end(&mut sink).await;
        });

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("relay must end at its deadline")
            .unwrap();
        assert_eq!(outcome.end, RelayEnd::DeadlineExceeded);

        let _ = writer.await;
        let _ = drain.await;
    }
}
