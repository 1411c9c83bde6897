//! CONNECT tunnels: dial, take over the client transport, relay.

use crate::connection::ClientInfo;
use crate::error::ProxyError;
use crate::relay::{RelayEnd, relay};
use crate::response::error_response;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Response, Uri};
use log::{debug, info, warn};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Where a client's reply goes. Framed replies are always possible; raw
/// takeover of the transport is a capability some sinks lack.
#[async_trait]
pub trait ClientSink: Send {
    type Raw: AsyncRead + AsyncWrite + Unpin + Send;

    async fn send_response(&mut self, response: Response<Bytes>) -> Result<(), ProxyError>;

    /// Takes exclusive control of the underlying transport. After this
    /// succeeds the sink can no longer send framed responses.
    fn hijack(&mut self) -> Result<Self::Raw, ProxyError>;

    /// Sends the success line on a hijacked transport. Sinks whose framing
    /// layer already wrote it on hijack override this.
    async fn acknowledge(&mut self, raw: &mut Self::Raw) -> std::io::Result<()> {
        raw.write_all(CONNECTION_ESTABLISHED).await?;
        raw.flush().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Credential check, owned by the dispatcher.
    Authorizing,
    Dialing,
    Hijacking,
    Tunneling,
    Closed,
    Error,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Error)
    }

    /// Forward moves follow `Authorizing -> Dialing -> Hijacking ->
    /// Tunneling -> Closed`; `Error` is reachable from any non-terminal state.
    pub fn can_advance_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Error) => true,
            (Authorizing, Dialing) | (Dialing, Hijacking) | (Hijacking, Tunneling) | (Tunneling, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Authorizing => "authorizing",
            TunnelState::Dialing => "dialing",
            TunnelState::Hijacking => "hijacking",
            TunnelState::Tunneling => "tunneling",
            TunnelState::Closed => "closed",
            TunnelState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One CONNECT request moving through its states. Starts in `Authorizing`.
#[derive(Debug)]
pub struct TunnelProgress {
    label: String,
    state: TunnelState,
}

impl TunnelProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: TunnelState::Authorizing,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Moves to `next`. Illegal moves are logged and leave the state as is.
    pub fn advance(&mut self, next: TunnelState) -> TunnelState {
        if self.state.can_advance_to(next) {
            debug!("Tunnel {}: {} -> {}", self.label, self.state, next);
            self.state = next;
        } else {
            warn!("Tunnel {}: ignoring transition {} -> {}", self.label, self.state, next);
        }
        self.state
    }
}

/// Extracts the literal `host:port` of a CONNECT target.
pub fn connect_target(uri: &Uri) -> Result<String, ProxyError> {
    let authority = uri
        .authority()
        .ok_or_else(|| ProxyError::ProtocolViolation(format!("CONNECT target '{}' is not host:port", uri)))?;
    if authority.port().is_none() {
        return Err(ProxyError::ProtocolViolation(format!(
            "CONNECT target '{}' has no port",
            authority
        )));
    }
    Ok(authority.as_str().to_string())
}

#[derive(Debug, Clone, Copy)]
pub struct TunnelEstablisher {
    timeout: Duration,
}

impl TunnelEstablisher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs an authorized CONNECT to completion and returns the terminal
    /// state. Every error before the hijack is answered through `sink`.
    pub async fn establish<K: ClientSink>(
        &self,
        mut progress: TunnelProgress,
        target: &Uri,
        client: &ClientInfo,
        sink: &mut K,
    ) -> TunnelState {
        if progress.state() != TunnelState::Authorizing {
            return progress.state();
        }

        let target = match connect_target(target) {
            Ok(target) => target,
            Err(e) => {
                warn!("Rejecting CONNECT from {}: {}", client.remote_addr, e);
                return fail(&mut progress, sink, &e).await;
            }
        };

        info!("CONNECT {} <- {}", target, client.remote_addr);
        progress.advance(TunnelState::Dialing);

        let upstream = match self.dial(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to reach {}: {}", target, e);
                return fail(&mut progress, sink, &e).await;
            }
        };

        progress.advance(TunnelState::Hijacking);
        let mut raw = match sink.hijack() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cannot take over client connection for {}: {}", target, e);
                drop(upstream);
                return fail(&mut progress, sink, &e).await;
            }
        };

        if let Err(e) = sink.acknowledge(&mut raw).await {
            warn!("Failed to send CONNECT reply to {}: {}", client.remote_addr, e);
            return progress.advance(TunnelState::Error);
        }
        progress.advance(TunnelState::Tunneling);

        let outcome = relay(raw, upstream, self.timeout).await;
        match (&outcome.end, &outcome.error) {
            (RelayEnd::DeadlineExceeded, _) => {
                info!("Tunnel {} closed after reaching its {:?} lifetime", target, self.timeout)
            }
            (RelayEnd::Finished(direction), Some(e)) => {
                warn!("Tunnel {} relay error ({}): {}", target, direction, e)
            }
            (RelayEnd::Finished(direction), None) => {
                debug!("Tunnel {} closed: {} finished after {} bytes", target, direction, outcome.bytes)
            }
        }

        progress.advance(TunnelState::Closed)
    }

    /// Connects to the target, bounded by the configured timeout.
    pub async fn dial(&self, target: &str) -> Result<TcpStream, ProxyError> {
        match timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::UpstreamUnreachable(e.to_string())),
            Err(_) => Err(ProxyError::UpstreamUnreachable(format!(
                "connect to {} timed out after {:?}",
                target, self.timeout
            ))),
        }
    }
}

async fn fail<K: ClientSink>(progress: &mut TunnelProgress, sink: &mut K, error: &ProxyError) -> TunnelState {
    if let Err(e) = sink.send_response(error_response(error)).await {
        debug!("Failed to report {} to client: {}", error.status_code(), e);
    }
    progress.advance(TunnelState::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};
    use tokio::net::TcpListener;

    /// Sink that records replies and optionally refuses takeover.
    struct RecordingSink {
        responses: Vec<Response<Bytes>>,
        raw: Option<DuplexStream>,
        hijacked: bool,
    }

    impl RecordingSink {
        fn new(raw: Option<DuplexStream>) -> Self {
            Self {
                responses: Vec::new(),
                raw,
                hijacked: false,
            }
        }
    }

    #[async_trait]
    impl ClientSink for RecordingSink {
        type Raw = DuplexStream;

        async fn send_response(&mut self, response: Response<Bytes>) -> Result<(), ProxyError> {
            self.responses.push(response);
            Ok(())
        }

        fn hijack(&mut self) -> Result<DuplexStream, ProxyError> {
            self.hijacked = true;
            self.raw.take().ok_or(ProxyError::HijackUnsupported)
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            remote_addr: "127.0.0.1:50000".parse().unwrap(),
            secure: false,
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn test_state_transitions() {
        use TunnelState::*;
        assert!(Authorizing.can_advance_to(Dialing));
        assert!(Tunneling.can_advance_to(Closed));
        assert!(Dialing.can_advance_to(Error));
        assert!(!Authorizing.can_advance_to(Tunneling));
        assert!(!Closed.can_advance_to(Error));
        assert!(!Error.can_advance_to(Dialing));

        let mut progress = TunnelProgress::new("example.com:443");
        assert_eq!(progress.state(), Authorizing);
        assert_eq!(progress.advance(Hijacking), Authorizing);
        assert_eq!(progress.advance(Error), Error);
        assert_eq!(progress.advance(Dialing), Error);
    }

    #[tokio::test]
    async fn test_failed_authorization_never_dials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target: Uri = listener.local_addr().unwrap().to_string().parse().unwrap();
        let tunnel = TunnelEstablisher::new(Duration::from_secs(2));

        let mut progress = TunnelProgress::new("denied");
        progress.advance(TunnelState::Error);
        let mut sink = RecordingSink::new(None);
        let state = tunnel.establish(progress, &target, &client(), &mut sink).await;

        assert_eq!(state, TunnelState::Error);
        assert!(sink.responses.is_empty());
        assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());
    }

    #[test]
    fn test_connect_target() {
        let uri: Uri = "example.com:443".parse().unwrap();
        assert_eq!(connect_target(&uri).unwrap(), "example.com:443");

        let no_port: Uri = "example.com".parse().unwrap();
        assert!(matches!(connect_target(&no_port), Err(ProxyError::ProtocolViolation(_))));

        let path: Uri = "/index.html".parse().unwrap();
        assert!(connect_target(&path).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_target_is_bad_gateway_without_hijack() {
        let tunnel = TunnelEstablisher::new(Duration::from_secs(2));
        let target: Uri = format!("127.0.0.1:{}", closed_port().await).parse().unwrap();
        let (raw, _peer) = duplex(64);
        let mut sink = RecordingSink::new(Some(raw));

        let state = tunnel.establish(TunnelProgress::new("test"), &target, &client(), &mut sink).await;
        assert_eq!(state, TunnelState::Error);
        assert!(!sink.hijacked);
        assert_eq!(sink.responses.len(), 1);
        assert_eq!(sink.responses[0].status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_hijack_refusal_is_internal_error_and_closes_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target: Uri = listener.local_addr().unwrap().to_string().parse().unwrap();
        let tunnel = TunnelEstablisher::new(Duration::from_secs(2));
        let mut sink = RecordingSink::new(None);

        let state = tunnel.establish(TunnelProgress::new("test"), &target, &client(), &mut sink).await;
        assert_eq!(state, TunnelState::Error);
        assert_eq!(sink.responses[0].status(), StatusCode::INTERNAL_SERVER_ERROR);

        // The dialed upstream was dropped: the target sees EOF.
        let (mut upstream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let read = timeout(Duration::from_secs(2), upstream.read_to_end(&mut buf))
            .await
            .expect("upstream must be closed")
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_established_line_precedes_tunnel_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target: Uri = listener.local_addr().unwrap().to_string().parse().unwrap();
        let origin = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"banner").await.unwrap();
        });

        let (raw, mut peer) = duplex(1024);
        let tunnel = TunnelEstablisher::new(Duration::from_secs(2));
        let handle = tokio::spawn(async move {
            let mut sink = RecordingSink::new(Some(raw));
            let state = tunnel.establish(TunnelProgress::new("test"), &target, &client(), &mut sink).await;
            (state, sink.responses.len())
        });

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        let mut expected = CONNECTION_ESTABLISHED.to_vec();
        expected.extend_from_slice(b"banner");
        assert_eq!(received, expected);

        let (state, responses) = handle.await.unwrap();
        assert_eq!(state, TunnelState::Closed);
        assert_eq!(responses, 0);
        origin.await.unwrap();
    }
}
