//! CONNECT on a connection hyper already serves. The success line goes out
//! as hyper's response to the request; the transport is handed back through
//! hyper's upgrade machinery once that response is written.

use crate::error::ProxyError;
use crate::tunnel::ClientSink;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::Response;
use hyper::ext::ReasonPhrase;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

/// Serialized by hyper as exactly `HTTP/1.1 200 Connection Established`
/// followed by a blank line, provided the automatic date header is off.
pub fn established_response() -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Sink for a CONNECT served by hyper. The single reply travels back to the
/// request handler over a oneshot channel.
pub struct UpgradeSink {
    on_upgrade: Option<OnUpgrade>,
    reply: Option<oneshot::Sender<Response<Bytes>>>,
}

impl UpgradeSink {
    pub fn new(on_upgrade: OnUpgrade) -> (Self, oneshot::Receiver<Response<Bytes>>) {
        let (tx, rx) = oneshot::channel();
        let sink = Self {
            on_upgrade: Some(on_upgrade),
            reply: Some(tx),
        };
        (sink, rx)
    }

    fn reply(&mut self, response: Response<Bytes>) -> Result<(), ProxyError> {
        let reply = self.reply.take().ok_or(ProxyError::ClientGone)?;
        reply.send(response).map_err(|_| ProxyError::ClientGone)
    }
}

#[async_trait]
impl ClientSink for UpgradeSink {
    type Raw = UpgradedClient;

    async fn send_response(&mut self, response: Response<Bytes>) -> Result<(), ProxyError> {
        self.reply(response)
    }

    fn hijack(&mut self) -> Result<UpgradedClient, ProxyError> {
        let on_upgrade = self.on_upgrade.take().ok_or(ProxyError::HijackUnsupported)?;
        self.reply(established_response())?;
        Ok(UpgradedClient::new(on_upgrade))
    }

    /// hyper wrote the success line as the response.
    async fn acknowledge(&mut self, _raw: &mut UpgradedClient) -> io::Result<()> {
        Ok(())
    }
}

/// The client transport after the upgrade. I/O waits for hyper to release
/// the connection first.
pub struct UpgradedClient {
    pending: Option<OnUpgrade>,
    io: Option<TokioIo<Upgraded>>,
}

impl UpgradedClient {
    pub fn new(on_upgrade: OnUpgrade) -> Self {
        Self {
            pending: Some(on_upgrade),
            io: None,
        }
    }

    fn poll_io(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<&mut TokioIo<Upgraded>>> {
        if let Some(on_upgrade) = self.pending.as_mut() {
            let result = ready!(Pin::new(on_upgrade).poll(cx));
            self.pending = None;
            self.io = Some(TokioIo::new(result.map_err(io::Error::other)?));
        }
        Poll::Ready(
            self.io
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection upgrade failed")),
        )
    }
}

impl AsyncRead for UpgradedClient {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let io = ready!(self.get_mut().poll_io(cx))?;
        Pin::new(io).poll_read(cx, buf)
    }
}

impl AsyncWrite for UpgradedClient {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let io = ready!(self.get_mut().poll_io(cx))?;
        Pin::new(io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let io = ready!(self.get_mut().poll_io(cx))?;
        Pin::new(io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let io = ready!(self.get_mut().poll_io(cx))?;
        Pin::new(io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientInfo;
    use crate::tunnel::{TunnelEstablisher, TunnelProgress, TunnelState};
    use hyper::{Request, StatusCode, Uri};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn client() -> ClientInfo {
        ClientInfo {
            remote_addr: "127.0.0.1:45000".parse().unwrap(),
            secure: false,
        }
    }

    /// A request hyper never marked as upgradable.
    fn no_upgrade() -> OnUpgrade {
        hyper::upgrade::on(&mut Request::new(()))
    }

    #[test]
    fn test_established_response_shape() {
        let response = established_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().is_empty());
        assert!(response.body().is_empty());
        let reason = response.extensions().get::<ReasonPhrase>().unwrap();
        assert_eq!(reason.as_bytes(), b"Connection Established");
    }

    #[tokio::test]
    async fn test_unreachable_target_replies_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target: Uri = listener.local_addr().unwrap().to_string().parse().unwrap();
        drop(listener);

        let (mut sink, reply) = UpgradeSink::new(no_upgrade());
        let tunnel = TunnelEstablisher::new(Duration::from_secs(2));
        let state = tunnel.establish(TunnelProgress::new("test"), &target, &client(), &mut sink).await;

        assert_eq!(state, TunnelState::Error);
        assert_eq!(reply.await.unwrap().status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_hijack_replies_established_and_releases_upstream_when_upgrade_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target: Uri = listener.local_addr().unwrap().to_string().parse().unwrap();

        let (mut sink, reply) = UpgradeSink::new(no_upgrade());
        let tunnel = TunnelEstablisher::new(Duration::from_secs(2));
        let state = tunnel.establish(TunnelProgress::new("test"), &target, &client(), &mut sink).await;

        // The upgrade never completes, so the relay ends at once.
        assert_eq!(state, TunnelState::Closed);
        let response = reply.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.extensions().get::<ReasonPhrase>().is_some());

        let (mut upstream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), upstream.read_to_end(&mut buf))
            .await
            .expect("upstream must be closed")
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_second_reply_is_refused() {
        let (mut sink, reply) = UpgradeSink::new(no_upgrade());
        sink.send_response(established_response()).await.unwrap();
        assert!(matches!(
            sink.send_response(established_response()).await,
            Err(ProxyError::ClientGone)
        ));
        drop(reply);
    }
}
