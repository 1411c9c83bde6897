//! Raw client transport: request-head reading and hijackable connections.
//!
//! The front-end reads each request head itself so that a CONNECT can take
//! over the socket before any HTTP framing layer owns it. Bytes that were
//! read but not consumed are replayed to whoever takes the transport next.

use crate::error::ProxyError;
use crate::response::{encode_response, error_response};
use crate::tunnel::ClientSink;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use hyper::{Method, Request, Response, Version};
use log::debug;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const MAX_HEADERS: usize = 100;

/// Who is on the other end of an inbound connection.
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub remote_addr: SocketAddr,
    /// The inbound connection is TLS.
    pub secure: bool,
}

/// A parsed request head and its length on the wire.
#[derive(Debug)]
pub struct RequestHead {
    pub request: Request<()>,
    pub len: usize,
}

/// Parses a complete request head out of `buf`. `Ok(None)` means more
/// bytes are needed.
pub fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(ProxyError::ProtocolViolation(format!("invalid request head: {}", e)));
        }
    };

    let method = parsed
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| ProxyError::ProtocolViolation("invalid method".to_string()))?;
    let target = parsed
        .path
        .ok_or_else(|| ProxyError::ProtocolViolation("missing request target".to_string()))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Request::builder().method(method).uri(target).version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let request = builder
        .body(())
        .map_err(|e| ProxyError::ProtocolViolation(e.to_string()))?;

    Ok(Some(RequestHead { request, len }))
}

/// An inbound connection before anything has claimed its transport.
pub struct ClientConnection<S> {
    stream: S,
    buffer: BytesMut,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Reads until a full request head is buffered. The head stays in the
    /// buffer until `consume` is called. `Ok(None)` on a clean close
    /// between requests.
    pub async fn read_head(&mut self, max_head_size: usize) -> Result<Option<RequestHead>, ProxyError> {
        loop {
            if !self.buffer.is_empty() {
                if let Some(head) = parse_head(&self.buffer)? {
                    return Ok(Some(head));
                }
                if self.buffer.len() >= max_head_size {
                    return Err(ProxyError::HeadTooLarge(max_head_size));
                }
            }

            let read = self.stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(ProxyError::ProtocolViolation(
                        "connection closed in the middle of a request head".to_string(),
                    ))
                };
            }
        }
    }

    /// Drops `len` buffered bytes, normally the head just handled.
    pub fn consume(&mut self, len: usize) {
        self.buffer.advance(len.min(self.buffer.len()));
    }

    pub async fn write_response(&mut self, response: &Response<Bytes>) -> io::Result<()> {
        self.stream.write_all(&encode_response(response)).await?;
        self.stream.flush().await
    }

    /// Best-effort error reply before the connection is dropped.
    pub async fn reject(mut self, error: &ProxyError) {
        let mut response = error_response(error);
        response
            .headers_mut()
            .insert(hyper::header::CONNECTION, hyper::header::HeaderValue::from_static("close"));
        if let Err(e) = self.write_response(&response).await {
            debug!("Failed to write {} reply: {}", response.status(), e);
        }
        let _ = self.stream.shutdown().await;
    }

    /// The transport with every unconsumed byte replayed first.
    pub fn into_io(self) -> PrefixedIo<S> {
        PrefixedIo::new(self.buffer.freeze(), self.stream)
    }
}

/// Yields `prefix` before reading from `inner`. Writes go straight through.
pub struct PrefixedIo<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedIo<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedIo<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedIo<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Sink over a raw client connection. Supports hijacking; after a
/// non-hijacking exchange the connection is handed back for the next
/// request.
pub struct RawClientSink<S> {
    conn: Option<ClientConnection<S>>,
}

impl<S> RawClientSink<S> {
    pub fn new(conn: ClientConnection<S>) -> Self {
        Self { conn: Some(conn) }
    }

    /// `None` once the transport has been hijacked.
    pub fn into_connection(self) -> Option<ClientConnection<S>> {
        self.conn
    }
}

#[async_trait]
impl<S> ClientSink for RawClientSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Raw = PrefixedIo<S>;

    async fn send_response(&mut self, response: Response<Bytes>) -> Result<(), ProxyError> {
        let conn = self.conn.as_mut().ok_or(ProxyError::HijackUnsupported)?;
        conn.write_response(&response).await?;
        Ok(())
    }

    fn hijack(&mut self) -> Result<Self::Raw, ProxyError> {
        self.conn
            .take()
            .map(ClientConnection::into_io)
            .ok_or(ProxyError::HijackUnsupported)
    }
}
