//! Plain HTTP relay: re-issues the client's request against the origin and
//! streams the origin's response back unchanged.

use crate::connection::ClientInfo;
use crate::error::ProxyError;
use crate::response::{BoxError, ProxyBody, error_response, full};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{HOST, HeaderMap, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{info, warn};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep_until, timeout_at};
use url::Url;

/// Request headers that only concern the client-proxy hop.
pub const SKIPPED_HEADERS: [&str; 7] = [
    "Connection",
    "Proxy-Connection",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Te",
    "Trailers",
    "Upgrade",
];

pub fn should_skip_header(name: &str) -> bool {
    SKIPPED_HEADERS.iter().any(|skip| skip.eq_ignore_ascii_case(name))
}

/// Copies every header outside the skip set, keeping repeated values.
pub fn copy_request_headers(source: &HeaderMap, target: &mut HeaderMap) {
    for (name, value) in source {
        if !should_skip_header(name.as_str()) {
            target.append(name.clone(), value.clone());
        }
    }
}

/// Points `Host` at the target's authority, dropping any userinfo.
pub fn set_host_from_target(headers: &mut HeaderMap, target: &Uri) {
    let Some(authority) = target.authority() else {
        return;
    };
    let host = authority.as_str().rsplit('@').next().unwrap_or(authority.as_str());
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(HOST, value);
    }
}

/// Absolute targets are used verbatim; origin-form targets are rebuilt from
/// the Host header and the inbound transport's scheme.
pub fn resolve_target<B>(req: &Request<B>, secure: bool) -> Result<Uri, ProxyError> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .ok_or_else(|| ProxyError::ProtocolViolation("cannot determine target host".to_string()))?;

    let scheme = if secure { "https" } else { "http" };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let url = Url::parse(&format!("{}://{}{}", scheme, host, path_and_query))?;
    url.as_str()
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::ProtocolViolation(e.to_string()))
}

pub struct HttpForwarder {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(timeout));

        // Upstream connections are not pooled: each one lives for exactly
        // one relayed exchange.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(HttpsConnector::new_with_connector(http));

        Self { client, timeout }
    }

    /// Relays an authorized request. Failures before the origin answers
    /// become 400/502 replies; nothing is retried.
    pub async fn forward(&self, req: Request<Incoming>, client: &ClientInfo) -> Response<ProxyBody> {
        match self.try_forward(req, client).await {
            Ok(response) => response,
            Err(e) => {
                warn!("HTTP relay for {} failed: {}", client.remote_addr, e);
                error_response(&e).map(full)
            }
        }
    }

    async fn try_forward(&self, req: Request<Incoming>, client: &ClientInfo) -> Result<Response<ProxyBody>, ProxyError> {
        let target = resolve_target(&req, client.secure)?;
        let absolute_form = req.uri().scheme().is_some();
        info!("HTTP {} {} <- {}", req.method(), target, client.remote_addr);

        let (parts, body) = req.into_parts();
        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = target.clone();
        copy_request_headers(&parts.headers, outbound.headers_mut());
        // An absolute request URI names the origin, whatever Host says.
        if absolute_form {
            set_host_from_target(outbound.headers_mut(), &target);
        }

        let deadline = Instant::now() + self.timeout;
        let response = timeout_at(deadline, self.client.request(outbound))
            .await
            .map_err(|_| ProxyError::UpstreamUnreachable(format!("{} timed out after {:?}", target, self.timeout)))?
            .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

        info!("HTTP {} -> {}", target, response.status());

        // Status and headers are already on their way; a body failure can
        // only be logged.
        let label = target.to_string();
        let (parts, body) = response.into_parts();
        let body = DeadlineBody::new(body, deadline)
            .map_err(move |e| {
                warn!("Response body from {} aborted: {}", label, e);
                e
            })
            .boxed_unsync();

        Ok(Response::from_parts(parts, body))
    }
}

/// Ends the wrapped body with an error once the exchange deadline passes.
struct DeadlineBody<B> {
    inner: B,
    sleep: Pin<Box<Sleep>>,
}

impl<B> DeadlineBody<B> {
    fn new(inner: B, deadline: Instant) -> Self {
        Self {
            inner,
            sleep: Box::pin(sleep_until(deadline)),
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.sleep.as_mut().poll(cx).is_ready() {
            let elapsed = std::io::Error::new(std::io::ErrorKind::TimedOut, "exchange deadline exceeded");
            return Poll::Ready(Some(Err(Box::new(elapsed))));
        }
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::Method;

    #[test]
    fn test_skip_set_is_case_insensitive() {
        for name in ["connection", "CONNECTION", "Connection", "proxy-authorization", "TE", "trailers", "UpGrade"] {
            assert!(should_skip_header(name), "{} must be skipped", name);
        }
        for name in ["Host", "Accept", "Transfer-Encoding", "Keep-Alive", "Proxy-Foo"] {
            assert!(!should_skip_header(name), "{} must be kept", name);
        }
    }

    #[test]
    fn test_copy_request_headers() {
        let mut source = HeaderMap::new();
        source.insert("connection", HeaderValue::from_static("keep-alive"));
        source.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        source.insert("proxy-authorization", HeaderValue::from_static("Basic dTpw"));
        source.insert("upgrade", HeaderValue::from_static("websocket"));
        source.insert("host", HeaderValue::from_static("example.com"));
        source.append("accept", HeaderValue::from_static("text/html"));
        source.append("accept", HeaderValue::from_static("*/*"));

        let mut target = HeaderMap::new();
        copy_request_headers(&source, &mut target);

        assert_eq!(target.len(), 3);
        assert_eq!(target["host"], "example.com");
        let accept: Vec<_> = target.get_all("accept").iter().collect();
        assert_eq!(accept, vec!["text/html", "*/*"]);
        assert!(!target.contains_key("proxy-authorization"));
    }

    #[test]
    fn test_resolve_absolute_target_verbatim() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://example.com:8080/path?q=1")
            .header(HOST, "other.example")
            .body(())
            .unwrap();
        let target = resolve_target(&req, true).unwrap();
        assert_eq!(target.to_string(), "http://example.com:8080/path?q=1");
    }

    #[test]
    fn test_host_follows_absolute_target() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("other.example"));

        set_host_from_target(&mut headers, &"http://example.com:8080/path".parse().unwrap());
        assert_eq!(headers[HOST], "example.com:8080");

        set_host_from_target(&mut headers, &"http://user:pw@example.net/".parse().unwrap());
        assert_eq!(headers[HOST], "example.net");
        assert_eq!(headers.get_all(HOST).iter().count(), 1);
    }

    #[test]
    fn test_resolve_origin_form_target() {
        let req = Request::builder()
            .uri("/search?q=rust")
            .header(HOST, "example.com")
            .body(())
            .unwrap();
        assert_eq!(resolve_target(&req, false).unwrap().to_string(), "http://example.com/search?q=rust");
        assert_eq!(resolve_target(&req, true).unwrap().to_string(), "https://example.com/search?q=rust");
    }

    #[test]
    fn test_resolve_without_host_fails() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(matches!(resolve_target(&req, false), Err(ProxyError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_deadline_body_passes_frames_through() {
        let body = DeadlineBody::new(Full::new(Bytes::from_static(b"payload")), Instant::now() + Duration::from_secs(5));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"payload");
    }

    /// A body that never produces a frame.
    struct Stalled;

    impl Body for Stalled {
        type Data = Bytes;
        type Error = std::convert::Infallible;

        fn poll_frame(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_deadline_body_errors_after_deadline() {
        let body = DeadlineBody::new(Stalled, Instant::now() + Duration::from_millis(50));
        let result = tokio::time::timeout(Duration::from_secs(2), body.collect())
            .await
            .expect("deadline must end the body");
        assert!(result.is_err());
    }
}
