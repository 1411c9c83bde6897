//! The authorization gate and method router. Nothing reaches an upstream
//! without passing `Dispatcher::authorize` first.

use crate::auth::Credentials;
use crate::config::ProxyConfig;
use crate::connection::ClientInfo;
use crate::error::ProxyError;
use crate::forwarder::HttpForwarder;
use crate::response::{ProxyBody, error_response, full, proxy_auth_required};
use crate::tunnel::{ClientSink, TunnelEstablisher, TunnelProgress, TunnelState};
use crate::upgrade::UpgradeSink;
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response};
use log::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tunnel,
    Forward,
}

impl Route {
    pub fn for_method(method: &Method) -> Self {
        if *method == Method::CONNECT {
            Route::Tunnel
        } else {
            Route::Forward
        }
    }
}

pub struct Dispatcher {
    credentials: Credentials,
    forwarder: HttpForwarder,
    tunnel: TunnelEstablisher,
}

impl Dispatcher {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            credentials: Credentials::new(config.username.clone(), config.password.clone()),
            forwarder: HttpForwarder::new(config.timeout),
            tunnel: TunnelEstablisher::new(config.timeout),
        }
    }

    pub fn authorize(&self, headers: &HeaderMap, client: &ClientInfo) -> Result<(), ProxyError> {
        self.credentials.verify_headers(headers).map_err(|reason| {
            info!("Authentication failed for {}", client.remote_addr);
            debug!("Authentication failure reason for {}: {}", client.remote_addr, reason);
            ProxyError::AuthRejected
        })
    }

    /// Requests arriving through a hyper-served connection. A CONNECT here
    /// is tunneled through hyper's upgrade once its reply is written.
    pub async fn handle(&self, req: Request<Incoming>, client: ClientInfo) -> Response<ProxyBody> {
        if self.authorize(req.headers(), &client).is_err() {
            return proxy_auth_required().map(full);
        }

        match Route::for_method(req.method()) {
            Route::Forward => self.forwarder.forward(req, &client).await,
            Route::Tunnel => self.tunnel_upgraded(req, client).await,
        }
    }

    /// The tunnel outlives this request, so it runs on its own task and
    /// only its first reply comes back here.
    async fn tunnel_upgraded(&self, mut req: Request<Incoming>, client: ClientInfo) -> Response<ProxyBody> {
        let (mut sink, reply) = UpgradeSink::new(hyper::upgrade::on(&mut req));
        let target = req.uri().clone();
        let tunnel = self.tunnel;

        tokio::spawn(async move {
            let progress = TunnelProgress::new(target.to_string());
            let state = tunnel.establish(progress, &target, &client, &mut sink).await;
            debug!("CONNECT {} from {} ended in state {}", target, client.remote_addr, state);
        });

        match reply.await {
            Ok(response) => response.map(full),
            Err(_) => error_response(&ProxyError::ClientGone).map(full),
        }
    }

    /// CONNECT requests read straight off the raw client transport.
    pub async fn dispatch_connect<K: ClientSink>(&self, head: &Request<()>, client: &ClientInfo, sink: &mut K) -> TunnelState {
        let mut progress = TunnelProgress::new(head.uri().to_string());

        if Route::for_method(head.method()) != Route::Tunnel {
            let error = ProxyError::ProtocolViolation(format!("{} on the tunnel path", head.method()));
            let _ = sink.send_response(error_response(&error)).await;
            return progress.advance(TunnelState::Error);
        }

        if let Err(e) = self.authorize(head.headers(), client) {
            if let Err(write_err) = sink.send_response(error_response(&e)).await {
                debug!("Failed to send 407 to {}: {}", client.remote_addr, write_err);
            }
            return progress.advance(TunnelState::Error);
        }

        self.tunnel.establish(progress, head.uri(), client, sink).await
    }
}
