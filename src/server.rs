use crate::config::ProxyConfig;
use crate::connection::{ClientConnection, ClientInfo, RawClientSink};
use crate::dispatcher::{Dispatcher, Route};
use crate::error::ProxyError;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, info, warn};
use rustls::ServerConfig;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

/// Create TLS server configuration from certificate and private key files
pub fn create_tls_config(private_key_path: &str, cert_path: &str) -> Result<ServerConfig, ProxyError> {
    let mut private_key_file = BufReader::new(
        File::open(private_key_path)
            .map_err(|e| ProxyError::Tls(format!("Failed to open private key file: {}", e)))?,
    );

    let mut cert_file = BufReader::new(
        File::open(cert_path).map_err(|e| ProxyError::Tls(format!("Failed to open certificate file: {}", e)))?,
    );

    let certs = rustls_pemfile::certs(&mut cert_file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls("No valid certificate found".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut private_key_file)
        .map_err(|e| ProxyError::Tls(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Tls("No valid private key found".to_string()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| ProxyError::Tls(format!("Failed to create TLS config: {}", e)))
}

pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    dispatcher: Arc<Dispatcher>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(&config));
        Self {
            config: Arc::new(config),
            dispatcher,
        }
    }

    /// Binds the configured listen address and serves forever.
    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.config.listen_addr.as_str()).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener, one task per connection.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ProxyError> {
        let tls_acceptor = match self.config.tls_paths() {
            Some((key, cert)) => Some(TlsAcceptor::from(Arc::new(create_tls_config(key, cert)?))),
            None => None,
        };

        let local_addr = listener.local_addr()?;
        if tls_acceptor.is_some() {
            info!("HTTPS forward proxy listening on: https://{}", local_addr);
        } else {
            info!("HTTP forward proxy listening on: http://{}", local_addr);
        }
        info!("Proxy authentication enabled for user '{}'", self.config.username);
        debug!("Connection timeout: {:?}", self.config.timeout);

        loop {
            let (tcp_stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            debug!("New connection from {}", remote_addr);

            let config = self.config.clone();
            let dispatcher = self.dispatcher.clone();
            let tls_acceptor = tls_acceptor.clone();

            tokio::spawn(async move {
                match tls_acceptor {
                    Some(acceptor) => match timeout(config.timeout, acceptor.accept(tcp_stream)).await {
                        Ok(Ok(tls_stream)) => {
                            let client = ClientInfo { remote_addr, secure: true };
                            serve_client(tls_stream, client, config, dispatcher).await;
                        }
                        Ok(Err(e)) => warn!("Error establishing TLS connection from {}: {}", remote_addr, e),
                        Err(_) => warn!("TLS handshake from {} timed out", remote_addr),
                    },
                    None => {
                        let client = ClientInfo { remote_addr, secure: false };
                        serve_client(tcp_stream, client, config, dispatcher).await;
                    }
                }
                debug!("Connection from {} closed", remote_addr);
            });
        }
    }
}

/// Reads request heads off the raw transport. CONNECT is handled here
/// with the raw connection as sink; any other request hands the connection
/// to hyper, which keeps it for the rest of its life and upgrades any later
/// CONNECT into a tunnel.
pub async fn serve_client<S>(stream: S, client: ClientInfo, config: Arc<ProxyConfig>, dispatcher: Arc<Dispatcher>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = ClientConnection::new(stream);

    loop {
        let head = match timeout(config.timeout, conn.read_head(config.max_header_size)).await {
            Ok(Ok(Some(head))) => head,
            Ok(Ok(None)) => return,
            Ok(Err(ProxyError::Io(e))) => {
                debug!("Read error from {}: {}", client.remote_addr, e);
                return;
            }
            Ok(Err(e)) => {
                warn!("Malformed request from {}: {}", client.remote_addr, e);
                conn.reject(&e).await;
                return;
            }
            Err(_) => {
                debug!("Timed out waiting for a request from {}", client.remote_addr);
                return;
            }
        };

        match Route::for_method(head.request.method()) {
            Route::Tunnel => {
                conn.consume(head.len);
                let mut sink = RawClientSink::new(conn);
                let state = dispatcher.dispatch_connect(&head.request, &client, &mut sink).await;
                debug!("CONNECT from {} ended in state {}", client.remote_addr, state);

                match sink.into_connection() {
                    Some(next) => conn = next,
                    None => return,
                }
            }
            Route::Forward => {
                let io = TokioIo::new(conn.into_io());
                let service = service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    async move { Ok::<_, Infallible>(dispatcher.handle(req, client).await) }
                });

                if let Err(e) = ServerBuilder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(config.timeout)
                    .keep_alive(true)
                    .auto_date_header(false)
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("Error serving HTTP connection from {}: {}", client.remote_addr, e);
                }
                return;
            }
        }
    }
}
