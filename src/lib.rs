pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod relay;
pub mod response;
pub mod server;
pub mod tunnel;
pub mod upgrade;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use server::ProxyServer;
