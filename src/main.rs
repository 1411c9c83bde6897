use clap::Parser;
use gatekeep_proxy::config::{ConfigFile, DEFAULT_CONFIG_FILE, LogFormat, LogLevel};
use gatekeep_proxy::logging::{self, parse_log_format, parse_log_level};
use gatekeep_proxy::{ProxyConfig, ProxyServer};
use log::{error, info, warn};
use tokio::signal;

#[derive(Parser)]
#[clap(
    version = "0.1.0",
    about = "An authenticating HTTP/HTTPS forward proxy with CONNECT tunneling"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path (default: proxy_config.json)")]
    config: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address, e.g. :61055 or 127.0.0.1:8080")]
    listen: Option<String>,

    #[clap(short, long, value_name = "USERNAME", help = "Username for proxy authentication (Basic Auth)")]
    username: Option<String>,

    #[clap(short, long, value_name = "PASSWORD", help = "Password for proxy authentication (Basic Auth)")]
    password: Option<String>,

    #[clap(short, long, value_name = "SECONDS", help = "Dial, exchange and tunnel timeout in seconds")]
    timeout: Option<i64>,

    #[clap(long, value_name = "FILE", help = "Private key file path for HTTPS")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for HTTPS")]
    certificate: Option<String>,

    #[clap(long, value_name = "BYTES", help = "Maximum request head size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "LEVEL", value_parser = parse_log_level, help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<LogLevel>,

    #[clap(long, value_name = "FORMAT", value_parser = parse_log_format, help = "Log format: text or json")]
    log_format: Option<LogFormat>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

impl Args {
    fn overrides(&self) -> ConfigFile {
        ConfigFile {
            port: self.listen.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            timeout_seconds: self.timeout,
            private_key: self.private_key.clone(),
            certificate: self.certificate.clone(),
            max_header_size: self.max_header_size,
            logging: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        ConfigFile::sample().to_file(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    // The file may configure logging, so it is read before any log line.
    let config_path = args.config.clone().unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let (file, source) = ConfigFile::load(&config_path);
    let file = file.overlay(args.overrides());

    logging::init(file.logging.clone(), args.log_level, args.log_format)?;
    source.log();

    let config = file.merge_onto(&ProxyConfig::default());
    if config.private_key.is_some() != config.certificate.is_some() {
        warn!("TLS needs both private_key and certificate; serving plain HTTP");
    }

    info!("Starting proxy server...");
    let server = ProxyServer::new(config);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        result = server_handle => {
            if let Err(e) = result {
                error!("Server task error: {}", e);
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}
