//! Sunnel - expose a service behind NAT through a relay
//!
//! Listens on a private relay port for tunneling agents and on a public service port
//! for clients, and splices each client to a waiting agent.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sunnel_server_tcp::{
    RelayConfig, RelayServer, TlsIdentity, TlsIdentityConfig, TlsMode, DEFAULT_RELAY_PORT,
};

const LONG_VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Sunnel - reverse TCP/TLS tunnel server
#[derive(Parser, Debug)]
#[command(name = "sunnel")]
#[command(about = "Start a sunnel server")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Port relay agents connect to
    #[arg(short, long, env = "SUNNEL_RELAY_PORT", default_value_t = DEFAULT_RELAY_PORT)]
    relay_port: u16,

    /// Public port clients connect to
    #[arg(short, long, env = "SUNNEL_SERVICE_PORT")]
    service_port: u16,

    /// Name or IP address to bind both listeners to (all interfaces by default)
    #[arg(short = 'H', long, env = "SUNNEL_HOSTNAME")]
    hostname: Option<String>,

    /// Secret relay agents must send before anything else
    #[arg(short = 'k', long, env = "SUNNEL_SECRET")]
    secret: Option<String>,

    /// Use TLS on the relay listener, or on both listeners with `--tls both`
    #[arg(
        short,
        long,
        env = "SUNNEL_TLS",
        value_enum,
        num_args = 0..=1,
        default_missing_value = "relay"
    )]
    tls: Option<TlsArg>,

    /// PEM file with the certificate chain (may also contain the key)
    #[arg(short = 'c', long, env = "SUNNEL_CERT", default_value = "cert.pem")]
    cert: PathBuf,

    /// PEM file with the private key (defaults to the certificate file)
    #[arg(long, env = "SUNNEL_KEY")]
    key: Option<PathBuf>,

    /// Passphrase for the private key (encrypted keys are unsupported and fail startup)
    #[arg(short, long, env = "SUNNEL_PASSPHRASE")]
    passphrase: Option<String>,

    /// Generate an ephemeral self-signed certificate instead of reading one
    #[arg(long)]
    self_signed: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TlsArg {
    /// Secure the relay listener only
    Relay,
    /// Secure the relay and the service listener
    Both,
}

impl Cli {
    fn relay_config(&self) -> RelayConfig {
        let mut config = RelayConfig::new(self.relay_port, self.service_port);

        if let Some(hostname) = &self.hostname {
            config = config.with_hostname(hostname.clone());
        }
        if let Some(secret) = &self.secret {
            config = config.with_secret(secret.clone());
        }

        let mode = match self.tls {
            None => TlsMode::Off,
            Some(TlsArg::Relay) => TlsMode::Relay,
            Some(TlsArg::Both) => TlsMode::Both,
        };
        if mode != TlsMode::Off {
            let identity = if self.self_signed {
                TlsIdentity::SelfSigned
            } else {
                let mut files = TlsIdentityConfig::new(&self.cert);
                if let Some(key) = &self.key {
                    files = files.with_key_path(key);
                }
                if let Some(passphrase) = &self.passphrase {
                    files = files.with_passphrase(passphrase.clone());
                }
                TlsIdentity::Files(files)
            };
            config = config.with_tls(mode, identity);
        }

        config
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Resolves on Ctrl+C, or SIGTERM where available
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    info!("Sunnel {} starting...", LONG_VERSION);

    let config = cli.relay_config();
    if config.secret.is_none() {
        warn!("No secret configured: any client of the relay port can take over the tunnel");
    }

    let server = RelayServer::start(config)
        .await
        .context("Failed to start relay")?;
    info!("Relay port: {}", server.relay_addr());
    info!("Service port: {}", server.service_addr());

    let signal = shutdown_signal().await;
    server.shutdown().await;
    signal?;

    info!("Sunnel stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sunnel").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--service-port", "9001"]);
        assert_eq!(cli.relay_port, DEFAULT_RELAY_PORT);
        assert_eq!(cli.service_port, 9001);
        assert_eq!(cli.tls, None);
        assert_eq!(cli.cert, PathBuf::from("cert.pem"));

        let config = cli.relay_config();
        assert_eq!(config.tls, TlsMode::Off);
        assert!(config.tls_identity.is_none());
        assert!(config.secret.is_none());
        assert_eq!(config.bind_host(), "::");
    }

    #[test]
    fn test_service_port_is_required() {
        assert!(Cli::try_parse_from(["sunnel", "-r", "9000"]).is_err());
    }

    #[test]
    fn test_bare_tls_flag_secures_relay_only() {
        let cli = parse(&["-s", "9001", "-t"]);
        assert_eq!(cli.tls, Some(TlsArg::Relay));

        let config = cli.relay_config();
        assert_eq!(config.tls, TlsMode::Relay);
        assert_eq!(
            config.tls_identity,
            Some(TlsIdentity::Files(TlsIdentityConfig::new("cert.pem")))
        );
    }

    #[test]
    fn test_tls_both_with_key_file() {
        let cli = parse(&[
            "-s", "443", "--tls", "both", "-c", "chain.pem", "--key", "key.pem", "-p", "abcd",
        ]);
        let config = cli.relay_config();
        assert_eq!(config.tls, TlsMode::Both);
        assert_eq!(
            config.tls_identity,
            Some(TlsIdentity::Files(
                TlsIdentityConfig::new("chain.pem")
                    .with_key_path("key.pem")
                    .with_passphrase("abcd")
            ))
        );
    }

    #[test]
    fn test_passphrase_fails_tls_setup() {
        let cli = parse(&["-s", "9001", "-t", "-c", "/nonexistent/cert.pem", "-p", "abcd"]);
        let err = cli.relay_config().endpoint_configs().unwrap_err();
        assert!(err.to_string().contains("Passphrase-protected keys are not supported"));
    }

    #[test]
    fn test_self_signed_and_secret() {
        let cli = parse(&[
            "-r", "7000", "-s", "7001", "-H", "127.0.0.1", "-k", "k1", "-t", "--self-signed",
        ]);
        let config = cli.relay_config();
        assert_eq!(config.relay_port, 7000);
        assert_eq!(config.bind_host(), "127.0.0.1");
        assert_eq!(config.secret.as_deref(), Some("k1"));
        assert_eq!(config.tls_identity, Some(TlsIdentity::SelfSigned));
    }
}
