use std::{error::Error, path::PathBuf, sync::Arc};

use clap::Parser;
use sd_notify::NotifyState;
use smtp_relay_utils::{
    error_chain, load_config, Config, ConfigError, ConfigOverrides, MessageIdGenerator,
    RelayHandler, SmtpServer, SmtpUpstream, TlsMode,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Lightweight local SMTP relay that forwards incoming messages to an
/// authenticated upstream SMTP server.
#[derive(Parser, Debug)]
#[command(name = "smtp-relay", author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML), ignored when missing
    #[arg(long, env = "SMTP_RELAY_CONFIG", default_value = "/etc/smtp-relay.toml")]
    config: PathBuf,

    /// Address/interface to bind the local SMTP listener to (e.g. 0.0.0.0, 127.0.0.1)
    #[arg(long, env = "SMTP_RELAY_LISTEN_ADDRESS")]
    listen_address: Option<String>,

    /// Port to listen on for the local SMTP server
    #[arg(long, env = "SMTP_RELAY_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Hostname or IP of the upstream SMTP server to relay to
    #[arg(long, env = "SMTP_RELAY_UPSTREAM_HOST")]
    upstream_host: Option<String>,

    /// Port of the upstream SMTP server (e.g. 587)
    #[arg(long, env = "SMTP_RELAY_UPSTREAM_PORT")]
    upstream_port: Option<u16>,

    /// Username for authenticating to the upstream SMTP server
    #[arg(long, env = "SMTP_RELAY_UPSTREAM_USER")]
    upstream_user: Option<String>,

    /// Password for authenticating to the upstream SMTP server
    #[arg(long, env = "SMTP_RELAY_UPSTREAM_PASSWORD", hide_env_values = true)]
    upstream_password: Option<String>,

    /// Upstream TLS mode: starttls, implicit, opportunistic or none
    #[arg(long, env = "SMTP_RELAY_UPSTREAM_TLS")]
    upstream_tls: Option<TlsMode>,

    /// Overwrite the envelope sender address of relayed messages
    #[arg(long, env = "SMTP_RELAY_OVERWRITE_SENDER")]
    overwrite_sender: Option<String>,

    /// Log level, `RUST_LOG` takes precedence when set
    #[arg(long, env = "SMTP_RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            listen_address: self.listen_address.clone(),
            listen_port: self.listen_port,
            upstream_host: self.upstream_host.clone(),
            upstream_port: self.upstream_port,
            upstream_user: self.upstream_user.clone(),
            upstream_password: self.upstream_password.clone(),
            upstream_tls: self.upstream_tls,
            overwrite_sender: self.overwrite_sender.clone(),
        }
    }
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Loads the configuration file, applies flag and environment overrides
/// and validates the result.
fn resolve_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = load_config(&args.config)?;
    config.apply_overrides(args.overrides());
    config.validate()?;
    Ok(config)
}

/// Tells systemd about a state change, a no-op outside of systemd.
fn notify(state: NotifyState) {
    if let Err(e) = sd_notify::notify(false, &[state]) {
        warn!(error = %e, "Failed to notify systemd");
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&args)?;

    info!(
        listen = %config.listen_addr(),
        upstream = %format!("{}:{}", config.upstream.host, config.upstream.port),
        tls = %config.upstream.tls,
        auth = config.upstream.has_auth(),
        "Starting SMTP relay"
    );
    if config.upstream.has_auth() {
        info!(username = %config.upstream.user, "Using upstream authentication");
    }

    let upstream = Arc::new(SmtpUpstream::new(&config.upstream)?);
    let message_ids = MessageIdGenerator::new(config.listen.hostname.clone());
    let handler = Arc::new(
        RelayHandler::new(upstream, message_ids).with_sender_overwrite(config.overwrite_sender()),
    );

    let server = SmtpServer::bind(&config.listen, handler).await?;
    info!(address = %server.local_addr()?, "SMTP relay ready");
    notify(NotifyState::Ready);

    tokio::select! {
        result = server.serve() => result?,
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping");
            notify(NotifyState::Stopping);
        }
    }

    Ok(())
}

/// Main function for the SMTP relay.
///
/// Resolves the configuration, builds the upstream sender and the relay
/// handler, then serves the local listener until it fails or a shutdown
/// signal arrives.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    setup_logging(&args.log_level);

    if let Err(e) = run(args).await {
        error!(error = %error_chain(&*e), "SMTP relay failed");
        notify(NotifyState::Stopping);
        return Err(e);
    }
    Ok(())
}
