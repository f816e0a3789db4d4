use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use redirection_core::{AuthType, RedirectionKind};

use crate::negotiator::{default_auth_order, sanitize_auth_order, NegotiatorConfig};

/// What `open` does when the endpoint already has a registered session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ExistingSessionPolicy {
    /// Fail with `AlreadyActive`.
    #[default]
    Reject,
    /// Hand back the handle of the registered session.
    Adopt,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bounds connect plus the whole handshake.
    pub handshake_timeout: Duration,
    /// Bounds each awaited handshake reply.
    pub response_timeout: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub kind: RedirectionKind,
    pub auth_order: Vec<AuthType>,
    pub existing_session: ExistingSessionPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            kind: RedirectionKind::Sol,
            auth_order: default_auth_order(),
            existing_session: ExistingSessionPolicy::Reject,
        }
    }
}

impl ServiceConfig {
    pub fn negotiator(&self) -> NegotiatorConfig {
        NegotiatorConfig {
            kind: self.kind,
            auth_order: sanitize_auth_order(&self.auth_order),
            response_timeout: self.response_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub directory: PathBuf,
    pub shutdown_grace: Duration,
    pub service: ServiceConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "redirection-server",
    author,
    version,
    about = "Brokers redirection sessions to out-of-band management controllers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address the admin HTTP surface binds to.
    #[arg(
        long,
        global = true,
        env = "REDIRECTION_LISTEN_ADDR",
        default_value = "127.0.0.1:9480"
    )]
    pub listen_addr: String,

    /// TOML file listing the managed endpoints.
    #[arg(
        long,
        global = true,
        env = "REDIRECTION_DIRECTORY",
        default_value = "endpoints.toml"
    )]
    pub directory: PathBuf,

    /// Grace period applied during shutdown.
    #[arg(long, global = true, env = "REDIRECTION_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Upper bound on connect plus handshake.
    #[arg(
        long,
        global = true,
        env = "REDIRECTION_HANDSHAKE_TIMEOUT_SECS",
        default_value_t = 10
    )]
    pub handshake_timeout_secs: u64,

    /// Upper bound on each handshake reply.
    #[arg(
        long,
        global = true,
        env = "REDIRECTION_RESPONSE_TIMEOUT_SECS",
        default_value_t = 5
    )]
    pub response_timeout_secs: u64,

    /// Sessions without traffic for this long are closed.
    #[arg(long, global = true, env = "REDIRECTION_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub idle_timeout_secs: u64,

    #[arg(long, global = true, env = "REDIRECTION_REAP_INTERVAL_SECS", default_value_t = 30)]
    pub reap_interval_secs: u64,

    /// Redirection kind requested from the endpoint (sol, kvm, ider).
    #[arg(long, global = true, env = "REDIRECTION_KIND", default_value = "sol")]
    pub kind: RedirectionKind,

    /// Authentication types to try, in order of preference.
    #[arg(
        long,
        global = true,
        env = "REDIRECTION_AUTH_ORDER",
        value_delimiter = ',',
        default_values_t = default_auth_order()
    )]
    pub auth_order: Vec<AuthType>,

    /// What to do when an endpoint already has a session.
    #[arg(
        long,
        global = true,
        env = "REDIRECTION_EXISTING_SESSION",
        value_enum,
        default_value_t = ExistingSessionPolicy::Reject
    )]
    pub existing_session: ExistingSessionPolicy,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Serve the admin surface and keep sessions alive until interrupted.
    Serve,
    /// Open one session, print its handle and close it again.
    Probe {
        #[arg(long)]
        endpoint: String,
        /// Seconds to read redirection traffic before closing.
        #[arg(long, default_value_t = 0)]
        hold_secs: u64,
    },
}

impl TryFrom<&Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        for (name, secs) in [
            ("handshake timeout", cli.handshake_timeout_secs),
            ("response timeout", cli.response_timeout_secs),
            ("idle timeout", cli.idle_timeout_secs),
            ("reap interval", cli.reap_interval_secs),
        ] {
            if secs == 0 {
                bail!("{name} must be at least one second");
            }
        }

        if sanitize_auth_order(&cli.auth_order).is_empty() {
            bail!("auth order must name at least one of query, user-pass or digest");
        }

        Ok(ServerConfig {
            listen_addr,
            directory: cli.directory.clone(),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            service: ServiceConfig {
                handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
                response_timeout: Duration::from_secs(cli.response_timeout_secs),
                idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
                reap_interval: Duration::from_secs(cli.reap_interval_secs),
                kind: cli.kind,
                auth_order: cli.auth_order.clone(),
                existing_session: cli.existing_session,
            },
        })
    }
}
