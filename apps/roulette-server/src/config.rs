use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use clap::Parser;

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Parser)]
#[command(
    name = "roulette-server",
    author,
    version,
    about = "Pairs anonymous clients and relays their media negotiation"
)]
pub struct Cli {
    /// Port the websocket listener binds to.
    #[arg(long, env = "ROULETTE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface address to bind.
    #[arg(long, env = "ROULETTE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Close sessions that wait longer than this for a partner. Unset means
    /// sessions may wait forever.
    #[arg(long, env = "ROULETTE_MATCH_TIMEOUT_SECS")]
    pub match_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub match_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            match_timeout: None,
        }
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let ip: IpAddr = cli
            .host
            .parse()
            .with_context(|| format!("invalid host address: {}", cli.host))?;
        let match_timeout = match cli.match_timeout_secs {
            Some(0) => anyhow::bail!("--match-timeout-secs must be greater than zero"),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };
        Ok(ServerConfig {
            listen_addr: SocketAddr::new(ip, cli.port),
            match_timeout,
        })
    }
}
