//! Relay entry point: `nsrelay {tcp|udp} <port>`.
//!
//! Runs inside the user namespace. The firewall redirects outbound traffic
//! to the given loopback port; this process relays it to the original
//! destinations through broker-obtained sockets. Success is silent.

use std::env;
use std::process;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use nsrelay::broker::BrokerClient;
use nsrelay::config::{self, Protocol, RelayEnv};
use nsrelay::error::{ConfigError, NsRelayError};
use nsrelay::relay;

const USAGE: &str = "usage: nsrelay {tcp|udp} <port>";

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        eprintln!("nsrelay: {e}");
        if matches!(e, NsRelayError::Config(_)) {
            eprintln!("{USAGE}");
        }
        process::exit(1);
    }
}

async fn run() -> Result<(), NsRelayError> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        return Ok(());
    }

    let [proto, port] = args.as_slice() else {
        return Err(ConfigError::BadArguments.into());
    };
    let proto: Protocol = proto.parse()?;
    let port = config::parse_port(port)?;

    let relay_env = RelayEnv::from_env()?;
    let broker = Arc::new(BrokerClient::connect(&relay_env.broker_socket_path())?);

    match proto {
        Protocol::Tcp => relay::serve_tcp(port, broker).await,
        Protocol::Udp => relay::serve_udp(port, broker).await,
    }
}
