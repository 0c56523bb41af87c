//! Socket broker daemon: `socketd [-n <namespace>]`.
//!
//! Runs on the host side of the namespace boundary. Listens on the
//! per-namespace Unix socket and hands out Internet sockets over
//! `SCM_RIGHTS`, one per request byte. The namespace defaults to the
//! environment contract; `-n` overrides it.

use std::env;
use std::process;

use tracing::info;
use tracing_subscriber::EnvFilter;

use nsrelay::broker::BrokerServer;
use nsrelay::config::RelayEnv;
use nsrelay::error::{ConfigError, NsRelayError};

const USAGE: &str = "usage: socketd [-n <namespace>]";

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn parse_args() -> Result<Option<String>, ConfigError> {
    let mut args = env::args().skip(1);
    let mut namespace = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{USAGE}");
                process::exit(0);
            }
            "-n" | "--name" => {
                namespace = Some(args.next().ok_or(ConfigError::BadArguments)?);
            }
            _ => return Err(ConfigError::BadArguments),
        }
    }
    Ok(namespace)
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        eprintln!("socketd: {e}");
        if matches!(e, NsRelayError::Config(_)) {
            eprintln!("{USAGE}");
        }
        process::exit(1);
    }
}

async fn run() -> Result<(), NsRelayError> {
    let namespace = parse_args()?;
    let relay_env = RelayEnv::from_env_with_namespace(namespace)?;
    let path = relay_env.broker_socket_path();

    let server = BrokerServer::new(&path);
    tokio::select! {
        result = server.run() => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            let _ = std::fs::remove_file(&path);
            Ok(())
        }
    }
}
