//! muxtun server
//!
//! Terminates the tunnel and fans its streams out to one target service:
//! - Accepts a single tunnel connection at a time; a new one replaces it
//! - Opens a target connection per stream identifier it has not seen
//! - Keeps running while no tunnel is connected

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use muxtun::{
    config::{generate_example_config, Config, LogFormat},
    logging, net,
    reactor::run_until_interrupted,
    tunnel::ConnectionManager,
    Reactor,
};
use tracing::{error, info};

/// muxtun server - fan tunnel streams out to a target service
#[derive(Parser, Debug)]
#[command(name = "muxtun-server")]
#[command(about = "muxtun server - fan tunnel streams out to a target service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(required_unless_present = "print_example")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error), overrides the config
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_example {
        print!("{}", toml::to_string_pretty(&generate_example_config())?);
        return Ok(());
    }

    let config = load_config(&args)?;
    logging::init_from_config(&config.logging, args.log_level.as_deref())?;

    let endpoints = config
        .server
        .clone()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    info!("muxtun server v{}", muxtun::VERSION);

    let listen_addr = endpoints.listen_addr();
    let listener = net::create_listener(listen_addr)
        .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    let target = endpoints.remote_addr();
    info!("Tunnel listener on {}, forwarding streams to {}", listen_addr, target);

    let manager =
        ConnectionManager::terminating(listener, target, config.tunnel.manager_settings());
    let reactor =
        Reactor::new(manager, config.tunnel.max_events).context("Failed to start event loop")?;

    if let Err(e) = run_until_interrupted(reactor).await {
        error!("Server stopped: {}", e);
        return Err(e.into());
    }
    info!("Server stopped");
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let path = args
        .config
        .as_deref()
        .ok_or_else(|| anyhow!("No configuration file given"))?;

    Config::load(path).map_err(|e| {
        // Logging is not configured yet; report with defaults
        let level = args.log_level.as_deref().unwrap_or("info");
        if logging::init(level, LogFormat::Compact).is_ok() {
            error!("Failed to load configuration {}: {}", path, e);
        }
        anyhow!(e).context("Failed to load configuration")
    })
}
