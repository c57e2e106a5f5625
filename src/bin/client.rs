//! muxtun client
//!
//! Accepts local application connections and multiplexes them over a
//! single tunnel connection to a muxtun server:
//! - Connects the tunnel once at startup
//! - Assigns each application connection a random stream identifier
//! - Exits when the tunnel goes away; restart it externally

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use muxtun::{
    config::{generate_example_config, Config, LogFormat},
    logging, net,
    reactor::run_until_interrupted,
    tunnel::{ConnectionManager, IdAllocator},
    Reactor,
};
use tracing::{error, info};

/// muxtun client - multiplex local TCP connections over one tunnel
#[derive(Parser, Debug)]
#[command(name = "muxtun-client")]
#[command(about = "muxtun client - multiplex local TCP connections over one tunnel")]
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
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    info!("muxtun client v{}", muxtun::VERSION);

    let listen_addr = endpoints.listen_addr();
    let listener = net::create_listener(listen_addr)
        .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    info!("Accepting applications on {}", listen_addr);

    let server_addr = endpoints.remote_addr();
    info!("Connecting to tunnel server {}", server_addr);
    let peer = net::connect_tunnel(server_addr, config.tunnel.connect_timeout())
        .with_context(|| format!("Failed to connect to tunnel server {}", server_addr))?;
    info!("Tunnel established ({:?} framing)", config.tunnel.framing);

    let manager = ConnectionManager::originating(
        listener,
        peer,
        IdAllocator::system(),
        config.tunnel.manager_settings(),
    );
    let reactor =
        Reactor::new(manager, config.tunnel.max_events).context("Failed to start event loop")?;

    if let Err(e) = run_until_interrupted(reactor).await {
        error!("Client stopped: {}", e);
        return Err(e.into());
    }
    info!("Client stopped");
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
