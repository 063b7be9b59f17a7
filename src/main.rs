//! roomdrop - Main entry point
//!
//! Runs the room server: WebSocket signaling and relay for browser-to-browser
//! file drop, with the small REST surface for room passwords.

// Server-side modules only; the client engine lives in the library.
mod args;
mod config;
mod crypto;
mod protocol;
mod server;

use args::Args;
use clap::Parser;
use config::Config;
use log::{error, info, warn};
use server::AppState;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    env_logger::init_from_env(
        env_logger::Env::default()
            .filter_or("ROOMDROP_LOG", if args.verbose { "debug" } else { "info" }),
    );

    info!("roomdrop v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match args.load_config() {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    // Environment overrides, then CLI overrides
    if let Ok(port) = std::env::var("PORT") {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => warn!("Ignoring invalid PORT value {:?}", port),
        }
    }
    if let Ok(bind) = std::env::var("BIND_ADDRESS") {
        config.server.host = bind;
    }
    if let Some(port) = args.port {
        info!("Overriding port to {}", port);
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        info!("Overriding bind address to {}", bind);
        config.server.host = bind;
    }
    if let Some(path) = args.password_store {
        config.server.password_store = Some(path);
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let state = AppState::new(config);

    tokio::select! {
        result = server::run_server(state) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
