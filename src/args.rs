use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "roomdrop")]
#[command(version = "0.1.0")]
#[command(about = "Room server for peer-to-peer file drop", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/roomdrop.toml")]
    pub config: PathBuf,

    /// Listen port (overrides config and PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Bind address (overrides config and BIND_ADDRESS)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Password-hash store file (overrides config)
    #[arg(long)]
    pub password_store: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
