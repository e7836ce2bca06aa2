use std::{fs, ops::RangeInclusive, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug, Clone, Deserialize)]
#[command(name = "server")]
#[command(author, version, about, long_about = None)]
pub struct AppConfig {
    #[clap(long)]
    #[arg(short = 'c')]
    #[serde(default)]
    pub config: Option<String>,
    /// JSON cache refresh configuration, reloaded before every cycle.
    #[clap(long, env)]
    pub cache_refresh_config: PathBuf,
    /// Seconds between two cycle starts.
    #[clap(long, env)]
    #[arg(default_value_t = 300)]
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[clap(long, env)]
    #[arg(default_value_t = String::from("server=info,oxsync=info"))]
    #[serde(default = "default_rust_log")]
    pub rust_log: String,
    #[clap(long, env)]
    #[arg(value_parser = port_in_range,short = 'p', default_value_t = 30060)]
    #[serde(default = "default_port")]
    pub port: u16,
    #[clap(long, env)]
    #[arg(default_value_t = String::from("0.0.0.0"))]
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[clap(long, env)]
    #[arg(default_value_t = String::from("*"))]
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    /// Run a single cycle and exit.
    #[clap(long, env)]
    #[arg(default_value_t = false)]
    #[serde(default)]
    pub run_once: bool,
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_rust_log() -> String {
    String::from("server=info,oxsync=info")
}

fn default_endpoint() -> String {
    String::from("0.0.0.0")
}

fn default_port() -> u16 {
    30060
}

fn default_cors_origin() -> String {
    String::from("*")
}

const PORT_RANGE: RangeInclusive<usize> = 1..=65535;

fn port_in_range(s: &str) -> Result<u16, String> {
    let port: usize = s
        .parse()
        .map_err(|_| format!("`{s}` isn't a port number"))?;
    if PORT_RANGE.contains(&port) {
        Ok(port as u16)
    } else {
        Err(format!(
            "port not in range {}-{}",
            PORT_RANGE.start(),
            PORT_RANGE.end()
        ))
    }
}

pub fn load(cfg: &str) -> Result<AppConfig> {
    let content =
        fs::read_to_string(cfg).context("could not read config file")?;
    toml::from_str(&content).context("could not parse config file")
}
