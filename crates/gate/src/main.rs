use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use ratekeeper_common::AppConfig;
use ratekeeper_gate::{Decision, EndpointLimiters};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .json()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/ratekeeper.yaml".to_string());

    let config = AppConfig::load(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;
    let gate = EndpointLimiters::from_config(&config)?;

    info!(
        config_path = %config_path,
        endpoints = config.endpoints.len(),
        "reading `<path> <client>` lines from stdin"
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut allowed = 0u64;
    let mut denied = 0u64;

    for line in io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(path), Some(client), None) = (parts.next(), parts.next(), parts.next()) else {
            warn!(line, "expected `<path> <client>`, skipping");
            continue;
        };

        match gate.check(path, client) {
            Decision::Allowed => {
                allowed += 1;
                writeln!(out, "allow")?;
            }
            Decision::Limited { endpoint } => {
                denied += 1;
                writeln!(out, "deny {endpoint}")?;
            }
        }
    }

    gate.close();
    info!(allowed, denied, "input exhausted, shutting down");
    Ok(())
}
