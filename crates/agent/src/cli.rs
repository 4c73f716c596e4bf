//! Startup configuration (spec.md §6): a thin flag parser layered over
//! [`AgentConfig`]'s TOML deserialization, not a full argument parser —
//! deploy-time tuning (tiers, ICE servers, ABR constants) lives in the
//! config file; the command line only ever needs to say *which* file and
//! *where* to signal.
//!
//! Grounded in the teacher's `cli.rs` manual flag loop, trimmed to the
//! handful of flags that make sense once per-tier/ABR detail moved into
//! `beam_protocol::config`.

use std::path::PathBuf;

use anyhow::Context;
use beam_protocol::config::AgentConfig;
use tracing::{error, warn};

pub(crate) struct Args {
    pub config_path: Option<PathBuf>,
    pub server_url: String,
    pub broadcast_url: Option<String>,
    pub screencast: bool,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = None;
    let mut server_url = std::env::var("BEAM_SIGNALING_URL").unwrap_or_default();
    let mut broadcast_url = std::env::var("BEAM_BROADCAST_URL").ok();
    let mut screencast = false;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("beam-agent {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                config_path = Some(PathBuf::from(args.get(i).context("Missing --config value")?));
            }
            "--server-url" => {
                i += 1;
                server_url = args.get(i).context("Missing --server-url value")?.clone();
            }
            "--broadcast-url" => {
                i += 1;
                broadcast_url = Some(args.get(i).context("Missing --broadcast-url value")?.clone());
            }
            "--screencast" => screencast = true,
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args { config_path, server_url, broadcast_url, screencast })
}

fn print_help() {
    println!("beam-agent - Beam Remote Desktop capture agent");
    println!();
    println!("USAGE:");
    println!("    beam-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>              TOML config file [default: built-in defaults]");
    println!("    --server-url <URL>           Signalling server WebSocket URL (or $BEAM_SIGNALING_URL)");
    println!("    --broadcast-url <URL>        RTMP URL for the optional broadcast sink");
    println!("    --screencast                 Enable the one-shot JPEG screencast sink");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}

/// Loads `AgentConfig` from `args.config_path` (or built-in defaults if
/// unset), then validates it: `ERROR:`-prefixed issues are fatal, `WARNING:`
/// ones are logged and the agent still starts.
pub(crate) fn load_config(args: &Args) -> anyhow::Result<AgentConfig> {
    let config: AgentConfig = match &args.config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => toml::from_str("").expect("empty string deserializes to AgentConfig defaults"),
    };

    if let Err(issues) = config.validate() {
        let mut fatal = false;
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                fatal = true;
                error!("{issue}");
            } else {
                warn!("{issue}");
            }
        }
        if fatal {
            anyhow::bail!("invalid configuration, see logged errors above");
        }
    }

    Ok(config)
}
