// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::Result;
use clap::Parser;
use feedback_server::{bootstrap_subscriber, config::ServerConfig, init_tracing, run_server};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen interface (overrides config file)
    #[arg(long, env = "FEEDBACK_HOST")]
    host: Option<String>,

    /// Preferred port (overrides config file)
    #[arg(long, env = "FEEDBACK_PORT")]
    port: Option<u16>,

    /// Feedback request timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Never open a browser for new sessions
    #[arg(long)]
    no_browser: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config warnings go through a bootstrap subscriber until the
    // configured one is installed.
    let config = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        load_config(args)
    })?;
    init_tracing(config.logging.json);

    // Run server
    run_server(config).await
}

fn load_config(args: Args) -> Result<ServerConfig> {
    let mut config = ServerConfig::load(args.config)?;

    // Apply CLI overrides
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(timeout) = args.timeout_secs {
        config.session.timeout_secs = timeout;
    }
    if args.no_browser {
        config.ui.launch_browser = false;
    }
    if args.log_json {
        config.logging.json = true;
    }
    config.sanitize();
    Ok(config)
}
