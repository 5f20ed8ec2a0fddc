//! chainfeed CLI: run the real-time block gateway.
//!
//! Usage:
//! ```bash
//! # Serve with defaults (listen on 0.0.0.0:8080, node at ws://localhost:26657/websocket)
//! chainfeed serve
//!
//! # Serve from a config file, overriding the listen address
//! chainfeed serve --config gateway.json --listen 127.0.0.1:9000
//!
//! # Print the effective configuration
//! chainfeed config --config gateway.json
//! ```

mod config;
mod logging;
mod server;

use std::env;
use std::path::Path;
use std::process;

use config::GatewayConfig;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "serve" => cmd_serve(&args[2..]).await,
        "config" => cmd_config(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("chainfeed {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainfeed {}", env!("CARGO_PKG_VERSION"));
    println!("Stream upstream blocks to rate-limited WebSocket subscribers\n");
    println!("USAGE:");
    println!("    chainfeed <COMMAND>\n");
    println!("COMMANDS:");
    println!("    serve      Run the gateway");
    println!("    config     Print the effective configuration as JSON");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --config <FILE>      JSON configuration file");
    println!("    --listen <ADDR>      Override the listen address");
    println!("    --upstream <URL>     Override the upstream node URL");
    println!("    --no-upstream        Run without an upstream feed");
}

/// Load the config file (if any) and apply command-line overrides.
fn load_config(args: &[String]) -> anyhow::Result<GatewayConfig> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => GatewayConfig::load(Path::new(&path))?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = parse_flag(args, "--listen") {
        config.listen = listen;
    }
    if let Some(url) = parse_flag(args, "--upstream") {
        config.upstream.url = url;
    }
    if args.iter().any(|a| a == "--no-upstream") {
        config.upstream.enabled = false;
    }
    Ok(config)
}

async fn cmd_serve(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    logging::init_tracing(&config.log)?;
    server::run(config).await
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flags_override_defaults() {
        let config = load_config(&args(&[
            "--listen",
            "127.0.0.1:9000",
            "--upstream",
            "ws://node:26657/websocket",
            "--no-upstream",
        ]))
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.upstream.url, "ws://node:26657/websocket");
        assert!(!config.upstream.enabled);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = load_config(&args(&["--config", "/nonexistent/chainfeed.json"])).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/chainfeed.json"));
    }

    #[test]
    fn parse_flag_needs_value() {
        assert_eq!(parse_flag(&args(&["--listen"]), "--listen"), None);
        assert_eq!(
            parse_flag(&args(&["--listen", "x"]), "--listen").as_deref(),
            Some("x")
        );
    }
}
