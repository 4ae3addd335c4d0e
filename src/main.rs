//! detour - a SOCKS5 proxy client that learns per host whether to connect
//! directly or through the upstream relay

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use detour::app::Runtime;
use detour::config::Config;
use detour::error::{Error, Result};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let json = serde_json::to_string_pretty(&Config::default_client())
            .map_err(|e| Error::Config(format!("Failed to render config: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    // Load configuration
    let (config, config_path) = match &args.config {
        Some(path) => (Config::load(path)?, Some(path.clone())),
        None => (Config::default(), None),
    };

    // Initialize logging: RUST_LOG wins over the config file
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    info!("detour v{} starting...", env!("CARGO_PKG_VERSION"));
    match config_path {
        Some(path) => info!("Using config {:?}", path),
        None => info!("No config file specified, using defaults"),
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut runtime = Runtime::from_config(config)?;
        if let Some(api) = &args.api_listen {
            runtime = runtime.with_api_listen(api)?;
        }
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
    api_listen: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;
        let mut api_listen = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "--api" => {
                    if i + 1 < args.len() {
                        api_listen = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            version,
            api_listen,
        }
    }
}

fn print_help() {
    println!(
        r#"detour - adaptive direct/proxy SOCKS5 client

USAGE:
    detour [OPTIONS] [CONFIG]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print an example configuration
    --api <ADDR>            Stats API listen address (e.g., 127.0.0.1:9090)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    detour -c config.json
    detour -c config.json --api 127.0.0.1:9090
    detour --gen-config > config.json

STATS API ENDPOINTS:
    GET /metrics            Prometheus metrics
    GET /api/sites          Learned per-host statistics
"#
    );
}

fn print_version() {
    println!("detour v{}", env!("CARGO_PKG_VERSION"));
    println!("Learns per host whether to connect directly or through a relay");
}
