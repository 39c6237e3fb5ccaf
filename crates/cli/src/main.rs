mod health;

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    ferry_config::{ServerConfig, find_config_file, load_config, to_toml},
    ferry_discovery::{MemoryConnector, MemoryRegistry, RegistryKind},
    ferry_server::Server,
};

#[derive(Parser)]
#[command(name = "ferry", about = "Ferry framed RPC server", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the RPC server.
    Serve {
        /// Config file. Defaults to the first ferry.{toml,yaml,yml,json} in
        /// the working directory or ~/.config/ferry.
        #[arg(short, long, env = "FERRY_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Load and validate a config file, then exit.
    CheckConfig {
        #[arg(short, long, env = "FERRY_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the default config as TOML.
    DefaultConfig,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn resolve_config(path: Option<PathBuf>) -> anyhow::Result<(ServerConfig, PathBuf)> {
    let path = match path {
        Some(path) => path,
        None => find_config_file()
            .context("no ferry.{toml,yaml,yml,json} in the working directory or ~/.config/ferry")?,
    };
    let config = load_config(&path)?;
    Ok((config, path))
}

async fn serve(path: Option<PathBuf>) -> anyhow::Result<i32> {
    let (config, path) = resolve_config(path)?;
    info!(path = %path.display(), app = %config.app_name, "config loaded");

    let mut builder = Server::builder(config.clone());
    if let Some(kind) = config.registry_kind()? {
        warn!(kind = %kind, "no external registry client linked, publishing in-process");
    }
    // etcd and zookeeper clients plug in here; until then both kinds resolve
    // to the in-process registry.
    let registry = MemoryRegistry::new();
    for kind in [RegistryKind::Etcd, RegistryKind::Zookeeper] {
        builder = builder.connector(Arc::new(MemoryConnector::new(kind, Arc::clone(&registry))));
    }

    let reload_path = path.clone();
    builder = builder.on_reload(move || {
        match load_config(&reload_path).and_then(|c| Ok(c.validate()?)) {
            Ok(()) => info!(
                path = %reload_path.display(),
                "config is valid, restart to apply changes"
            ),
            Err(e) => warn!(path = %reload_path.display(), error = %e, "config reload failed"),
        }
    });

    let server = builder.build().await?;
    server
        .register(health::service(Arc::clone(server.sessions())))
        .await?;
    let outcome = server.run().await?;
    Ok(outcome.exit_code())
}

fn check_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = resolve_config(path)?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    let registry = match config.registry_kind()? {
        Some(kind) => format!("{kind} at {}", config.registry.addr),
        None => "none".to_string(),
    };
    println!("{}: ok", path.display());
    println!("  ports:    {}", config.ports.join(", "));
    println!("  codec:    {}", config.codec()?);
    println!("  registry: {registry}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "ferry starting");

    match cli.command {
        Commands::Serve { config } => {
            let code = serve(config).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        },
        Commands::CheckConfig { config } => check_config(config),
        Commands::DefaultConfig => {
            print!("{}", to_toml(&ServerConfig::default())?);
            Ok(())
        },
    }
}
