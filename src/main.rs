//! tablehub server
//!
//! Run with: cargo run -- serve --config config.toml
//!
//! # Configuration
//!
//! Settings come from a TOML file (see `tablehub config`) with environment
//! overrides (`TABLEHUB_*`). `RUST_LOG` takes precedence over
//! `[logging] level`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tablehub::api::{serve, AppState};
use tablehub::auth::{CredentialValidator, RemoteValidator, StaticTokenValidator};
use tablehub::config::{generate_default_config, AuthMode, Config, LoggingConfig};
use tablehub::generation::{ContentGenerator, HttpContentGenerator, UnconfiguredGenerator};

#[derive(Parser)]
#[command(name = "tablehub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time session hub for tabletop games")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server
    Serve {
        /// Config file (default: search the usual locations)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the bind port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load and validate a config file
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut config = match config {
                Some(path) => Config::load_with_env(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => Config::load_default(),
            };
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate()?;

            init_tracing(&config.logging);
            run_server(config).await
        }
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{content}"),
            }
            Ok(())
        }
        Commands::CheckConfig { config } => {
            let loaded = Config::load_with_env(&config)?;
            loaded.validate()?;
            println!("{}: ok", config.display());
            println!("  listen:      {}", loaded.server.addr());
            println!("  auth mode:   {:?}", loaded.auth.mode);
            println!(
                "  generator:   {}",
                loaded.generator.url.as_deref().unwrap_or("(not configured)")
            );
            Ok(())
        }
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting tablehub v{}", env!("CARGO_PKG_VERSION"));

    let validator = build_validator(&config)?;
    let generator = build_generator(&config)?;

    let state = AppState::from_config(&config, validator, generator);
    let report = serve(state, &config).await?;

    if !report.drained {
        tracing::warn!(
            remaining = report.remaining,
            "Some connections were force-closed at shutdown"
        );
    }
    tracing::info!("tablehub stopped");
    Ok(())
}

fn build_validator(config: &Config) -> anyhow::Result<Arc<dyn CredentialValidator>> {
    match config.auth.mode {
        AuthMode::Static => {
            let validator = StaticTokenValidator::from_entries(&config.auth.tokens);
            if validator.is_empty() {
                tracing::warn!("Static auth has no tokens configured; every handshake will fail");
            } else {
                tracing::info!(tokens = validator.len(), "Using static token validator");
            }
            Ok(Arc::new(validator))
        }
        AuthMode::Remote => {
            let url = config
                .auth
                .issuer_url
                .clone()
                .context("auth.issuer_url is required in remote mode")?;
            tracing::info!(issuer = %url, "Using remote credential issuer");
            Ok(Arc::new(RemoteValidator::new(url, config.auth.request_timeout_ms)?))
        }
    }
}

fn build_generator(config: &Config) -> anyhow::Result<Arc<dyn ContentGenerator>> {
    match &config.generator.url {
        Some(url) => {
            tracing::info!(generator = %url, "Content generation enabled");
            Ok(Arc::new(HttpContentGenerator::new(
                url.clone(),
                config.generator.request_timeout_ms,
            )?))
        }
        None => {
            tracing::info!("Content generation disabled (set [generator] url to enable)");
            Ok(Arc::new(UnconfiguredGenerator))
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tablehub={},tower_http=info", logging.level))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
