//! breed-vision: serve or run a breed image classifier.
//!
//! # Commands
//!
//! - `serve`: load the model and expose `POST /predict` over HTTP
//! - `classify`: classify one local image and print the prediction as JSON
//!
//! Settings are resolved as CLI flags > environment > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use breed_vision_model::{init_device, load_classifier, ImageClassifier};
use breed_vision_server::{load_state, serve, ServerConfig};

/// Breed image classifier service
#[derive(Parser)]
#[command(name = "breed-vision")]
#[command(version)]
#[command(about = "Classify livestock breed images over HTTP")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v info, -vv debug, -vvv trace); RUST_LOG applies without it
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Classify a single image and print the result
    Classify(ClassifyArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Checkpoint file or pretrained model directory
    #[arg(long)]
    model: Option<PathBuf>,

    /// Class names sidecar, one label per line
    #[arg(long)]
    classes: Option<PathBuf>,

    /// Exit instead of serving 503s when the model fails to load
    #[arg(long)]
    require_model: bool,
}

#[derive(Args)]
struct ClassifyArgs {
    /// Image to classify
    #[arg(long)]
    image: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    model: Option<PathBuf>,

    /// Number of ranked labels to print
    #[arg(long)]
    top_k: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match verbosity_directive(cli.verbose) {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Classify(args) => run_classify(args).await,
    }
}

fn verbosity_directive(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ServerConfig> {
    let config = match path {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    Ok(config.with_env_overrides())
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(model) = args.model {
        config.model.model_path = model;
    }
    if let Some(classes) = args.classes {
        config.model.classes_path = Some(classes);
    }
    if args.require_model {
        config.server.require_model = true;
    }
    config.validate()?;

    info!(
        "Starting breed-vision v{} with model {}",
        env!("CARGO_PKG_VERSION"),
        config.model.model_path.display()
    );

    let state = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || load_state(&config))
            .await
            .context("model loading task panicked")??
    };

    serve(&config, state).await?;
    Ok(())
}

async fn run_classify(args: ClassifyArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(model) = args.model {
        config.model.model_path = model;
    }
    if let Some(top_k) = args.top_k {
        config.model.top_k = top_k;
    }
    config.validate()?;

    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("Failed to read image {}", args.image.display()))?;

    let prediction = tokio::task::spawn_blocking(move || {
        let device = init_device(config.model.device)?;
        let classifier = load_classifier(&config.model, device)?;
        classifier.predict_bytes(&bytes, config.model.top_k)
    })
    .await
    .context("classification task panicked")??;

    println!("{}", serde_json::to_string_pretty(&prediction)?);
    Ok(())
}
