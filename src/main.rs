//! CLI entry point for the DALL·E mini demo

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dalle_mini_demo::config::AppConfig;
use dalle_mini_demo::download::ModelDownloader;
use dalle_mini_demo::pipeline::{
    select_device, DalleMiniPipeline, GenerationRequest, DEFAULT_CANDIDATES, DEFAULT_PREDICTIONS,
};
use dalle_mini_demo::strip::image_grid;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Columns used when saving every candidate as a grid
const GRID_COLUMNS: usize = 4;

#[derive(Parser)]
#[command(name = "dalle-mini-demo")]
#[command(author = "rzem-ai")]
#[command(version = "0.1.0")]
#[command(about = "DALL·E mini text-to-image demo with CLIP re-ranking", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// TOML config file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run on CPU even if a GPU is available
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download DALL·E mini, VQGAN and CLIP from HuggingFace Hub
    Download,

    /// Generate candidates for a prompt and save the best as a PNG strip
    Generate {
        /// What do you want to see?
        #[arg(short, long)]
        prompt: String,

        /// Candidates to generate (1-64)
        #[arg(long, default_value_t = DEFAULT_CANDIDATES)]
        candidates: usize,

        /// Best predictions to keep (1-8)
        #[arg(long, default_value_t = DEFAULT_PREDICTIONS)]
        predictions: usize,

        /// Random seed for reproducibility
        #[arg(long)]
        seed: Option<u64>,

        /// Draw the prompt above the strip
        #[arg(long)]
        caption: bool,

        /// Output PNG
        #[arg(short, long, default_value = "predictions.png")]
        output: PathBuf,

        /// Also save every candidate, before ranking, as a grid
        #[arg(long)]
        candidates_grid: Option<PathBuf>,
    },

    /// Serve the web UI
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
}

async fn load_pipeline(config: &AppConfig, cpu: bool) -> Result<DalleMiniPipeline> {
    let device = select_device(cpu)?;
    println!("✓ Using device: {:?}", device);

    let downloader = ModelDownloader::new()?;
    let paths = downloader.download_all(&config.models).await?;

    DalleMiniPipeline::load(&paths, config, &device)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Download => {
            println!();
            println!("Downloading models from HuggingFace Hub:");
            println!("  • DALL·E mini:  {}", config.models.bart_repo);
            println!("  • Tokenizer:    {}", config.models.tokenizer_repo);
            println!("  • VQGAN:        {}", config.models.vqgan_repo);
            println!("  • CLIP:         {}", config.models.clip_repo);
            println!();

            let downloader = ModelDownloader::new()?;
            let paths = downloader.download_all(&config.models).await?;

            println!();
            println!("✓ All models downloaded successfully!");
            println!();
            println!("Model locations:");
            println!("  DALL·E mini: {}", paths.bart_weights.display());
            println!("  Tokenizer:   {}", paths.bart_tokenizer.display());
            println!("  VQGAN:       {}", paths.vqgan_weights.display());
            println!("  CLIP:        {}", paths.clip_weights.display());
            println!();
        }

        Commands::Generate {
            prompt,
            candidates,
            predictions,
            seed,
            caption,
            output,
            candidates_grid,
        } => {
            let request = GenerationRequest {
                candidates,
                predictions,
                seed,
                caption,
            };
            if let Err(e) = request.validate(&prompt) {
                eprintln!("❌ Error: {}", e);
                std::process::exit(1);
            }

            let pipeline = load_pipeline(&config, cli.cpu).await?;

            println!();
            println!("Generating candidates for: {}", prompt);
            println!();

            let result = match candidates_grid {
                Some(grid_path) => {
                    let seed = seed.unwrap_or_else(rand::random);
                    let images = pipeline.hallucinate(&prompt, candidates, seed)?;
                    image_grid(&images, GRID_COLUMNS)?
                        .save(&grid_path)
                        .with_context(|| format!("Failed to save {}", grid_path.display()))?;
                    println!("✓ Candidates grid: {}", grid_path.display());

                    pipeline.rank_and_layout(&prompt, seed, images, &request)?
                }
                None => pipeline.run(&prompt, &request)?,
            };

            result
                .strip
                .save(&output)
                .with_context(|| format!("Failed to save {}", output.display()))?;

            println!();
            println!("✨ Saved {} prediction(s) to {}", result.predictions.len(), output.display());
            println!("  Seed: {}", result.seed);
            for (rank, prediction) in result.predictions.iter().enumerate() {
                println!(
                    "  #{} candidate {} (score {:.2})",
                    rank + 1,
                    prediction.candidate,
                    prediction.score
                );
            }
            println!();
        }

        Commands::Serve { host, port } => {
            let host = host.unwrap_or(config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .with_context(|| format!("Invalid bind address {}:{}", host, port))?;

            let pipeline = load_pipeline(&config, cli.cpu).await?;
            dalle_mini_demo::server::serve(pipeline, addr).await?;
        }
    }

    Ok(())
}
