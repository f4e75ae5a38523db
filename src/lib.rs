//! DALL·E mini demo
//!
//! Type a prompt, get pictures: a BART seq2seq model samples VQGAN image
//! tokens, the VQGAN decodes them to pixels, and CLIP picks the candidates
//! that best match the prompt. Everything runs on the Candle ML framework.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dalle_mini_demo::config::AppConfig;
//! use dalle_mini_demo::download::ModelDownloader;
//! use dalle_mini_demo::pipeline::{select_device, DalleMiniPipeline, GenerationRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::default();
//!     let paths = ModelDownloader::new()?.download_all(&config.models).await?;
//!
//!     let device = select_device(false)?;
//!     let pipeline = DalleMiniPipeline::load(&paths, &config, &device)?;
//!
//!     let request = GenerationRequest { candidates: 16, predictions: 4, ..Default::default() };
//!     let result = pipeline.run("a snowy mountain at sunset", &request)?;
//!     result.strip.save("predictions.png")?;
//!
//!     Ok(())
//! }
//! ```

pub mod bart;
pub mod clip;
pub mod config;
pub mod download;
pub mod flax;
pub mod pipeline;
pub mod server;
pub mod strip;
pub mod vqgan;
