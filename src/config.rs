//! Demo configuration
//!
//! Everything has a default, so the app runs without a config file. A TOML
//! file passed with `--config` overrides any subset of the fields:
//!
//! ```toml
//! [generation]
//! batch_size = 8
//!
//! [server]
//! port = 9000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelsConfig,
    pub generation: GenerationConfig,
    pub server: ServerConfig,
    pub caption: CaptionConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file, or use defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

/// Hub locations of the three pretrained models
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Seq2seq model that turns prompts into image tokens
    pub bart_repo: String,
    pub bart_revision: String,
    /// `*.msgpack` is read as a Flax checkpoint, anything else as safetensors
    pub bart_weights: String,
    /// Text tokenizer for the seq2seq encoder
    pub tokenizer_repo: String,
    pub vqgan_repo: String,
    pub vqgan_revision: String,
    pub vqgan_weights: String,
    pub clip_repo: String,
    pub clip_revision: String,
    pub clip_weights: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            bart_repo: "flax-community/dalle-mini".to_string(),
            bart_revision: "main".to_string(),
            bart_weights: "flax_model.msgpack".to_string(),
            tokenizer_repo: "facebook/bart-large-cnn".to_string(),
            vqgan_repo: "flax-community/vqgan_f16_16384".to_string(),
            vqgan_revision: "main".to_string(),
            vqgan_weights: "flax_model.msgpack".to_string(),
            clip_repo: "openai/clip-vit-base-patch32".to_string(),
            clip_revision: "refs/pr/15".to_string(),
            clip_weights: "model.safetensors".to_string(),
        }
    }
}

/// Sampling and batching knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Prompts are padded / truncated to this many tokens
    pub max_prompt_length: usize,
    /// Top-k sampling cutoff, `None` samples from the full distribution
    pub top_k: Option<usize>,
    /// 0.0 switches to greedy decoding
    pub temperature: f64,
    /// Candidates decoded together in one forward batch
    pub batch_size: usize,
    /// Images scored per CLIP forward pass
    pub clip_batch_size: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_prompt_length: 128,
            top_k: Some(50),
            temperature: 1.0,
            batch_size: 4,
            clip_batch_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8501,
        }
    }
}

/// Font used to draw the prompt above a prediction strip
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub font_path: PathBuf,
    pub font_size: f32,
    /// Height of the band reserved above the images
    pub band_height: u32,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            font_path: PathBuf::from(
                "/usr/share/fonts/truetype/liberation2/LiberationMono-Bold.ttf",
            ),
            font_size: 40.0,
            band_height: 48,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.generation.max_prompt_length, 128);
        assert_eq!(config.generation.top_k, Some(50));
        assert_eq!(config.server.port, 8501);
        assert_eq!(config.models.clip_revision, "refs/pr/15");
        assert_eq!(config.models.bart_weights, "flax_model.msgpack");
        assert_eq!(config.models.vqgan_weights, "flax_model.msgpack");
        assert_eq!(config.caption.band_height, 48);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[generation]\nbatch_size = 8\n\n[server]\nport = 9000\n"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.generation.batch_size, 8);
        assert_eq!(config.generation.clip_batch_size, 16);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.models.bart_repo, "flax-community/dalle-mini");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/dalle.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dalle.toml"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = \"not a number\"").unwrap();
        assert!(AppConfig::load(Some(file.path())).is_err());
    }
}
