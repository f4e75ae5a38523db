//! Model downloader for HuggingFace Hub
//!
//! Fetches everything the demo needs:
//! - DALL·E mini seq2seq model (config + weights) and its BART tokenizer
//! - VQGAN f16/16384 image decoder (config + weights)
//! - CLIP ViT-B/32 scorer (weights + tokenizer)
//!
//! Files land in the regular hub cache, so later runs skip the network.

use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::PathBuf;
use tracing::info;

use crate::config::ModelsConfig;

/// Model downloader that caches models using HuggingFace Hub
pub struct ModelDownloader {
    api: Api,
}

impl ModelDownloader {
    /// Create a new model downloader
    ///
    /// Uses HF_TOKEN environment variable if set
    pub fn new() -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API client")?;
        Ok(Self { api })
    }

    fn repo(&self, id: &str, revision: &str) -> ApiRepo {
        self.api.repo(Repo::with_revision(
            id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ))
    }

    /// Download all model files, in parallel
    pub async fn download_all(&self, models: &ModelsConfig) -> Result<ModelPaths> {
        info!("Downloading DALL·E mini, VQGAN and CLIP");

        let ((bart_config, bart_weights), bart_tokenizer, (vqgan_config, vqgan_weights), (clip_weights, clip_tokenizer)) = tokio::try_join!(
            self.download_bart(models),
            self.download_bart_tokenizer(models),
            self.download_vqgan(models),
            self.download_clip(models),
        )?;

        info!("✓ All models downloaded");

        Ok(ModelPaths {
            bart_config,
            bart_weights,
            bart_tokenizer,
            vqgan_config,
            vqgan_weights,
            clip_weights,
            clip_tokenizer,
        })
    }

    /// Download the seq2seq image-token model (config.json + weights)
    pub async fn download_bart(&self, models: &ModelsConfig) -> Result<(PathBuf, PathBuf)> {
        info!(repo = %models.bart_repo, "Downloading DALL·E mini seq2seq model");

        let repo = self.repo(&models.bart_repo, &models.bart_revision);
        let config = repo
            .get("config.json")
            .await
            .context("Failed to download DALL·E mini config")?;
        let weights = repo
            .get(&models.bart_weights)
            .await
            .context("Failed to download DALL·E mini weights")?;

        info!("  ✓ DALL·E mini downloaded: {}", weights.display());
        Ok((config, weights))
    }

    /// Download the BART tokenizer used to encode prompts
    pub async fn download_bart_tokenizer(&self, models: &ModelsConfig) -> Result<PathBuf> {
        info!(repo = %models.tokenizer_repo, "Downloading prompt tokenizer");

        let path = self
            .api
            .model(models.tokenizer_repo.clone())
            .get("tokenizer.json")
            .await
            .context("Failed to download prompt tokenizer")?;

        info!("  ✓ Prompt tokenizer downloaded: {}", path.display());
        Ok(path)
    }

    /// Download the VQGAN image decoder (config.json + weights)
    pub async fn download_vqgan(&self, models: &ModelsConfig) -> Result<(PathBuf, PathBuf)> {
        info!(repo = %models.vqgan_repo, "Downloading VQGAN decoder");

        let repo = self.repo(&models.vqgan_repo, &models.vqgan_revision);
        let config = repo
            .get("config.json")
            .await
            .context("Failed to download VQGAN config")?;
        let weights = repo
            .get(&models.vqgan_weights)
            .await
            .context("Failed to download VQGAN weights")?;

        info!("  ✓ VQGAN downloaded: {}", weights.display());
        Ok((config, weights))
    }

    /// Download the CLIP scorer (weights + tokenizer.json)
    pub async fn download_clip(&self, models: &ModelsConfig) -> Result<(PathBuf, PathBuf)> {
        info!(repo = %models.clip_repo, "Downloading CLIP scorer");

        let repo = self.repo(&models.clip_repo, &models.clip_revision);
        let weights = repo
            .get(&models.clip_weights)
            .await
            .context("Failed to download CLIP weights")?;
        let tokenizer = repo
            .get("tokenizer.json")
            .await
            .context("Failed to download CLIP tokenizer")?;

        info!("  ✓ CLIP downloaded: {}", weights.display());
        Ok((weights, tokenizer))
    }
}

/// Paths to all downloaded model files
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub bart_config: PathBuf,
    pub bart_weights: PathBuf,
    pub bart_tokenizer: PathBuf,
    pub vqgan_config: PathBuf,
    pub vqgan_weights: PathBuf,
    pub clip_weights: PathBuf,
    pub clip_tokenizer: PathBuf,
}
