//! CLIP re-ranking of generated candidates

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::Path;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info};

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// CLIP ViT-B/32 text-image similarity scorer
pub struct ClipScorer {
    model: ClipModel,
    tokenizer: Tokenizer,
    image_size: usize,
    batch_size: usize,
    device: Device,
}

impl ClipScorer {
    /// Load CLIP from model.safetensors and tokenizer.json
    pub fn load<P: AsRef<Path>>(
        weights: P,
        tokenizer: P,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let weights = weights.as_ref();
        info!(path = %weights.display(), "Loading CLIP scorer");

        let tokenizer = Tokenizer::from_file(tokenizer.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to load CLIP tokenizer: {}", e))?;

        let config = ClipConfig::vit_base_patch32();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        let model = ClipModel::new(vb, &config)?;

        info!("✓ CLIP scorer loaded");
        Self::new(model, tokenizer, &config, batch_size, device)
    }

    /// Wrap an already built model; prompts are truncated to its text context
    pub fn new(
        model: ClipModel,
        mut tokenizer: Tokenizer,
        config: &ClipConfig,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.text_config.max_position_embeddings,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Failed to set truncation: {}", e))?;

        Ok(Self {
            model,
            tokenizer,
            image_size: config.image_size,
            batch_size: batch_size.max(1),
            device: device.clone(),
        })
    }

    /// Text-to-image logits, one per image, in input order
    pub fn score(&self, prompt: &str, images: &[RgbImage]) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;

        let mut scores = Vec::with_capacity(images.len());
        for chunk in images.chunks(self.batch_size) {
            let pixels = chunk
                .iter()
                .map(|image| {
                    let data = preprocess_image(image, self.image_size);
                    Tensor::from_vec(data, (3, self.image_size, self.image_size), &self.device)
                })
                .collect::<candle_core::Result<Vec<_>>>()?;
            let pixels = Tensor::stack(&pixels, 0)?;

            let (logits_per_text, _) = self.model.forward(&pixels, &input_ids)?;
            scores.extend(logits_per_text.squeeze(0)?.to_vec1::<f32>()?);
        }

        debug!(count = scores.len(), "CLIP scores computed");
        Ok(scores)
    }
}

/// Resize the shortest side to `size`, center crop, normalize with the CLIP
/// statistics. Returns CHW data of length `3 * size * size`.
pub fn preprocess_image(image: &RgbImage, size: usize) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let target = size as u32;
    let (new_w, new_h) = if width <= height {
        let h = (height as u64 * target as u64 / width.max(1) as u64) as u32;
        (target, h.max(target))
    } else {
        let w = (width as u64 * target as u64 / height.max(1) as u64) as u32;
        (w.max(target), target)
    };

    let resized = if (new_w, new_h) == (width, height) {
        image.clone()
    } else {
        imageops::resize(image, new_w, new_h, FilterType::CatmullRom)
    };
    let left = (new_w - target) / 2;
    let top = (new_h - target) / 2;
    let cropped = imageops::crop_imm(&resized, left, top, target, target).to_image();

    let plane = size * size;
    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in cropped.enumerate_pixels() {
        let offset = y as usize * size + x as usize;
        for c in 0..3 {
            let value = pixel.0[c] as f32 / 255.0;
            data[c * plane + offset] = (value - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    data
}

/// Indices of the `k` best scores, best first. Returns `min(k, n)` indices.
pub fn rank_top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.truncate(k);
    order
}

#[cfg(test)]
pub(crate) mod testing {
    //! Tiny randomly initialized CLIP for pipeline tests

    use super::*;
    use candle_nn::VarMap;
    use std::str::FromStr;

    /// Whitespace word-level tokenizer over a handful of prompt words
    pub(crate) fn word_tokenizer() -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"<unk>": 0, "<pad>": 1, "a": 2, "red": 3, "cat": 4, "on": 5, "the": 6, "moon": 7},
                "unk_token": "<unk>"
            }
        }"#;
        Tokenizer::from_str(json).unwrap()
    }

    /// 8x8 images, 4x4 patches, 16-wide embeddings
    pub(crate) fn tiny_config() -> ClipConfig {
        let mut config = ClipConfig::vit_base_patch32();
        config.text_config.vocab_size = 16;
        config.text_config.embed_dim = 16;
        config.text_config.intermediate_size = 32;
        config.text_config.max_position_embeddings = 8;
        config.text_config.num_hidden_layers = 1;
        config.text_config.num_attention_heads = 2;
        config.text_config.projection_dim = 8;
        config.vision_config.embed_dim = 16;
        config.vision_config.intermediate_size = 32;
        config.vision_config.num_hidden_layers = 1;
        config.vision_config.num_attention_heads = 2;
        config.vision_config.projection_dim = 8;
        config.vision_config.image_size = 8;
        config.vision_config.patch_size = 4;
        config.image_size = 8;
        config
    }

    pub(crate) fn tiny_scorer(batch_size: usize) -> ClipScorer {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = tiny_config();
        let model = ClipModel::new(vb, &config).unwrap();
        ClipScorer::new(model, word_tokenizer(), &config, batch_size, &Device::Cpu).unwrap()
    }
}
