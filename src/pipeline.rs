//! Prompt-to-predictions pipeline
//!
//! 1. Tokenize the prompt
//! 2. Sample image tokens with the seq2seq model, `batch_size` candidates at a time
//! 3. Decode tokens to pixels with the VQGAN
//! 4. Rank candidates against the prompt with CLIP
//! 5. Lay out the best ones as a strip

use anyhow::Result;
use candle_core::Device;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bart::{BartConfig, DalleBart, PromptTokenizer, SamplingParams};
use crate::clip::{rank_top_k, ClipScorer};
use crate::config::{AppConfig, GenerationConfig};
use crate::download::ModelPaths;
use crate::strip::{captioned_strip, CaptionStyle};
use crate::vqgan::{tensor_to_images, VqganConfig, VqganDecoder};

pub const MAX_CANDIDATES: usize = 64;
pub const MAX_PREDICTIONS: usize = 8;
pub const DEFAULT_CANDIDATES: usize = 8;
pub const DEFAULT_PREDICTIONS: usize = 1;

/// Pick the fastest available device unless `cpu` forces the CPU
pub fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    warn!("No GPU backend available, running on CPU (this will be slow)");
    Ok(Device::Cpu)
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Candidates to generate
    pub candidates: usize,
    /// Best predictions to show
    pub predictions: usize,
    /// Fixed seed for reproducible candidates; random when absent
    pub seed: Option<u64>,
    /// Draw the prompt above the strip
    pub caption: bool,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            candidates: DEFAULT_CANDIDATES,
            predictions: DEFAULT_PREDICTIONS,
            seed: None,
            caption: false,
        }
    }
}

impl GenerationRequest {
    pub fn validate(&self, prompt: &str) -> Result<(), String> {
        if prompt.trim().is_empty() {
            return Err("prompt must not be empty".to_string());
        }
        if !(1..=MAX_CANDIDATES).contains(&self.candidates) {
            return Err(format!(
                "candidates must be between 1 and {}, got {}",
                MAX_CANDIDATES, self.candidates
            ));
        }
        if !(1..=MAX_PREDICTIONS).contains(&self.predictions) {
            return Err(format!(
                "predictions must be between 1 and {}, got {}",
                MAX_PREDICTIONS, self.predictions
            ));
        }
        Ok(())
    }
}

/// One ranked candidate
pub struct Prediction {
    pub image: RgbImage,
    pub score: f32,
    /// Position among the generated candidates, so `seed + candidate` reproduces it
    pub candidate: usize,
}

pub struct Predictions {
    pub seed: u64,
    pub predictions: Vec<Prediction>,
    pub strip: RgbImage,
}

/// Seeds for candidates `start..end` of a run seeded with `seed`
fn candidate_seeds(seed: u64, start: usize, end: usize) -> Vec<u64> {
    (start..end).map(|i| seed.wrapping_add(i as u64)).collect()
}

/// All models, loaded once and read-only afterwards
pub struct DalleMiniPipeline {
    tokenizer: PromptTokenizer,
    bart: DalleBart,
    vqgan: VqganDecoder,
    clip: ClipScorer,
    caption: Option<CaptionStyle>,
    generation: GenerationConfig,
}

impl DalleMiniPipeline {
    /// Load every model from downloaded files
    pub fn load(paths: &ModelPaths, config: &AppConfig, device: &Device) -> Result<Self> {
        info!(device = ?device, "Initializing DALL·E mini pipeline");

        let bart_config = BartConfig::from_file(&paths.bart_config)?;
        let tokenizer = PromptTokenizer::from_file(
            &paths.bart_tokenizer,
            config.generation.max_prompt_length,
            bart_config.pad_token_id,
        )?;
        let bart = DalleBart::load(&paths.bart_weights, bart_config, device)?;

        let vqgan_config = VqganConfig::from_file(&paths.vqgan_config)?;
        let vqgan = VqganDecoder::load(&paths.vqgan_weights, vqgan_config, device)?;

        let clip = ClipScorer::load(
            &paths.clip_weights,
            &paths.clip_tokenizer,
            config.generation.clip_batch_size,
            device,
        )?;

        // Captions are optional; without the font only uncaptioned strips work
        let caption = match CaptionStyle::load(&config.caption) {
            Ok(style) => Some(style),
            Err(e) => {
                warn!(error = %e, "Caption font unavailable, captions disabled");
                None
            }
        };

        info!("✓ Pipeline initialized successfully");

        Ok(Self::from_parts(
            tokenizer,
            bart,
            vqgan,
            clip,
            caption,
            config.generation.clone(),
        ))
    }

    pub(crate) fn from_parts(
        tokenizer: PromptTokenizer,
        bart: DalleBart,
        vqgan: VqganDecoder,
        clip: ClipScorer,
        caption: Option<CaptionStyle>,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            tokenizer,
            bart,
            vqgan,
            clip,
            caption,
            generation,
        }
    }

    fn sampling(&self) -> SamplingParams {
        SamplingParams {
            top_k: self.generation.top_k,
            temperature: self.generation.temperature,
        }
    }

    /// Generate `num_candidates` images for `prompt`.
    ///
    /// Candidate `i` is sampled with seed `seed + i`, so a fixed seed always
    /// yields the same candidates.
    pub fn hallucinate(&self, prompt: &str, num_candidates: usize, seed: u64) -> Result<Vec<RgbImage>> {
        info!(
            prompt_preview = %prompt.chars().take(50).collect::<String>(),
            candidates = num_candidates,
            seed = seed,
            "Generating candidates"
        );

        let encoded = self.tokenizer.encode(prompt)?;
        let (input_ids, attention_mask) = self.bart.prompt_tensors(&encoded)?;

        let batch_size = self.generation.batch_size.max(1);
        let mut images = Vec::with_capacity(num_candidates);
        for start in (0..num_candidates).step_by(batch_size) {
            let end = (start + batch_size).min(num_candidates);
            let seeds = candidate_seeds(seed, start, end);

            let codes = self
                .bart
                .generate(&input_ids, &attention_mask, &seeds, self.sampling())?;
            let pixels = self.vqgan.decode_code(&codes)?;
            images.extend(tensor_to_images(&pixels)?);

            info!(done = end, total = num_candidates, "Candidates decoded");
        }

        Ok(images)
    }

    /// Keep the `k` candidates CLIP finds closest to the prompt, best first
    pub fn clip_top_k(&self, prompt: &str, images: Vec<RgbImage>, k: usize) -> Result<Vec<Prediction>> {
        let scores = self.clip.score(prompt, &images)?;
        let best = rank_top_k(&scores, k);

        let mut slots: Vec<Option<RgbImage>> = images.into_iter().map(Some).collect();
        let predictions = best
            .into_iter()
            .filter_map(|candidate| {
                slots[candidate].take().map(|image| Prediction {
                    image,
                    score: scores[candidate],
                    candidate,
                })
            })
            .collect::<Vec<_>>();

        for (rank, prediction) in predictions.iter().enumerate() {
            info!(
                rank = rank + 1,
                candidate = prediction.candidate,
                score = prediction.score,
                "CLIP ranking"
            );
        }
        Ok(predictions)
    }

    /// Full run: generate, rank, lay out
    pub fn run(&self, prompt: &str, request: &GenerationRequest) -> Result<Predictions> {
        request.validate(prompt).map_err(anyhow::Error::msg)?;

        let seed = request.seed.unwrap_or_else(rand::random);
        let candidates = self.hallucinate(prompt, request.candidates, seed)?;
        self.rank_and_layout(prompt, seed, candidates, request)
    }

    /// Rank already generated candidates and build the prediction strip
    pub fn rank_and_layout(
        &self,
        prompt: &str,
        seed: u64,
        candidates: Vec<RgbImage>,
        request: &GenerationRequest,
    ) -> Result<Predictions> {
        let caption = match (&self.caption, request.caption) {
            (Some(style), true) => Some((prompt, style)),
            (None, true) => anyhow::bail!("Captions requested but no caption font is loaded"),
            (_, false) => None,
        };

        let predictions = self.clip_top_k(prompt, candidates, request.predictions)?;
        let images: Vec<RgbImage> = predictions.iter().map(|p| p.image.clone()).collect();
        let strip = captioned_strip(&images, caption)?;

        Ok(Predictions {
            seed,
            predictions,
            strip,
        })
    }
}
