//! DALL·E mini seq2seq model
//!
//! A BART encoder reads the prompt; a BART decoder with its own token
//! embedding and output head emits VQGAN codebook indices. The decoder
//! vocabulary is the image codebook plus one BOS token, so a full image is
//! `image_length` sampled tokens following BOS.
//!
//! Weights load from the published Flax checkpoint (`flax_model.msgpack`) or
//! from safetensors. Names follow `BartForConditionalGeneration`, with the
//! decoder embedding stored under `model.decoder_embed`.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{
    embedding, init, layer_norm, linear, linear_no_bias, Activation, Embedding, LayerNorm,
    Linear, VarBuilder,
};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde::Deserialize;
use std::path::Path;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::{debug, info};

use crate::flax;

/// Positional embeddings in BART are shifted by two slots
const POSITION_OFFSET: usize = 2;

const LAYER_NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BartConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub decoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    pub decoder_ffn_dim: usize,
    pub activation_function: Activation,
    pub max_position_embeddings: usize,
    pub scale_embedding: bool,
    pub pad_token_id: u32,
    /// Size of the VQGAN codebook
    pub image_vocab_size: usize,
    /// Number of tokens that make up one image
    pub image_length: usize,
}

impl Default for BartConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50264,
            d_model: 1024,
            encoder_layers: 12,
            decoder_layers: 12,
            encoder_attention_heads: 16,
            decoder_attention_heads: 16,
            encoder_ffn_dim: 4096,
            decoder_ffn_dim: 4096,
            activation_function: Activation::Gelu,
            max_position_embeddings: 1024,
            scale_embedding: false,
            pad_token_id: 1,
            image_vocab_size: 16384,
            image_length: 256,
        }
    }
}

impl BartConfig {
    /// Load `config.json`; keys missing from the file keep their DALL·E mini defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config: {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse model config: {}", path.display()))?;
        Ok(config)
    }

    /// Decoder vocabulary: every codebook entry plus BOS
    pub fn decoder_vocab_size(&self) -> usize {
        self.image_vocab_size + 1
    }

    pub fn bos_token_id(&self) -> u32 {
        self.image_vocab_size as u32
    }

    fn embed_scale(&self) -> f64 {
        if self.scale_embedding {
            (self.d_model as f64).sqrt()
        } else {
            1.0
        }
    }
}

/// Prompt tokenizer padded and truncated to a fixed length
pub struct PromptTokenizer {
    tokenizer: Tokenizer,
}

/// Token ids and attention mask for one prompt
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPrompt {
    pub ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl PromptTokenizer {
    pub fn from_file<P: AsRef<Path>>(path: P, max_length: usize, pad_id: u32) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {}: {}", path.display(), e))?;
        Self::new(tokenizer, max_length, pad_id)
    }

    pub fn new(mut tokenizer: Tokenizer, max_length: usize, pad_id: u32) -> Result<Self> {
        let pad_token = tokenizer
            .id_to_token(pad_id)
            .unwrap_or_else(|| "<pad>".to_string());

        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(max_length),
            pad_id,
            pad_token,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Failed to set truncation: {}", e))?;

        Ok(Self { tokenizer })
    }

    pub fn encode(&self, prompt: &str) -> Result<EncodedPrompt> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        Ok(EncodedPrompt {
            ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }
}

struct LearnedPositionalEmbedding {
    embedding: Embedding,
}

impl LearnedPositionalEmbedding {
    fn new(num_positions: usize, d_model: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = embedding(num_positions + POSITION_OFFSET, d_model, vb)?;
        Ok(Self { embedding })
    }

    /// Embeddings for positions `past_len..past_len + seq_len`, shape `[seq_len, d_model]`
    fn forward(&self, past_len: usize, seq_len: usize, device: &Device) -> Result<Tensor> {
        let start = (past_len + POSITION_OFFSET) as u32;
        let positions = Tensor::arange(start, start + seq_len as u32, device)?;
        Ok(self.embedding.forward(&positions)?)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
}

impl Attention {
    fn new(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = embed_dim / num_heads;
        if head_dim * num_heads != embed_dim {
            anyhow::bail!("d_model {embed_dim} is not divisible by {num_heads} heads");
        }
        Ok(Self {
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
        })
    }

    /// `[b, seq, d_model]` -> `[b, heads, seq, head_dim]`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, _) = xs.dims3()?;
        Ok(xs
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn project_kv(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let k = self.split_heads(&self.k_proj.forward(xs)?)?;
        let v = self.split_heads(&self.v_proj.forward(xs)?)?;
        Ok((k, v))
    }

    fn attend(&self, xs: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b_sz, seq_len, _) = xs.dims3()?;
        let q = self.split_heads(&(self.q_proj.forward(xs)? * self.scaling)?)?;

        let scores = q.matmul(&k.t()?.contiguous()?)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let out = probs
            .matmul(v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, self.num_heads * self.head_dim))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl FeedForward {
    fn new(d_model: usize, ffn_dim: usize, activation: Activation, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(d_model, ffn_dim, vb.pp("fc1"))?,
            fc2: linear(ffn_dim, d_model, vb.pp("fc2"))?,
            activation,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.activation.forward(&self.fc1.forward(xs)?)?;
        Ok(self.fc2.forward(&xs)?)
    }
}

struct EncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

impl EncoderLayer {
    fn new(cfg: &BartConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(cfg.d_model, cfg.encoder_attention_heads, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(cfg.d_model, LAYER_NORM_EPS, vb.pp("self_attn_layer_norm"))?,
            ffn: FeedForward::new(cfg.d_model, cfg.encoder_ffn_dim, cfg.activation_function, &vb)?,
            final_layer_norm: layer_norm(cfg.d_model, LAYER_NORM_EPS, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (k, v) = self.self_attn.project_kv(xs)?;
        let attn = self.self_attn.attend(xs, &k, &v, Some(mask))?;
        let xs = self.self_attn_layer_norm.forward(&(attn + xs)?)?;

        let ff = self.ffn.forward(&xs)?;
        Ok(self.final_layer_norm.forward(&(ff + xs)?)?)
    }
}

struct Encoder {
    embed_tokens: Embedding,
    embed_positions: LearnedPositionalEmbedding,
    layernorm_embedding: LayerNorm,
    layers: Vec<EncoderLayer>,
    embed_scale: f64,
}

impl Encoder {
    fn new(cfg: &BartConfig, embed_tokens: Embedding, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.encoder_layers)
            .map(|i| EncoderLayer::new(cfg, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens,
            embed_positions: LearnedPositionalEmbedding::new(
                cfg.max_position_embeddings,
                cfg.d_model,
                vb.pp("embed_positions"),
            )?,
            layernorm_embedding: layer_norm(cfg.d_model, LAYER_NORM_EPS, vb.pp("layernorm_embedding"))?,
            layers,
            embed_scale: cfg.embed_scale(),
        })
    }

    fn forward(&self, input_ids: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let tokens = (self.embed_tokens.forward(input_ids)? * self.embed_scale)?;
        let positions = self.embed_positions.forward(0, seq_len, input_ids.device())?;
        let mut xs = self.layernorm_embedding.forward(&tokens.broadcast_add(&positions)?)?;

        for layer in &self.layers {
            xs = layer.forward(&xs, mask)?;
        }
        Ok(xs)
    }
}

/// Per-layer decoding state: growing self-attention keys/values and the
/// cross-attention projections of the encoder output, computed once.
struct LayerCache {
    self_kv: Option<(Tensor, Tensor)>,
    cross_kv: (Tensor, Tensor),
}

struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
    fn new(cfg: &BartConfig, vb: VarBuilder) -> Result<Self> {
        let heads = cfg.decoder_attention_heads;
        Ok(Self {
            self_attn: Attention::new(cfg.d_model, heads, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(cfg.d_model, LAYER_NORM_EPS, vb.pp("self_attn_layer_norm"))?,
            encoder_attn: Attention::new(cfg.d_model, heads, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: layer_norm(cfg.d_model, LAYER_NORM_EPS, vb.pp("encoder_attn_layer_norm"))?,
            ffn: FeedForward::new(cfg.d_model, cfg.decoder_ffn_dim, cfg.activation_function, &vb)?,
            final_layer_norm: layer_norm(cfg.d_model, LAYER_NORM_EPS, vb.pp("final_layer_norm"))?,
        })
    }

    /// One decoding step; `xs` holds only the newest token, so no causal mask is needed
    fn forward(&self, xs: &Tensor, cache: &mut LayerCache, encoder_mask: &Tensor) -> Result<Tensor> {
        let (k, v) = self.self_attn.project_kv(xs)?;
        let (k, v) = match cache.self_kv.take() {
            Some((past_k, past_v)) => (Tensor::cat(&[&past_k, &k], 2)?, Tensor::cat(&[&past_v, &v], 2)?),
            None => (k, v),
        };
        let attn = self.self_attn.attend(xs, &k, &v, None)?;
        cache.self_kv = Some((k, v));
        let xs = self.self_attn_layer_norm.forward(&(attn + xs)?)?;

        let (cross_k, cross_v) = &cache.cross_kv;
        let attn = self.encoder_attn.attend(&xs, cross_k, cross_v, Some(encoder_mask))?;
        let xs = self.encoder_attn_layer_norm.forward(&(attn + xs)?)?;

        let ff = self.ffn.forward(&xs)?;
        Ok(self.final_layer_norm.forward(&(ff + xs)?)?)
    }
}

struct Decoder {
    embed_tokens: Embedding,
    embed_positions: LearnedPositionalEmbedding,
    layernorm_embedding: LayerNorm,
    layers: Vec<DecoderLayer>,
    embed_scale: f64,
}

impl Decoder {
    fn new(cfg: &BartConfig, embed_tokens: Embedding, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.decoder_layers)
            .map(|i| DecoderLayer::new(cfg, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens,
            // BOS plus the image tokens
            embed_positions: LearnedPositionalEmbedding::new(
                cfg.image_length + 1,
                cfg.d_model,
                vb.pp("embed_positions"),
            )?,
            layernorm_embedding: layer_norm(cfg.d_model, LAYER_NORM_EPS, vb.pp("layernorm_embedding"))?,
            layers,
            embed_scale: cfg.embed_scale(),
        })
    }

    fn forward_step(
        &self,
        input_ids: &Tensor,
        past_len: usize,
        caches: &mut [LayerCache],
        encoder_mask: &Tensor,
    ) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let tokens = (self.embed_tokens.forward(input_ids)? * self.embed_scale)?;
        let positions = self.embed_positions.forward(past_len, seq_len, input_ids.device())?;
        let mut xs = self.layernorm_embedding.forward(&tokens.broadcast_add(&positions)?)?;

        for (layer, cache) in self.layers.iter().zip(caches.iter_mut()) {
            xs = layer.forward(&xs, cache, encoder_mask)?;
        }
        Ok(xs)
    }
}

/// Sampling settings for image-token generation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub top_k: Option<usize>,
    pub temperature: f64,
}

impl SamplingParams {
    fn to_sampling(self) -> Sampling {
        if self.temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        match self.top_k {
            Some(k) => Sampling::TopK {
                k,
                temperature: self.temperature,
            },
            None => Sampling::All {
                temperature: self.temperature,
            },
        }
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: Some(50),
            temperature: 1.0,
        }
    }
}

/// Text-to-image-token model
pub struct DalleBart {
    encoder: Encoder,
    decoder: Decoder,
    lm_head: Linear,
    final_logits_bias: Tensor,
    /// Added to the logits so BOS is never sampled
    bos_mask: Tensor,
    config: BartConfig,
    device: Device,
}

impl DalleBart {
    /// Load from a Flax msgpack or safetensors checkpoint
    pub fn load<P: AsRef<Path>>(weights: P, config: BartConfig, device: &Device) -> Result<Self> {
        let weights = weights.as_ref();
        info!(path = %weights.display(), "Loading DALL·E mini seq2seq model");

        let vb = if flax::is_flax_checkpoint(weights) {
            flax::load_var_builder(weights, |name| Some(name.to_string()), DType::F32, device)?
        } else {
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? }
        };
        let model = Self::new(config, vb)?;

        info!("✓ DALL·E mini loaded");
        Ok(model)
    }

    pub fn new(config: BartConfig, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let decoder_vocab = config.decoder_vocab_size();

        let shared = embedding(config.vocab_size, config.d_model, vb.pp("model.shared"))?;
        let decoder_embed = embedding(decoder_vocab, config.d_model, vb.pp("model.decoder_embed"))?;

        let encoder = Encoder::new(&config, shared, vb.pp("model.encoder"))?;
        let decoder = Decoder::new(&config, decoder_embed, vb.pp("model.decoder"))?;
        let lm_head = linear_no_bias(config.d_model, decoder_vocab, vb.pp("lm_head"))?;
        let final_logits_bias =
            vb.get_with_hints((1, decoder_vocab), "final_logits_bias", init::ZERO)?;

        let mut mask = vec![0f32; decoder_vocab];
        mask[config.bos_token_id() as usize] = f32::NEG_INFINITY;
        let bos_mask = Tensor::from_vec(mask, decoder_vocab, &device)?;

        Ok(Self {
            encoder,
            decoder,
            lm_head,
            final_logits_bias,
            bos_mask,
            config,
            device,
        })
    }

    pub fn config(&self) -> &BartConfig {
        &self.config
    }

    /// Build `[1, seq]` id and mask tensors for an encoded prompt
    pub fn prompt_tensors(&self, prompt: &EncodedPrompt) -> Result<(Tensor, Tensor)> {
        let ids = Tensor::new(prompt.ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let mask = Tensor::new(prompt.attention_mask.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok((ids, mask))
    }

    /// Sample one image-token sequence per seed.
    ///
    /// `input_ids` and `attention_mask` are `[1, seq]`; the prompt is encoded
    /// once and shared across the batch. Returns `[seeds.len(), image_length]`
    /// codebook indices with the leading BOS dropped.
    pub fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        seeds: &[u64],
        params: SamplingParams,
    ) -> Result<Tensor> {
        let b_sz = seeds.len();
        if b_sz == 0 {
            anyhow::bail!("generate called with an empty batch");
        }

        // 0 for real tokens, large negative for padding: [1, 1, 1, src]
        let encoder_mask = ((attention_mask.to_dtype(DType::F32)? - 1.0)? * 1e9)?
            .unsqueeze(1)?
            .unsqueeze(1)?;
        let encoder_out = self.encoder.forward(input_ids, &encoder_mask)?;
        let encoder_out = encoder_out.repeat((b_sz, 1, 1))?;

        let mut caches = self
            .decoder
            .layers
            .iter()
            .map(|layer| {
                Ok(LayerCache {
                    self_kv: None,
                    cross_kv: layer.encoder_attn.project_kv(&encoder_out)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let sampling = params.to_sampling();
        let mut processors: Vec<LogitsProcessor> = seeds
            .iter()
            .map(|&seed| LogitsProcessor::from_sampling(seed, sampling.clone()))
            .collect();

        let image_length = self.config.image_length;
        let mut current = vec![self.config.bos_token_id(); b_sz];
        let mut codes: Vec<Vec<u32>> = vec![Vec::with_capacity(image_length); b_sz];

        for step in 0..image_length {
            let input = Tensor::new(current.as_slice(), &self.device)?.unsqueeze(1)?;
            let hidden = self
                .decoder
                .forward_step(&input, step, &mut caches, &encoder_mask)?;
            let logits = self
                .lm_head
                .forward(&hidden)?
                .broadcast_add(&self.final_logits_bias)?
                .squeeze(1)?
                .broadcast_add(&self.bos_mask)?;

            for (row, processor) in processors.iter_mut().enumerate() {
                let next = processor.sample(&logits.i(row)?)?;
                codes[row].push(next);
                current[row] = next;
            }

            if (step + 1) % 64 == 0 {
                debug!(step = step + 1, total = image_length, "Image tokens sampled");
            }
        }

        let flat: Vec<u32> = codes.into_iter().flatten().collect();
        Ok(Tensor::from_vec(flat, (b_sz, image_length), &self.device)?)
    }
}
