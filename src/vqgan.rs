//! VQGAN image decoder
//!
//! Turns a grid of codebook indices back into pixels: codebook lookup,
//! `post_quant_conv`, then the taming-transformers convolutional decoder.
//! Weight names follow the PyTorch taming layout (`quantize.embedding`,
//! `post_quant_conv`, `decoder.mid.block_1`, `decoder.up.{level}.block.{i}`, ...).
//! Flax checkpoints name the same lists `up_{level}`, `block_{i}` and
//! `attn_{i}` and are renamed on load.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, embedding, group_norm, Conv2d, Conv2dConfig, Embedding, GroupNorm, VarBuilder};
use image::{ImageBuffer, RgbImage};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

use crate::flax;

const NUM_GROUPS: usize = 32;
const GROUP_NORM_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VqganConfig {
    pub ch: usize,
    pub out_ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub attn_resolutions: Vec<usize>,
    pub resolution: usize,
    pub z_channels: usize,
    #[serde(alias = "n_embed")]
    pub num_embeddings: usize,
    pub embed_dim: usize,
}

impl Default for VqganConfig {
    fn default() -> Self {
        Self {
            ch: 128,
            out_ch: 3,
            ch_mult: vec![1, 1, 2, 2, 4],
            num_res_blocks: 2,
            attn_resolutions: vec![16],
            resolution: 256,
            z_channels: 256,
            num_embeddings: 16384,
            embed_dim: 256,
        }
    }
}

impl VqganConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read VQGAN config: {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse VQGAN config: {}", path.display()))?;
        Ok(config)
    }
}

/// Taming name for a converted Flax parameter; `None` for encoder-side weights
fn taming_name(flax_name: &str) -> Option<String> {
    if flax_name.starts_with("encoder.") || flax_name.starts_with("quant_conv.") {
        return None;
    }

    let mut segments = Vec::new();
    let mut parent = "";
    for segment in flax_name.split('.') {
        match segment.rsplit_once('_') {
            Some((list @ ("up" | "block" | "attn"), index))
                if parent != "mid" && index.parse::<usize>().is_ok() =>
            {
                segments.push(format!("{list}.{index}"))
            }
            _ => segments.push(segment.to_string()),
        }
        parent = segment;
    }
    Some(segments.join("."))
}

fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_c, out_c, 3, cfg, vb)
}

fn conv1x1(in_c: usize, out_c: usize, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    conv2d(in_c, out_c, 1, Conv2dConfig::default(), vb)
}

struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        let nin_shortcut = if in_c != out_c {
            Some(conv1x1(in_c, out_c, vb.pp("nin_shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            norm1: group_norm(NUM_GROUPS, in_c, GROUP_NORM_EPS, vb.pp("norm1"))?,
            conv1: conv3x3(in_c, out_c, vb.pp("conv1"))?,
            norm2: group_norm(NUM_GROUPS, out_c, GROUP_NORM_EPS, vb.pp("norm2"))?,
            conv2: conv3x3(out_c, out_c, vb.pp("conv2"))?,
            nin_shortcut,
        })
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = candle_nn::ops::silu(&self.norm1.forward(xs)?)?;
        let h = self.conv1.forward(&h)?;
        let h = candle_nn::ops::silu(&self.norm2.forward(&h)?)?;
        let h = self.conv2.forward(&h)?;
        match &self.nin_shortcut {
            Some(shortcut) => shortcut.forward(xs)? + h,
            None => xs + h,
        }
    }
}

/// Single-head self-attention over all spatial positions
struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
}

impl AttnBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: group_norm(NUM_GROUPS, channels, GROUP_NORM_EPS, vb.pp("norm"))?,
            q: conv1x1(channels, channels, vb.pp("q"))?,
            k: conv1x1(channels, channels, vb.pp("k"))?,
            v: conv1x1(channels, channels, vb.pp("v"))?,
            proj_out: conv1x1(channels, channels, vb.pp("proj_out"))?,
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b_sz, c, h, w) = xs.dims4()?;
        let hs = self.norm.forward(xs)?;

        let q = self.q.forward(&hs)?.reshape((b_sz, c, h * w))?.transpose(1, 2)?.contiguous()?;
        let k = self.k.forward(&hs)?.reshape((b_sz, c, h * w))?;
        let v = self.v.forward(&hs)?.reshape((b_sz, c, h * w))?;

        let weights = (q.matmul(&k)? * (c as f64).powf(-0.5))?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;

        let out = v.matmul(&weights.t()?.contiguous()?)?.reshape((b_sz, c, h, w))?;
        xs + self.proj_out.forward(&out)?
    }
}

struct Upsample {
    conv: Conv2d,
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        self.conv.forward(&xs.upsample_nearest2d(h * 2, w * 2)?)
    }
}

/// One resolution level of the decoder
struct UpLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    upsample: Option<Upsample>,
}

impl Module for UpLevel {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for (i, block) in self.blocks.iter().enumerate() {
            xs = block.forward(&xs)?;
            if let Some(attn) = self.attns.get(i) {
                xs = attn.forward(&xs)?;
            }
        }
        match &self.upsample {
            Some(upsample) => upsample.forward(&xs),
            None => Ok(xs),
        }
    }
}

struct Decoder {
    conv_in: Conv2d,
    mid_block_1: ResnetBlock,
    mid_attn_1: AttnBlock,
    mid_block_2: ResnetBlock,
    /// Indexed by level, applied from the deepest level up
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    fn new(cfg: &VqganConfig, vb: VarBuilder) -> Result<Self> {
        let num_levels = cfg.ch_mult.len();
        if num_levels == 0 {
            anyhow::bail!("VQGAN config has an empty ch_mult");
        }

        let mut block_in = cfg.ch * cfg.ch_mult[num_levels - 1];
        let mut curr_res = cfg.resolution >> (num_levels - 1);

        let conv_in = conv3x3(cfg.z_channels, block_in, vb.pp("conv_in"))?;
        let mid = vb.pp("mid");
        let mid_block_1 = ResnetBlock::new(block_in, block_in, mid.pp("block_1"))?;
        let mid_attn_1 = AttnBlock::new(block_in, mid.pp("attn_1"))?;
        let mid_block_2 = ResnetBlock::new(block_in, block_in, mid.pp("block_2"))?;

        let mut up: Vec<UpLevel> = Vec::with_capacity(num_levels);
        for level in (0..num_levels).rev() {
            let level_vb = vb.pp(format!("up.{level}"));
            let block_out = cfg.ch * cfg.ch_mult[level];

            let mut blocks = Vec::with_capacity(cfg.num_res_blocks + 1);
            let mut attns = Vec::new();
            for i in 0..=cfg.num_res_blocks {
                blocks.push(ResnetBlock::new(block_in, block_out, level_vb.pp(format!("block.{i}")))?);
                block_in = block_out;
                if cfg.attn_resolutions.contains(&curr_res) {
                    attns.push(AttnBlock::new(block_in, level_vb.pp(format!("attn.{i}")))?);
                }
            }

            let upsample = if level != 0 {
                curr_res *= 2;
                Some(Upsample {
                    conv: conv3x3(block_in, block_in, level_vb.pp("upsample.conv"))?,
                })
            } else {
                None
            };

            up.push(UpLevel { blocks, attns, upsample });
        }
        up.reverse();

        Ok(Self {
            conv_in,
            mid_block_1,
            mid_attn_1,
            mid_block_2,
            up,
            norm_out: group_norm(NUM_GROUPS, block_in, GROUP_NORM_EPS, vb.pp("norm_out"))?,
            conv_out: conv3x3(block_in, cfg.out_ch, vb.pp("conv_out"))?,
        })
    }
}

impl Module for Decoder {
    fn forward(&self, z: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = self.conv_in.forward(z)?;
        h = self.mid_block_1.forward(&h)?;
        h = self.mid_attn_1.forward(&h)?;
        h = self.mid_block_2.forward(&h)?;

        for level in self.up.iter().rev() {
            h = level.forward(&h)?;
        }

        let h = candle_nn::ops::silu(&self.norm_out.forward(&h)?)?;
        self.conv_out.forward(&h)
    }
}

/// Codebook + decoder half of the VQGAN
pub struct VqganDecoder {
    codebook: Embedding,
    post_quant_conv: Conv2d,
    decoder: Decoder,
    config: VqganConfig,
}

impl VqganDecoder {
    pub fn load<P: AsRef<Path>>(weights: P, config: VqganConfig, device: &Device) -> Result<Self> {
        let weights = weights.as_ref();
        info!(path = %weights.display(), "Loading VQGAN decoder");

        let vb = if flax::is_flax_checkpoint(weights) {
            flax::load_var_builder(weights, taming_name, DType::F32, device)?
        } else {
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? }
        };
        let model = Self::new(config, vb)?;

        info!("✓ VQGAN decoder loaded");
        Ok(model)
    }

    pub fn new(config: VqganConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            codebook: embedding(config.num_embeddings, config.embed_dim, vb.pp("quantize.embedding"))?,
            post_quant_conv: conv1x1(config.embed_dim, config.z_channels, vb.pp("post_quant_conv"))?,
            decoder: Decoder::new(&config, vb.pp("decoder"))?,
            config,
        })
    }

    pub fn config(&self) -> &VqganConfig {
        &self.config
    }

    /// Decode `[b, n]` codebook indices into `[b, out_ch, H, W]` pixels.
    ///
    /// `n` must be a perfect square; the codes are laid out row-major on a
    /// `√n × √n` grid.
    pub fn decode_code(&self, codes: &Tensor) -> Result<Tensor> {
        let (b_sz, n) = codes.dims2()?;
        let side = (n as f64).sqrt().round() as usize;
        if side * side != n {
            anyhow::bail!("{n} image tokens do not form a square grid");
        }

        let z = self
            .codebook
            .forward(codes)?
            .reshape((b_sz, side, side, self.config.embed_dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let z = self.post_quant_conv.forward(&z)?;
        let image = self.decoder.forward(&z)?;

        debug!(shape = ?image.dims(), "VQGAN decoded batch");
        Ok(image)
    }
}

/// Convert `[b, 3, H, W]` pixels in `[0, 1]` to RGB images.
///
/// Values outside the range are clamped; scaling truncates toward zero.
pub fn tensor_to_images(tensor: &Tensor) -> Result<Vec<RgbImage>> {
    let (b_sz, channels, height, width) = tensor.dims4()?;
    if channels != 3 {
        anyhow::bail!("expected 3 channels, got {channels}");
    }

    let pixels = (tensor.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * 255.0)?
        .to_dtype(DType::U8)?
        .permute((0, 2, 3, 1))?
        .flatten_all()?
        .to_vec1::<u8>()?;

    let per_image = height * width * 3;
    pixels
        .chunks_exact(per_image)
        .take(b_sz)
        .map(|chunk| {
            ImageBuffer::from_raw(width as u32, height as u32, chunk.to_vec())
                .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flax::testing::{varmap_leaves, write_checkpoint};
    use candle_nn::VarMap;
    use tempfile::TempDir;

    fn tiny_config() -> VqganConfig {
        VqganConfig {
            ch: 32,
            out_ch: 3,
            ch_mult: vec![1, 1],
            num_res_blocks: 1,
            attn_resolutions: vec![4],
            resolution: 8,
            z_channels: 8,
            num_embeddings: 16,
            embed_dim: 4,
        }
    }

    fn tiny_decoder() -> VqganDecoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        VqganDecoder::new(tiny_config(), vb).unwrap()
    }

    #[test]
    fn test_config_defaults_match_f16_16384() {
        let config: VqganConfig = serde_json::from_str(r#"{"dropout": 0.0}"#).unwrap();
        assert_eq!(config.num_embeddings, 16384);
        assert_eq!(config.resolution >> (config.ch_mult.len() - 1), 16);
    }

    #[test]
    fn test_config_reads_n_embed() {
        let config: VqganConfig = serde_json::from_str(r#"{"n_embed": 1024, "embed_dim": 64}"#).unwrap();
        assert_eq!(config.num_embeddings, 1024);
        assert_eq!(config.embed_dim, 64);
    }

    #[test]
    fn test_taming_names() {
        assert_eq!(
            taming_name("decoder.up_1.block_0.norm1.weight").as_deref(),
            Some("decoder.up.1.block.0.norm1.weight")
        );
        assert_eq!(
            taming_name("decoder.up_0.attn_2.proj_out.bias").as_deref(),
            Some("decoder.up.0.attn.2.proj_out.bias")
        );
        assert_eq!(
            taming_name("decoder.mid.block_1.nin_shortcut.weight").as_deref(),
            Some("decoder.mid.block_1.nin_shortcut.weight")
        );
        assert_eq!(taming_name("quantize.embedding.weight").as_deref(), Some("quantize.embedding.weight"));
        assert_eq!(taming_name("encoder.conv_in.weight"), None);
        assert_eq!(taming_name("quant_conv.bias"), None);
    }

    /// `decoder.up.1.block.0` -> `decoder/up_1/block_0`
    fn flax_module_path(module: &str) -> String {
        let mut segments: Vec<String> = Vec::new();
        let mut parts = module.split('.').peekable();
        while let Some(part) = parts.next() {
            let is_list = matches!(part, "up" | "block" | "attn");
            match parts.peek() {
                Some(index) if is_list && index.parse::<usize>().is_ok() => {
                    segments.push(format!("{part}_{index}"));
                    parts.next();
                }
                _ => segments.push(part.to_string()),
            }
        }
        segments.join("/")
    }

    #[test]
    fn test_load_flax_checkpoint() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let decoder = VqganDecoder::new(tiny_config(), vb).unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flax_model.msgpack");
        let mut leaves = varmap_leaves(&varmap, flax_module_path);
        assert!(leaves.iter().any(|(name, _)| name == "decoder/up_1/block_0/conv1/kernel"));
        assert!(leaves.iter().any(|(name, _)| name == "quantize/embedding/embedding"));

        // Encoder-side weights are present in the file but never loaded
        let unused = Tensor::ones((1, 1, 3, 8), DType::F32, &Device::Cpu).unwrap();
        leaves.push(("encoder/conv_in/kernel".to_string(), crate::flax::testing::ndarray(&unused)));
        write_checkpoint(&path, leaves);

        let loaded = VqganDecoder::load(&path, tiny_config(), &Device::Cpu).unwrap();
        let codes = Tensor::from_vec((0..16u32).collect::<Vec<_>>(), (1, 16), &Device::Cpu).unwrap();
        let expected = decoder.decode_code(&codes).unwrap();
        let actual = loaded.decode_code(&codes).unwrap();
        let diff = (expected - actual).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn test_decode_code_upsamples_grid() {
        let decoder = tiny_decoder();
        let codes: Vec<u32> = (0..32).map(|i| i % 16).collect();
        let codes = Tensor::from_vec(codes, (2, 16), &Device::Cpu).unwrap();

        let image = decoder.decode_code(&codes).unwrap();
        assert_eq!(image.dims(), &[2, 3, 8, 8]);

        let images = tensor_to_images(&image).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].dimensions(), (8, 8));
    }

    #[test]
    fn test_decode_code_rejects_non_square_grid() {
        let decoder = tiny_decoder();
        let codes = Tensor::zeros((1, 15), DType::U32, &Device::Cpu).unwrap();
        assert!(decoder.decode_code(&codes).is_err());
    }

    #[test]
    fn test_tensor_to_images_clamps() {
        // One 1x2 image: left pixel out of range, right pixel saturated
        let data = vec![-1.0f32, 1.0, 2.0, 0.0, 0.0, 1.0];
        let tensor = Tensor::from_vec(data, (1, 3, 1, 2), &Device::Cpu).unwrap();

        let images = tensor_to_images(&tensor).unwrap();
        assert_eq!(images[0].get_pixel(0, 0).0, [0, 255, 0]);
        assert_eq!(images[0].get_pixel(1, 0).0, [255, 0, 255]);
    }
}
