//! Candle implementation of the IndicTrans encoder-decoder network
//! with batched greedy generation.
//!
//! The decoder recomputes the full prefix at every step instead of
//! carrying an incremental state cache; peak memory stays flat at the
//! cost of per-step compute.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{
    embedding, layer_norm, linear, linear_no_bias, Embedding, LayerNorm, Linear, VarBuilder,
};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::config::DeviceKind;
use crate::errors::ServiceError;
use crate::translate::interface::{GenerationOptions, GenerativeModel, TokenBatch};

/// Device and numeric precision, resolved once at startup and used
/// uniformly afterwards: half precision on an accelerator, full
/// precision on the CPU.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub device: Device,
    pub dtype: DType,
}

impl ExecutionContext {
    pub fn resolve(kind: DeviceKind) -> Result<Self, ServiceError> {
        let device = match kind {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda => Device::new_cuda(0).map_err(ServiceError::startup)?,
            DeviceKind::Auto => Device::cuda_if_available(0).map_err(ServiceError::startup)?,
        };
        let dtype = if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        };
        Ok(Self { device, dtype })
    }
}

/// Weight geometry, read from the checkpoint's `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_layers")]
    pub encoder_layers: usize,
    #[serde(default = "default_layers")]
    pub decoder_layers: usize,
    #[serde(default = "default_embed_dim")]
    pub encoder_embed_dim: usize,
    #[serde(default = "default_embed_dim")]
    pub decoder_embed_dim: usize,
    #[serde(default = "default_ffn_dim")]
    pub encoder_ffn_dim: usize,
    #[serde(default = "default_ffn_dim")]
    pub decoder_ffn_dim: usize,
    #[serde(default = "default_heads")]
    pub encoder_attention_heads: usize,
    #[serde(default = "default_heads")]
    pub decoder_attention_heads: usize,
    #[serde(default = "default_encoder_vocab")]
    pub encoder_vocab_size: usize,
    #[serde(default = "default_decoder_vocab")]
    pub decoder_vocab_size: usize,
    #[serde(default = "default_positions")]
    pub max_source_positions: usize,
    #[serde(default = "default_positions")]
    pub max_target_positions: usize,
    #[serde(default = "default_pad")]
    pub pad_token_id: u32,
    #[serde(default = "default_bos")]
    pub bos_token_id: u32,
    #[serde(default = "default_eos")]
    pub eos_token_id: u32,
    #[serde(default = "default_eos")]
    pub decoder_start_token_id: u32,
    #[serde(default = "default_true")]
    pub scale_embedding: bool,
    #[serde(default = "default_true", rename = "encoder_normalize_before")]
    pub normalize_before: bool,
    #[serde(default = "default_true")]
    pub layernorm_embedding: bool,
    #[serde(default, rename = "activation_function")]
    pub activation: Activation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Gelu,
    Relu,
}

fn default_layers() -> usize {
    18
}

fn default_embed_dim() -> usize {
    512
}

fn default_ffn_dim() -> usize {
    2048
}

fn default_heads() -> usize {
    8
}

fn default_encoder_vocab() -> usize {
    32322
}

fn default_decoder_vocab() -> usize {
    122672
}

fn default_positions() -> usize {
    256
}

fn default_pad() -> u32 {
    1
}

fn default_bos() -> u32 {
    0
}

fn default_eos() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

/// Additive masks use the dtype's most negative representable value
/// rather than -inf, so masked-but-unattended positions never turn
/// into NaN under `0 * -inf`.
fn mask_floor(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => -65_504.0,
        _ => f32::MIN as f64,
    }
}

/// Fixed sinusoidal position table with the padding slot zeroed.
fn sinusoidal_positions(
    num_positions: usize,
    embed_dim: usize,
    padding_idx: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let half_dim = embed_dim / 2;
    let scale = (10_000f64).ln() / (half_dim - 1) as f64;

    let mut table = vec![0f32; num_positions * embed_dim];
    for pos in 0..num_positions {
        if pos == padding_idx {
            continue;
        }
        for i in 0..half_dim {
            let angle = pos as f64 * (-scale * i as f64).exp();
            table[pos * embed_dim + i] = angle.sin() as f32;
            table[pos * embed_dim + half_dim + i] = angle.cos() as f32;
        }
    }
    Tensor::from_vec(table, (num_positions, embed_dim), device)
}

struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiHeadAttention {
    fn new(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let head_dim = embed_dim / num_heads;
        Ok(Self {
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        let (batch, tgt_len, _) = query.dims3()?;
        let (_, src_len, _) = key.dims3()?;

        let q = self
            .q_proj
            .forward(query)?
            .reshape((batch, tgt_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(key)?
            .reshape((batch, src_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(value)?
            .reshape((batch, src_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let weights = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let weights = match mask {
            Some(mask) => weights.broadcast_add(mask)?,
            None => weights,
        };
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;

        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, tgt_len, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&context)
    }
}

struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl FeedForward {
    fn new(
        embed_dim: usize,
        ffn_dim: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            fc1: linear(embed_dim, ffn_dim, vb.pp("fc1"))?,
            fc2: linear(ffn_dim, embed_dim, vb.pp("fc2"))?,
            activation,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.fc1.forward(xs)?;
        let xs = match self.activation {
            Activation::Gelu => xs.gelu()?,
            Activation::Relu => xs.relu()?,
        };
        self.fc2.forward(&xs)
    }
}

struct EncoderLayer {
    self_attn: MultiHeadAttention,
    self_attn_norm: LayerNorm,
    ffn: FeedForward,
    final_norm: LayerNorm,
    normalize_before: bool,
}

impl EncoderLayer {
    fn new(config: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let dim = config.encoder_embed_dim;
        Ok(Self {
            self_attn: MultiHeadAttention::new(
                dim,
                config.encoder_attention_heads,
                vb.pp("self_attn"),
            )?,
            self_attn_norm: layer_norm(dim, 1e-5, vb.pp("self_attn_layer_norm"))?,
            ffn: FeedForward::new(dim, config.encoder_ffn_dim, config.activation, vb.clone())?,
            final_norm: layer_norm(dim, 1e-5, vb.pp("final_layer_norm"))?,
            normalize_before: config.normalize_before,
        })
    }

    fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> candle_core::Result<Tensor> {
        let residual = xs;
        let hidden = if self.normalize_before {
            self.self_attn_norm.forward(xs)?
        } else {
            xs.clone()
        };
        let hidden = self.self_attn.forward(&hidden, &hidden, &hidden, mask)?;
        let hidden = (residual + hidden)?;
        let hidden = if self.normalize_before {
            hidden
        } else {
            self.self_attn_norm.forward(&hidden)?
        };

        let residual = &hidden;
        let ff_input = if self.normalize_before {
            self.final_norm.forward(&hidden)?
        } else {
            hidden.clone()
        };
        let ff = self.ffn.forward(&ff_input)?;
        let out = (residual + ff)?;
        if self.normalize_before {
            Ok(out)
        } else {
            self.final_norm.forward(&out)
        }
    }
}

struct DecoderLayer {
    self_attn: MultiHeadAttention,
    self_attn_norm: LayerNorm,
    cross_attn: MultiHeadAttention,
    cross_attn_norm: LayerNorm,
    ffn: FeedForward,
    final_norm: LayerNorm,
    normalize_before: bool,
}

impl DecoderLayer {
    fn new(config: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let dim = config.decoder_embed_dim;
        Ok(Self {
            self_attn: MultiHeadAttention::new(
                dim,
                config.decoder_attention_heads,
                vb.pp("self_attn"),
            )?,
            self_attn_norm: layer_norm(dim, 1e-5, vb.pp("self_attn_layer_norm"))?,
            cross_attn: MultiHeadAttention::new(
                dim,
                config.decoder_attention_heads,
                vb.pp("encoder_attn"),
            )?,
            cross_attn_norm: layer_norm(dim, 1e-5, vb.pp("encoder_attn_layer_norm"))?,
            ffn: FeedForward::new(dim, config.decoder_ffn_dim, config.activation, vb.clone())?,
            final_norm: layer_norm(dim, 1e-5, vb.pp("final_layer_norm"))?,
            normalize_before: config.normalize_before,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        encoder_states: &Tensor,
        causal_mask: &Tensor,
        encoder_mask: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        let residual = xs;
        let hidden = if self.normalize_before {
            self.self_attn_norm.forward(xs)?
        } else {
            xs.clone()
        };
        let hidden = self
            .self_attn
            .forward(&hidden, &hidden, &hidden, Some(causal_mask))?;
        let hidden = (residual + hidden)?;
        let hidden = if self.normalize_before {
            hidden
        } else {
            self.self_attn_norm.forward(&hidden)?
        };

        let residual = &hidden;
        let cross_input = if self.normalize_before {
            self.cross_attn_norm.forward(&hidden)?
        } else {
            hidden.clone()
        };
        let cross =
            self.cross_attn
                .forward(&cross_input, encoder_states, encoder_states, encoder_mask)?;
        let hidden = (residual + cross)?;
        let hidden = if self.normalize_before {
            hidden
        } else {
            self.cross_attn_norm.forward(&hidden)?
        };

        let residual = &hidden;
        let ff_input = if self.normalize_before {
            self.final_norm.forward(&hidden)?
        } else {
            hidden.clone()
        };
        let ff = self.ffn.forward(&ff_input)?;
        let out = (residual + ff)?;
        if self.normalize_before {
            Ok(out)
        } else {
            self.final_norm.forward(&out)
        }
    }
}

struct Encoder {
    embed_tokens: Embedding,
    embed_positions: Tensor,
    embed_scale: f64,
    embed_norm: Option<LayerNorm>,
    layers: Vec<EncoderLayer>,
    final_norm: Option<LayerNorm>,
    padding_idx: usize,
}

impl Encoder {
    fn new(config: &ModelConfig, vb: VarBuilder, device: &Device) -> candle_core::Result<Self> {
        let dim = config.encoder_embed_dim;
        let embed_positions = sinusoidal_positions(
            config.max_source_positions + 2,
            dim,
            config.pad_token_id as usize,
            device,
        )?
        .to_dtype(vb.dtype())?;

        let layers = (0..config.encoder_layers)
            .map(|i| EncoderLayer::new(config, vb.pp(format!("layers.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            embed_tokens: embedding(config.encoder_vocab_size, dim, vb.pp("embed_tokens"))?,
            embed_positions,
            embed_scale: if config.scale_embedding {
                (dim as f64).sqrt()
            } else {
                1.0
            },
            embed_norm: if config.layernorm_embedding {
                Some(layer_norm(dim, 1e-5, vb.pp("layernorm_embedding"))?)
            } else {
                None
            },
            layers,
            final_norm: if config.normalize_before {
                Some(layer_norm(dim, 1e-5, vb.pp("layer_norm"))?)
            } else {
                None
            },
            padding_idx: config.pad_token_id as usize,
        })
    }

    fn forward(&self, input_ids: &Tensor, mask: Option<&Tensor>) -> candle_core::Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;

        let embeds = (self.embed_tokens.forward(input_ids)? * self.embed_scale)?;
        let positions = position_slice(
            &self.embed_positions,
            self.padding_idx,
            seq_len,
            batch,
            input_ids.device(),
        )?;
        let mut hidden = embeds.add(&positions)?;

        if let Some(norm) = &self.embed_norm {
            hidden = norm.forward(&hidden)?;
        }
        for layer in &self.layers {
            hidden = layer.forward(&hidden, mask)?;
        }
        if let Some(norm) = &self.final_norm {
            hidden = norm.forward(&hidden)?;
        }
        Ok(hidden)
    }
}

struct Decoder {
    embed_tokens: Embedding,
    embed_positions: Tensor,
    embed_scale: f64,
    embed_norm: Option<LayerNorm>,
    layers: Vec<DecoderLayer>,
    final_norm: Option<LayerNorm>,
    padding_idx: usize,
}

impl Decoder {
    fn new(config: &ModelConfig, vb: VarBuilder, device: &Device) -> candle_core::Result<Self> {
        let dim = config.decoder_embed_dim;
        let embed_positions = sinusoidal_positions(
            config.max_target_positions + 2,
            dim,
            config.pad_token_id as usize,
            device,
        )?
        .to_dtype(vb.dtype())?;

        let layers = (0..config.decoder_layers)
            .map(|i| DecoderLayer::new(config, vb.pp(format!("layers.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            embed_tokens: embedding(config.decoder_vocab_size, dim, vb.pp("embed_tokens"))?,
            embed_positions,
            embed_scale: if config.scale_embedding {
                (dim as f64).sqrt()
            } else {
                1.0
            },
            embed_norm: if config.layernorm_embedding {
                Some(layer_norm(dim, 1e-5, vb.pp("layernorm_embedding"))?)
            } else {
                None
            },
            layers,
            final_norm: if config.normalize_before {
                Some(layer_norm(dim, 1e-5, vb.pp("layer_norm"))?)
            } else {
                None
            },
            padding_idx: config.pad_token_id as usize,
        })
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        encoder_states: &Tensor,
        encoder_mask: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;

        let embeds = (self.embed_tokens.forward(input_ids)? * self.embed_scale)?;
        let positions = position_slice(
            &self.embed_positions,
            self.padding_idx,
            seq_len,
            batch,
            input_ids.device(),
        )?;
        let mut hidden = embeds.add(&positions)?;

        if let Some(norm) = &self.embed_norm {
            hidden = norm.forward(&hidden)?;
        }

        let causal = causal_mask(seq_len, hidden.dtype(), input_ids.device())?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, encoder_states, &causal, encoder_mask)?;
        }
        if let Some(norm) = &self.final_norm {
            hidden = norm.forward(&hidden)?;
        }
        Ok(hidden)
    }
}

/// Slice `seq_len` rows from the position table, offset past the
/// padding slot, broadcast to the batch.
fn position_slice(
    table: &Tensor,
    padding_idx: usize,
    seq_len: usize,
    batch: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let ids: Vec<u32> = (0..seq_len).map(|i| (padding_idx + 1 + i) as u32).collect();
    let ids = Tensor::new(ids.as_slice(), device)?;
    let positions = table.index_select(&ids, 0)?;
    let dim = positions.dim(1)?;
    positions.unsqueeze(0)?.broadcast_as((batch, seq_len, dim))
}

/// Lower-triangular additive mask: future positions get the dtype
/// floor, attended positions stay 0.
fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
    let floor = mask_floor(dtype) as f32;
    let mut data = vec![0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            data[i * seq_len + j] = floor;
        }
    }
    Tensor::from_vec(data, (seq_len, seq_len), device)?
        .to_dtype(dtype)?
        .unsqueeze(0)?
        .unsqueeze(0)
}

pub struct IndicTransModel {
    encoder: Encoder,
    decoder: Decoder,
    lm_head: Linear,
    config: ModelConfig,
    ctx: ExecutionContext,
}

impl IndicTransModel {
    pub fn load(model_dir: &Path, ctx: ExecutionContext) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(model_dir.join("config.json"))
            .map_err(|e| ServiceError::startup(format!("model config: {e}")))?;
        let config: ModelConfig = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::startup(format!("model config: {e}")))?;

        let weights = model_dir.join("model.safetensors");
        // Mmapped weights; safe as long as the file is not mutated
        // while the process runs.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], ctx.dtype, &ctx.device)
                .map_err(ServiceError::startup)?
        };

        let encoder = Encoder::new(&config, vb.pp("model.encoder"), &ctx.device)
            .map_err(ServiceError::startup)?;
        let decoder = Decoder::new(&config, vb.pp("model.decoder"), &ctx.device)
            .map_err(ServiceError::startup)?;
        let lm_head = linear_no_bias(
            config.decoder_embed_dim,
            config.decoder_vocab_size,
            vb.pp("lm_head"),
        )
        .map_err(ServiceError::startup)?;

        Ok(Self {
            encoder,
            decoder,
            lm_head,
            config,
            ctx,
        })
    }

    /// Additive padding mask of shape (batch, 1, 1, src_len).
    fn encoder_mask(&self, batch: &TokenBatch) -> candle_core::Result<Tensor> {
        let width = batch.width();
        let flat: Vec<f32> = batch
            .attention_mask
            .iter()
            .flat_map(|row| row.iter().map(|&m| f32::from(m)))
            .collect();
        let mask = Tensor::from_vec(flat, (batch.len(), width), &self.ctx.device)?
            .to_dtype(self.ctx.dtype)?;
        let floor = mask_floor(self.ctx.dtype);
        // mask * -floor + floor: 0 where attended, floor where padded.
        mask.affine(-floor, floor)?.unsqueeze(1)?.unsqueeze(1)
    }

    fn greedy_decode(
        &self,
        encoder_states: &Tensor,
        encoder_mask: &Tensor,
        batch_size: usize,
        max_length: usize,
    ) -> candle_core::Result<Vec<Vec<u32>>> {
        let start = self.config.decoder_start_token_id;
        let eos = self.config.eos_token_id;
        let pad = self.config.pad_token_id;

        let mut rows: Vec<Vec<u32>> = vec![vec![start]; batch_size];
        let mut finished = vec![false; batch_size];

        for _ in 0..max_length {
            let cur_len = rows[0].len();
            let flat: Vec<u32> = rows.iter().flatten().copied().collect();
            let decoder_input =
                Tensor::from_vec(flat, (batch_size, cur_len), &self.ctx.device)?;

            let hidden =
                self.decoder
                    .forward(&decoder_input, encoder_states, Some(encoder_mask))?;
            let logits = self.lm_head.forward(&hidden)?;
            let last = logits.narrow(1, cur_len - 1, 1)?.squeeze(1)?;
            let next = last
                .to_dtype(DType::F32)?
                .argmax(D::Minus1)?
                .to_vec1::<u32>()?;

            for (i, &token) in next.iter().enumerate() {
                if finished[i] {
                    rows[i].push(pad);
                } else if token == eos {
                    finished[i] = true;
                    rows[i].push(eos);
                } else {
                    rows[i].push(token);
                }
            }
            if finished.iter().all(|&done| done) {
                break;
            }
        }
        Ok(rows)
    }
}

impl GenerativeModel for IndicTransModel {
    fn generate(
        &self,
        batch: &TokenBatch,
        options: &GenerationOptions,
    ) -> Result<Vec<Vec<u32>>, ServiceError> {
        if options.num_beams != 1 {
            return Err(ServiceError::ModelExecution(format!(
                "unsupported beam width {}; only greedy decoding is available",
                options.num_beams
            )));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = batch.len();
        let width = batch.width();
        let flat: Vec<u32> = batch.input_ids.iter().flatten().copied().collect();
        let input_ids = Tensor::from_vec(flat, (batch_size, width), &self.ctx.device)?;
        let encoder_mask = self.encoder_mask(batch)?;

        let encoder_states = self.encoder.forward(&input_ids, Some(&encoder_mask))?;
        let rows = self.greedy_decode(&encoder_states, &encoder_mask, batch_size, options.max_length)?;
        Ok(rows)
    }
}
