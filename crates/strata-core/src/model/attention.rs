//! Grouped-query self-attention.
//!
//! Queries keep the full head count while keys and values may use fewer
//! heads; KV heads are repeated in contiguous blocks to match. Score
//! computation and softmax run in f32 regardless of the working dtype.
//!
//! The sequential decoder variant projects Q, K and V through one fused
//! matrix; the parallel variant uses separate biased projections and can
//! normalize queries and keys per head before rotation.

use crate::error::Result;
use crate::model::kv_cache::LayerCache;
use crate::model::linear::{Linear, Projection};
use crate::model::norm::LayerNorm;
use crate::model::rope::RotaryEmbedding;
use crate::quantization::QuantMode;
use candle_core::{DType, Device, Tensor, D};

/// Query/key/value projection, fused or split.
#[derive(Debug, Clone)]
pub enum QkvProjection {
    /// One matrix producing `[q | k | v]` slices (sequential variant).
    Fused(Projection),
    /// Separate projections with biases (parallel variant).
    Split {
        /// Query projection: hidden -> num_heads * head_dim
        q_proj: Projection,
        /// Key projection: hidden -> num_kv_heads * head_dim
        k_proj: Projection,
        /// Value projection: hidden -> num_kv_heads * head_dim
        v_proj: Projection,
    },
}

impl QkvProjection {
    /// Parameter storage in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            QkvProjection::Fused(proj) => proj.size_in_bytes(),
            QkvProjection::Split {
                q_proj,
                k_proj,
                v_proj,
            } => q_proj.size_in_bytes() + k_proj.size_in_bytes() + v_proj.size_in_bytes(),
        }
    }

    /// Quantize the projection weights.
    pub fn quantize(self, mode: QuantMode) -> Result<Self> {
        Ok(match self {
            QkvProjection::Fused(proj) => QkvProjection::Fused(proj.quantize(mode)?),
            QkvProjection::Split {
                q_proj,
                k_proj,
                v_proj,
            } => QkvProjection::Split {
                q_proj: q_proj.quantize(mode)?,
                k_proj: k_proj.quantize(mode)?,
                v_proj: v_proj.quantize(mode)?,
            },
        })
    }

    /// Copy the parameters onto another device.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(match self {
            QkvProjection::Fused(proj) => QkvProjection::Fused(proj.to_device(device)?),
            QkvProjection::Split {
                q_proj,
                k_proj,
                v_proj,
            } => QkvProjection::Split {
                q_proj: q_proj.to_device(device)?,
                k_proj: k_proj.to_device(device)?,
                v_proj: v_proj.to_device(device)?,
            },
        })
    }
}

/// Self-attention module for decoder layers.
#[derive(Debug, Clone)]
pub struct Attention {
    /// Query/key/value projection.
    qkv: QkvProjection,
    /// Output projection: num_heads * head_dim -> hidden_size
    o_proj: Projection,
    /// Optional per-head query normalization (applied before RoPE).
    q_norm: Option<LayerNorm>,
    /// Optional per-head key normalization (applied before RoPE).
    k_norm: Option<LayerNorm>,
    /// Number of attention heads.
    num_heads: usize,
    /// Number of key-value heads (for GQA).
    num_kv_heads: usize,
    /// Head dimension.
    head_dim: usize,
    /// Hidden size.
    hidden_size: usize,
}

impl Attention {
    /// Create attention with provided projections.
    pub fn new(
        qkv: QkvProjection,
        o_proj: Projection,
        q_norm: Option<LayerNorm>,
        k_norm: Option<LayerNorm>,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> Result<Self> {
        let hidden_size = o_proj.out_features();
        Ok(Self {
            qkv,
            o_proj,
            q_norm,
            k_norm,
            num_heads,
            num_kv_heads,
            head_dim,
            hidden_size,
        })
    }

    /// Create attention with random split projections (for testing).
    pub fn random(
        hidden_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        let q_proj = Linear::random(hidden_size, num_heads * head_dim, false, device)?;
        let k_proj = Linear::random(hidden_size, num_kv_heads * head_dim, false, device)?;
        let v_proj = Linear::random(hidden_size, num_kv_heads * head_dim, false, device)?;
        let o_proj = Linear::random(num_heads * head_dim, hidden_size, false, device)?;

        Self::new(
            QkvProjection::Split {
                q_proj: Projection::Dense(q_proj),
                k_proj: Projection::Dense(k_proj),
                v_proj: Projection::Dense(v_proj),
            },
            Projection::Dense(o_proj),
            None,
            None,
            num_heads,
            num_kv_heads,
            head_dim,
        )
    }

    /// Create attention with a random fused projection (for testing).
    pub fn random_fused(
        hidden_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        let qkv_size = (num_heads + 2 * num_kv_heads) * head_dim;
        let qkv_proj = Linear::random(hidden_size, qkv_size, false, device)?;
        let o_proj = Linear::random(num_heads * head_dim, hidden_size, false, device)?;

        Self::new(
            QkvProjection::Fused(Projection::Dense(qkv_proj)),
            Projection::Dense(o_proj),
            None,
            None,
            num_heads,
            num_kv_heads,
            head_dim,
        )
    }

    /// Compute Q, K, V projections.
    ///
    /// Returns (query, key, value) tensors reshaped for attention:
    /// - query: [batch, num_heads, seq_len, head_dim]
    /// - key: [batch, num_kv_heads, seq_len, head_dim]
    /// - value: [batch, num_kv_heads, seq_len, head_dim]
    pub fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, seq_len, _) = x.dims3()?;
        let q_size = self.num_heads * self.head_dim;
        let kv_size = self.num_kv_heads * self.head_dim;

        let (q, k, v) = match &self.qkv {
            QkvProjection::Fused(proj) => {
                // One matmul, sliced as [query | key | value]
                let qkv = proj.forward(x)?;
                let q = qkv.narrow(D::Minus1, 0, q_size)?;
                let k = qkv.narrow(D::Minus1, q_size, kv_size)?;
                let v = qkv.narrow(D::Minus1, q_size + kv_size, kv_size)?;
                (q, k, v)
            }
            QkvProjection::Split {
                q_proj,
                k_proj,
                v_proj,
            } => (q_proj.forward(x)?, k_proj.forward(x)?, v_proj.forward(x)?),
        };

        // Reshape to [batch, seq, heads, head_dim] then transpose
        let q = q
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        // Per-head normalization on the 4D view
        let q = match &self.q_norm {
            Some(norm) => norm.forward(&q)?,
            None => q,
        };
        let k = match &self.k_norm {
            Some(norm) => norm.forward(&k)?,
            None => k,
        };

        Ok((q, k, v))
    }

    /// Apply output projection after attention.
    ///
    /// Input: [batch, num_heads, seq_len, head_dim]
    /// Output: [batch, seq_len, hidden_size]
    pub fn output(&self, attn_output: &Tensor) -> Result<Tensor> {
        let dims = attn_output.dims();
        let batch = dims[0];
        let seq_len = dims[2];

        // Transpose and merge heads: [batch, seq, num_heads * head_dim]
        let x = attn_output.transpose(1, 2)?;
        let x = x.reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        self.o_proj.forward(&x)
    }

    /// Full attention forward with KV cache.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Input tensor [batch, seq_len, hidden_size]
    /// * `rope` - Rotary position embeddings
    /// * `cache` - Layer KV cache to read from and update
    /// * `position_offset` - Absolute position of the first new token
    /// * `attention_mask` - Optional additive mask [batch, 1, seq_len, kv_len]
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        cache: &mut LayerCache,
        position_offset: usize,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (q, k, v) = self.project(hidden_states)?;

        // Rotate new tokens at their absolute positions
        let (q, k) = rope.apply(&q, &k, position_offset)?;

        // Append K, V to cache and attend over the full history
        let (full_k, full_v) = cache.append(&k, &v)?;
        let attn_output = self.compute_attention(&q, &full_k, &full_v, attention_mask)?;

        self.output(&attn_output)
    }

    /// Compute scaled dot-product attention.
    ///
    /// Scores and softmax run in f32; the weighted sum over values runs
    /// in the value dtype.
    fn compute_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let scale = 1.0 / (self.head_dim as f64).sqrt();

        // Handle GQA: expand K, V to match Q heads
        let (k, v) = if self.num_heads != self.num_kv_heads {
            let repeat = self.num_heads / self.num_kv_heads;
            (Self::repeat_kv(k, repeat)?, Self::repeat_kv(v, repeat)?)
        } else {
            (k.clone(), v.clone())
        };

        // Attention scores: Q @ K^T / sqrt(d), in f32
        let q = q.to_dtype(DType::F32)?;
        let k_t = k.to_dtype(DType::F32)?.transpose(2, 3)?;
        let scores = (q.matmul(&k_t)? * scale)?;

        let scores = if let Some(mask) = mask {
            scores.broadcast_add(&mask.to_dtype(DType::F32)?)?
        } else {
            scores
        };

        // Softmax in f32, then back to the value dtype
        let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn_weights = attn_weights.to_dtype(v.dtype())?;

        // Attention output: weights @ V (the CPU matmul needs a contiguous rhs)
        Ok(attn_weights.matmul(&v.contiguous()?)?)
    }

    /// Repeat KV heads in contiguous blocks for GQA.
    pub fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
        if repeat == 1 {
            return Ok(x.clone());
        }

        let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;

        // [batch, num_kv_heads, seq, head_dim] -> [batch, num_kv_heads, repeat, seq, head_dim]
        let x = x.unsqueeze(2)?;
        let x = x.expand(&[batch, num_kv_heads, repeat, seq_len, head_dim])?;
        // Collapse so repeats of each head stay adjacent
        Ok(x.reshape((batch, num_kv_heads * repeat, seq_len, head_dim))?)
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Parameter storage in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.qkv.size_in_bytes() + self.o_proj.size_in_bytes()
    }

    /// Quantize the attention projections.
    pub fn quantize(self, mode: QuantMode) -> Result<Self> {
        let Self {
            qkv,
            o_proj,
            q_norm,
            k_norm,
            num_heads,
            num_kv_heads,
            head_dim,
            hidden_size,
        } = self;
        Ok(Self {
            qkv: qkv.quantize(mode)?,
            o_proj: o_proj.quantize(mode)?,
            q_norm,
            k_norm,
            num_heads,
            num_kv_heads,
            head_dim,
            hidden_size,
        })
    }

    /// Copy the parameters onto another device.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            qkv: self.qkv.to_device(device)?,
            o_proj: self.o_proj.to_device(device)?,
            q_norm: self
                .q_norm
                .as_ref()
                .map(|n| n.to_device(device))
                .transpose()?,
            k_norm: self
                .k_norm
                .as_ref()
                .map(|n| n.to_device(device))
                .transpose()?,
            num_heads: self.num_heads,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            hidden_size: self.hidden_size,
        })
    }
}

/// Smallest finite value representable in `dtype`, used to mask scores.
fn dtype_min_value(dtype: DType) -> f32 {
    match dtype {
        DType::F16 => half::f16::MIN.to_f32(),
        DType::BF16 => half::bf16::MIN.to_f32(),
        _ => f32::MIN,
    }
}

/// Create an additive causal attention mask.
///
/// The mask covers `tgt_len` query rows over `past_len + tgt_len` key
/// columns. A position is masked with the dtype's most negative finite
/// value when it lies in the future, or (with a sliding window) when it
/// has fallen out of the window.
///
/// Returns a `[1, 1, tgt_len, past_len + tgt_len]` tensor.
pub fn create_causal_mask(
    tgt_len: usize,
    past_len: usize,
    sliding_window: Option<usize>,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let kv_len = past_len + tgt_len;
    let min_value = dtype_min_value(dtype);
    let mut mask_data = vec![0.0f32; tgt_len * kv_len];

    for i in 0..tgt_len {
        let query_pos = i + past_len;
        for j in 0..kv_len {
            let in_future = j > query_pos;
            let out_of_window = match sliding_window {
                Some(window) => j + window <= query_pos,
                None => false,
            };
            if in_future || out_of_window {
                mask_data[i * kv_len + j] = min_value;
            }
        }
    }

    let mask = Tensor::from_slice(&mask_data, (tgt_len, kv_len), device)?.to_dtype(dtype)?;

    // Add batch and head dimensions: [1, 1, tgt_len, kv_len]
    Ok(mask.unsqueeze(0)?.unsqueeze(0)?)
}

/// Merge a padding mask into a causal mask.
///
/// `padding_mask` is `[batch, kv_len]` with 1 for real tokens and 0 for
/// padding. Padded key columns are overwritten with the dtype's most
/// negative finite value; causally masked positions already hold it.
///
/// Returns a `[batch, 1, tgt_len, kv_len]` tensor.
pub fn combine_padding_mask(causal_mask: &Tensor, padding_mask: &Tensor) -> Result<Tensor> {
    let (batch, kv_len) = padding_mask.dims2()?;
    let tgt_len = causal_mask.dims()[2];
    let dtype = causal_mask.dtype();
    let device = causal_mask.device();

    let shape = (batch, 1, tgt_len, kv_len);
    let expanded = causal_mask.broadcast_as(shape)?;

    // 1 where the key column is padding
    let padded = padding_mask
        .reshape((batch, 1, 1, kv_len))?
        .to_dtype(DType::F32)?
        .eq(0.0)?
        .broadcast_as(shape)?;

    let fill = Tensor::full(dtype_min_value(dtype), shape, device)?.to_dtype(dtype)?;
    Ok(padded.where_cond(&fill, &expanded)?)
}
