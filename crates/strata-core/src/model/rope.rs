//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. Cos/sin tables cover the full rotary dimension
//! (`emb = cat(freqs, freqs)`), and rotation pairs element `i` with
//! element `i + rotary_dim/2`.
//!
//! Long-context checkpoints ship two per-frequency factor arrays; the
//! long set kicks in once the key/value sequence outgrows the originally
//! trained context, and both tables carry a fixed attention amplitude
//! derived from the context extension ratio.
//!
//! When `partial_rotary_factor < 1`, only the leading slice of each head
//! is rotated and the remainder passes through unchanged.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{Result, StrataError};
use crate::model::ModelConfig;
use candle_core::{Device, Tensor, D};

/// Rotary Position Embedding with optional long-context scaling.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Cosine table for sequences within the original context.
    short_cos: Tensor,
    /// Sine table for sequences within the original context.
    short_sin: Tensor,
    /// Cosine table for sequences beyond the original context.
    long_cos: Tensor,
    /// Sine table for sequences beyond the original context.
    long_sin: Tensor,
    /// Dimension of each attention head.
    head_dim: usize,
    /// Leading head dimensions that receive rotation.
    rotary_dim: usize,
    /// Context length the model was trained at.
    original_max_seq_len: usize,
    /// Maximum sequence length cached.
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Create a new rotary embedding from the model configuration.
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let head_dim = config.head_dim();
        let rotary_dim = config.rotary_dim();
        let max_seq_len = config.max_position_embeddings;
        let original_max_seq_len = config.original_max_positions();
        let half_dim = rotary_dim / 2;

        let (short_factor, long_factor, amplitude) = match config.rope_scaling {
            Some(ref scaling) => {
                if scaling.short_factor.len() != half_dim || scaling.long_factor.len() != half_dim {
                    return Err(StrataError::ConfigError(format!(
                        "rope scaling factors must have {} entries, got {}/{}",
                        half_dim,
                        scaling.short_factor.len(),
                        scaling.long_factor.len()
                    )));
                }
                let scale = max_seq_len as f64 / original_max_seq_len as f64;
                let amplitude = if scale <= 1.0 {
                    1.0
                } else {
                    (1.0 + scale.ln() / (original_max_seq_len as f64).ln()).sqrt()
                };
                (
                    Some(scaling.short_factor.as_slice()),
                    Some(scaling.long_factor.as_slice()),
                    amplitude,
                )
            }
            None => (None, None, 1.0),
        };

        let (short_cos, short_sin) = Self::build_tables(
            rotary_dim,
            max_seq_len,
            config.rope_theta,
            short_factor,
            amplitude,
            device,
        )?;
        let (long_cos, long_sin) = match long_factor {
            Some(_) => Self::build_tables(
                rotary_dim,
                max_seq_len,
                config.rope_theta,
                long_factor,
                amplitude,
                device,
            )?,
            None => (short_cos.clone(), short_sin.clone()),
        };

        Ok(Self {
            short_cos,
            short_sin,
            long_cos,
            long_sin,
            head_dim,
            rotary_dim,
            original_max_seq_len,
            max_seq_len,
        })
    }

    /// Build full-width cos/sin tables [max_seq_len, rotary_dim].
    fn build_tables(
        rotary_dim: usize,
        max_seq_len: usize,
        theta: f64,
        factors: Option<&[f64]>,
        amplitude: f64,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let half_dim = rotary_dim / 2;

        // Inverse frequencies 1 / (theta^(2i/d) * factor_i) for i in [0, d/2)
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| {
                let base = theta.powf(2.0 * i as f64 / rotary_dim as f64);
                let factor = factors.map(|f| f[i]).unwrap_or(1.0);
                (1.0 / (base * factor)) as f32
            })
            .collect();
        let inv_freq = Tensor::from_slice(&inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_slice(&positions, (max_seq_len, 1), device)?;

        // freqs = positions * inv_freq -> [max_seq_len, half_dim],
        // duplicated across both halves of the rotary dimension
        let freqs = positions.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], 1)?;

        let cos = (emb.cos()? * amplitude)?;
        let sin = (emb.sin()? * amplitude)?;
        Ok((cos, sin))
    }

    /// Apply rotary embeddings to query and key tensors.
    ///
    /// The key/value sequence length (`position_offset + seq_len`) selects
    /// between the short- and long-context tables.
    ///
    /// # Arguments
    ///
    /// * `query` - Query tensor [batch, num_heads, seq_len, head_dim]
    /// * `key` - Key tensor [batch, num_kv_heads, seq_len, head_dim]
    /// * `position_offset` - Absolute position of the first token
    pub fn apply(
        &self,
        query: &Tensor,
        key: &Tensor,
        position_offset: usize,
    ) -> Result<(Tensor, Tensor)> {
        let seq_len = query.dims()[2];
        let kv_seq_len = position_offset + seq_len;
        if kv_seq_len > self.max_seq_len {
            return Err(StrataError::InvalidInput(format!(
                "sequence length {} exceeds maximum position embeddings {}",
                kv_seq_len, self.max_seq_len
            )));
        }

        let (cos_cache, sin_cache) = if kv_seq_len > self.original_max_seq_len {
            (&self.long_cos, &self.long_sin)
        } else {
            (&self.short_cos, &self.short_sin)
        };
        let cos = cos_cache
            .narrow(0, position_offset, seq_len)?
            .to_dtype(query.dtype())?;
        let sin = sin_cache
            .narrow(0, position_offset, seq_len)?
            .to_dtype(query.dtype())?;

        let query_rot = self.rotate(query, &cos, &sin)?;
        let key_rot = self.rotate(key, &cos, &sin)?;
        Ok((query_rot, key_rot))
    }

    /// Rotate the leading `rotary_dim` slice of `x`, passing the rest through.
    fn rotate(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        // [1, 1, seq_len, rotary_dim] for broadcasting over batch and heads
        let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.unsqueeze(0)?.unsqueeze(0)?;

        if self.rotary_dim < self.head_dim {
            let x_rot = x.narrow(D::Minus1, 0, self.rotary_dim)?;
            let x_pass = x.narrow(D::Minus1, self.rotary_dim, self.head_dim - self.rotary_dim)?;
            let rotated = (x_rot.broadcast_mul(&cos)?
                + Self::rotate_half(&x_rot)?.broadcast_mul(&sin)?)?;
            Ok(Tensor::cat(&[&rotated, &x_pass], D::Minus1)?)
        } else {
            Ok((x.broadcast_mul(&cos)? + Self::rotate_half(x)?.broadcast_mul(&sin)?)?)
        }
    }

    /// `[x1, x2] -> [-x2, x1]` over the last dimension's halves.
    fn rotate_half(x: &Tensor) -> Result<Tensor> {
        let last_dim = x.dims()[x.dims().len() - 1];
        let half_dim = last_dim / 2;
        let x1 = x.narrow(D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;
        Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
    }

    /// Get the maximum sequence length this embedding supports.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Get the rotated dimension.
    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }
}
