//! Normalization layers.
//!
//! The sequential decoder variant normalizes with RMSNorm; the parallel
//! variant uses LayerNorm with a bias. Both compute their statistics in
//! f32 regardless of the working dtype and cast back afterwards.
//!
//! # Formulas
//!
//! `RMSNorm(x) = x / sqrt(mean(x^2) + eps) * weight`
//!
//! `LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias`
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::{Result, StrataError};
use candle_core::{DType, Device, Tensor, D};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    /// Hidden dimension.
    hidden_size: usize,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        let hidden_size = weight.dims()[0];
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Create a new RMSNorm layer with ones (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Forward pass.
    ///
    /// Statistics are computed in f32 and the normalized tensor is cast
    /// back to the input dtype before the weight is applied.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;

        // Mean of squares over the last dimension
        let mean_sq = x_f32.sqr()?.mean_keepdim(D::Minus1)?;

        // x / sqrt(mean + eps)
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;
        let normalized = x_f32.broadcast_mul(&rsqrt)?.to_dtype(input_dtype)?;

        let output = normalized.broadcast_mul(&self.weight)?;
        Ok(output)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Get the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Copy the parameters onto another device.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: self.weight.to_device(device)?,
            eps: self.eps,
            hidden_size: self.hidden_size,
        })
    }
}

/// Layer Normalization with bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Learnable shift parameter.
    bias: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    /// Normalized dimension.
    hidden_size: usize,
}

impl LayerNorm {
    /// Create a new LayerNorm layer with given weight and bias.
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Result<Self> {
        let hidden_size = weight.dims()[0];
        if bias.dims() != weight.dims() {
            return Err(StrataError::ShapeMismatch(format!(
                "LayerNorm bias shape {:?} does not match weight shape {:?}",
                bias.dims(),
                weight.dims()
            )));
        }
        Ok(Self {
            weight,
            bias,
            eps,
            hidden_size,
        })
    }

    /// Create a new LayerNorm with identity parameters (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        let bias = Tensor::zeros(hidden_size, DType::F32, device)?;
        Self::new(weight, bias, eps)
    }

    /// Forward pass.
    ///
    /// The full affine transform runs in f32; the result is cast back to
    /// the input dtype.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;

        // Center, then scale by the inverse standard deviation
        let mean = x_f32.mean_keepdim(D::Minus1)?;
        let centered = x_f32.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt = (var + self.eps)?.sqrt()?.recip()?;
        let normalized = centered.broadcast_mul(&rsqrt)?;

        let weight = self.weight.to_dtype(DType::F32)?;
        let bias = self.bias.to_dtype(DType::F32)?;
        let output = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        Ok(output.to_dtype(input_dtype)?)
    }

    /// Get the normalized dimension.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Copy the parameters onto another device.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: self.weight.to_device(device)?,
            bias: self.bias.to_device(device)?,
            eps: self.eps,
            hidden_size: self.hidden_size,
        })
    }
}

/// Normalization layer for either decoder variant.
#[derive(Debug, Clone)]
pub enum Norm {
    /// RMSNorm (sequential variant).
    Rms(RmsNorm),
    /// LayerNorm with bias (parallel variant).
    Layer(LayerNorm),
}

impl Norm {
    /// Forward pass, dispatching on the variant.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Norm::Rms(norm) => norm.forward(x),
            Norm::Layer(norm) => norm.forward(x),
        }
    }

    /// Get the normalized dimension.
    pub fn hidden_size(&self) -> usize {
        match self {
            Norm::Rms(norm) => norm.hidden_size(),
            Norm::Layer(norm) => norm.hidden_size(),
        }
    }

    /// Copy the parameters onto another device.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(match self {
            Norm::Rms(norm) => Norm::Rms(norm.to_device(device)?),
            Norm::Layer(norm) => Norm::Layer(norm.to_device(device)?),
        })
    }

    /// Parameter storage in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Norm::Rms(norm) => norm.weight.elem_count() * norm.weight.dtype().size_in_bytes(),
            Norm::Layer(norm) => {
                norm.weight.elem_count() * norm.weight.dtype().size_in_bytes()
                    + norm.bias.elem_count() * norm.bias.dtype().size_in_bytes()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_rmsnorm(hidden_size: usize) -> RmsNorm {
        RmsNorm::ones(hidden_size, 1e-5, &Device::Cpu).unwrap()
    }

    fn create_test_layernorm(hidden_size: usize) -> LayerNorm {
        LayerNorm::ones(hidden_size, 1e-5, &Device::Cpu).unwrap()
    }

    #[test]
    fn rmsnorm_creation() {
        let norm = create_test_rmsnorm(3072);
        assert_eq!(norm.hidden_size(), 3072);
        assert!((norm.eps() - 1e-5).abs() < 1e-10);
    }

    #[test]
    fn rmsnorm_forward_3d() {
        let norm = create_test_rmsnorm(64);

        // [batch, seq, hidden]
        let x = Tensor::randn(0.0f32, 1.0, &[2, 16, 64], &Device::Cpu).unwrap();
        let output = norm.forward(&x).unwrap();

        assert_eq!(output.dims(), x.dims());
    }

    #[test]
    fn rmsnorm_normalized_magnitude() {
        let norm = create_test_rmsnorm(64);

        let x = Tensor::ones(&[1, 64], DType::F32, &Device::Cpu).unwrap();
        let x = (&x * 2.0).unwrap(); // All values = 2.0

        let output = norm.forward(&x).unwrap();

        // RMS of a constant 2.0 vector is 2.0, so with unit weight every
        // output element is ~1.0.
        let output_vec: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        for val in output_vec {
            assert!((val - 1.0).abs() < 1e-4, "Expected ~1.0, got {}", val);
        }
    }

    #[test]
    fn rmsnorm_preserves_dtype() {
        let norm = RmsNorm::new(
            Tensor::ones(32, DType::F16, &Device::Cpu).unwrap(),
            1e-5,
        )
        .unwrap();

        let x = Tensor::randn(0.0f32, 1.0, &[2, 32], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let output = norm.forward(&x).unwrap();

        assert_eq!(output.dtype(), DType::F16);
    }

    #[test]
    fn layernorm_zero_mean_unit_var() {
        let norm = create_test_layernorm(64);

        let x = Tensor::randn(3.0f32, 2.0, &[4, 64], &Device::Cpu).unwrap();
        let output = norm.forward(&x).unwrap();

        // Identity affine, so each row should come out standardized.
        let mean: f32 = output
            .mean_keepdim(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .map(|v| v.abs())
            .fold(0.0, f32::max);
        assert!(mean < 1e-4, "Row means should be ~0, max |mean| = {}", mean);

        let var: Vec<f32> = output
            .sqr()
            .unwrap()
            .mean_keepdim(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for v in var {
            assert!((v - 1.0).abs() < 1e-2, "Row variance should be ~1, got {}", v);
        }
    }

    #[test]
    fn layernorm_bias_shape_mismatch() {
        let weight = Tensor::ones(64, DType::F32, &Device::Cpu).unwrap();
        let bias = Tensor::zeros(32, DType::F32, &Device::Cpu).unwrap();
        assert!(LayerNorm::new(weight, bias, 1e-5).is_err());
    }

    #[test]
    fn norm_enum_dispatch() {
        let x = Tensor::randn(0.0f32, 1.0, &[2, 8, 64], &Device::Cpu).unwrap();

        let rms = Norm::Rms(create_test_rmsnorm(64));
        let layer = Norm::Layer(create_test_layernorm(64));

        assert_eq!(rms.forward(&x).unwrap().dims(), x.dims());
        assert_eq!(layer.forward(&x).unwrap().dims(), x.dims());
        assert_eq!(rms.hidden_size(), 64);
        assert_eq!(layer.hidden_size(), 64);
    }
}
