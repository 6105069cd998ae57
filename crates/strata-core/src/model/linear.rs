//! Linear projections and token embeddings.
//!
//! Weights are stored as raw tensors in `[out_features, in_features]`
//! layout and applied as `x @ W^T (+ b)`. The [`Projection`] enum lets a
//! dense projection be swapped for a quantized one without touching the
//! layers that call it.

use crate::error::{Result, StrataError};
use crate::quantization::{QuantMode, QuantizedLinear};
use candle_core::{DType, Device, Tensor};

/// Dense linear projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix [out_features, in_features].
    weight: Tensor,
    /// Optional bias [out_features].
    bias: Option<Tensor>,
    /// Input dimension.
    in_features: usize,
    /// Output dimension.
    out_features: usize,
}

impl Linear {
    /// Create a new linear layer with given weight and optional bias.
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 2 {
            return Err(StrataError::ShapeMismatch(format!(
                "Linear weight must be 2D, got {:?}",
                dims
            )));
        }
        let (out_features, in_features) = (dims[0], dims[1]);
        if let Some(ref b) = bias {
            if b.dims() != [out_features] {
                return Err(StrataError::ShapeMismatch(format!(
                    "Linear bias shape {:?} does not match out_features {}",
                    b.dims(),
                    out_features
                )));
            }
        }
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Create a linear layer with small random weights (for testing).
    pub fn random(
        in_features: usize,
        out_features: usize,
        with_bias: bool,
        device: &Device,
    ) -> Result<Self> {
        let weight = Tensor::randn(0.0f32, 0.02, &[out_features, in_features], device)?;
        let bias = if with_bias {
            Some(Tensor::zeros(out_features, DType::F32, device)?)
        } else {
            None
        };
        Self::new(weight, bias)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., in_features]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims();
        let features = dims[dims.len() - 1];

        // Handle 3D inputs by reshaping to 2D
        let (x_2d, batch_seq) = if dims.len() == 3 {
            let batch = dims[0];
            let seq = dims[1];
            (x.reshape((batch * seq, features))?, Some((batch, seq)))
        } else {
            (x.clone(), None)
        };

        // x @ W^T -> [batch_seq, out_features]
        let mut output = x_2d.matmul(&self.weight.t()?)?;
        if let Some(ref bias) = self.bias {
            output = output.broadcast_add(bias)?;
        }

        // Reshape back to 3D if input was 3D
        let output = if let Some((batch, seq)) = batch_seq {
            output.reshape((batch, seq, self.out_features))?
        } else {
            output
        };

        Ok(output)
    }

    /// Get the input dimension.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Get the output dimension.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Get the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Get the bias tensor, if present.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Parameter storage in bytes.
    pub fn size_in_bytes(&self) -> usize {
        let mut size = self.weight.elem_count() * self.weight.dtype().size_in_bytes();
        if let Some(ref bias) = self.bias {
            size += bias.elem_count() * bias.dtype().size_in_bytes();
        }
        size
    }

    /// Copy the parameters onto another device.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: self.weight.to_device(device)?,
            bias: self
                .bias
                .as_ref()
                .map(|b| b.to_device(device))
                .transpose()?,
            in_features: self.in_features,
            out_features: self.out_features,
        })
    }
}

/// Token embedding table.
#[derive(Debug, Clone)]
pub struct Embedding {
    /// Embedding matrix [vocab_size, hidden_size].
    weight: Tensor,
    /// Vocabulary size.
    vocab_size: usize,
    /// Hidden dimension.
    hidden_size: usize,
}

impl Embedding {
    /// Create a new embedding table with given weight.
    pub fn new(weight: Tensor) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 2 {
            return Err(StrataError::ShapeMismatch(format!(
                "Embedding weight must be 2D, got {:?}",
                dims
            )));
        }
        let (vocab_size, hidden_size) = (dims[0], dims[1]);
        Ok(Self {
            weight,
            vocab_size,
            hidden_size,
        })
    }

    /// Create an embedding table with small random weights (for testing).
    pub fn random(vocab_size: usize, hidden_size: usize, device: &Device) -> Result<Self> {
        let weight = Tensor::randn(0.0f32, 0.02, &[vocab_size, hidden_size], device)?;
        Self::new(weight)
    }

    /// Look up embeddings for token ids.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Token ids [batch, seq_len] (u32)
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let flat = input_ids.reshape(batch * seq_len)?;
        let embeds = self.weight.index_select(&flat, 0)?;
        Ok(embeds.reshape((batch, seq_len, self.hidden_size))?)
    }

    /// Get the vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Get the hidden dimension.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get the embedding matrix.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Parameter storage in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.weight.elem_count() * self.weight.dtype().size_in_bytes()
    }

    /// Copy the parameters onto another device.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: self.weight.to_device(device)?,
            vocab_size: self.vocab_size,
            hidden_size: self.hidden_size,
        })
    }
}

/// A projection that is either dense or weight-quantized.
///
/// Decoder layers hold their projections behind this enum so the
/// whole-model quantization pass can swap representations in place.
#[derive(Debug, Clone)]
pub enum Projection {
    /// Full-precision weights.
    Dense(Linear),
    /// Packed int4/int8 weights with per-row scale and zero-point.
    Quantized(QuantizedLinear),
}

impl Projection {
    /// Forward pass, dispatching on the representation.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Projection::Dense(linear) => linear.forward(x),
            Projection::Quantized(linear) => linear.forward(x),
        }
    }

    /// Get the input dimension.
    pub fn in_features(&self) -> usize {
        match self {
            Projection::Dense(linear) => linear.in_features(),
            Projection::Quantized(linear) => linear.in_features(),
        }
    }

    /// Get the output dimension.
    pub fn out_features(&self) -> usize {
        match self {
            Projection::Dense(linear) => linear.out_features(),
            Projection::Quantized(linear) => linear.out_features(),
        }
    }

    /// Parameter storage in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Projection::Dense(linear) => linear.size_in_bytes(),
            Projection::Quantized(linear) => linear.size_in_bytes(),
        }
    }

    /// Replace a dense projection with its quantized form.
    ///
    /// Quantized projections pass through unchanged.
    pub fn quantize(self, mode: QuantMode) -> Result<Self> {
        match self {
            Projection::Dense(linear) => Ok(Projection::Quantized(
                QuantizedLinear::from_linear(&linear, mode)?,
            )),
            quantized @ Projection::Quantized(_) => Ok(quantized),
        }
    }

    /// Copy the parameters onto another device.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(match self {
            Projection::Dense(linear) => Projection::Dense(linear.to_device(device)?),
            Projection::Quantized(linear) => Projection::Quantized(linear.to_device(device)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_linear(with_bias: bool) -> Linear {
        Linear::random(64, 128, with_bias, &Device::Cpu).unwrap()
    }

    #[test]
    fn linear_creation() {
        let linear = create_test_linear(false);
        assert_eq!(linear.in_features(), 64);
        assert_eq!(linear.out_features(), 128);
        assert!(linear.bias().is_none());
    }

    #[test]
    fn linear_forward_2d() {
        let linear = create_test_linear(true);

        let x = Tensor::randn(0.0f32, 1.0, &[4, 64], &Device::Cpu).unwrap();
        let output = linear.forward(&x).unwrap();

        assert_eq!(output.dims(), &[4, 128]);
    }

    #[test]
    fn linear_forward_3d() {
        let linear = create_test_linear(false);

        let x = Tensor::randn(0.0f32, 1.0, &[2, 16, 64], &Device::Cpu).unwrap();
        let output = linear.forward(&x).unwrap();

        assert_eq!(output.dims(), &[2, 16, 128]);
    }

    #[test]
    fn linear_bias_offsets_output() {
        let weight = Tensor::zeros(&[4, 8], DType::F32, &Device::Cpu).unwrap();
        let bias = Tensor::new(&[1.0f32, 2.0, 3.0, 4.0], &Device::Cpu).unwrap();
        let linear = Linear::new(weight, Some(bias)).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 8], &Device::Cpu).unwrap();
        let output: Vec<f32> = linear
            .forward(&x)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        // Zero weight leaves only the bias
        assert_eq!(output, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn linear_rejects_bad_bias() {
        let weight = Tensor::zeros(&[4, 8], DType::F32, &Device::Cpu).unwrap();
        let bias = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        assert!(Linear::new(weight, Some(bias)).is_err());
    }

    #[test]
    fn linear_size_accounting() {
        let linear = create_test_linear(true);
        // f32 weights: 128*64*4 + 128*4
        assert_eq!(linear.size_in_bytes(), 128 * 64 * 4 + 128 * 4);
    }

    #[test]
    fn embedding_lookup() {
        let embedding = Embedding::random(16, 8, &Device::Cpu).unwrap();

        let ids = Tensor::new(&[[0u32, 3, 15], [7, 7, 1]], &Device::Cpu).unwrap();
        let output = embedding.forward(&ids).unwrap();

        assert_eq!(output.dims(), &[2, 3, 8]);

        // Repeated id must give identical rows
        let row_a: Vec<f32> = output
            .narrow(0, 1, 1)
            .unwrap()
            .narrow(1, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let row_b: Vec<f32> = output
            .narrow(0, 1, 1)
            .unwrap()
            .narrow(1, 1, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(row_a, row_b);
    }

    #[test]
    fn projection_dense_dispatch() {
        let projection = Projection::Dense(create_test_linear(false));

        let x = Tensor::randn(0.0f32, 1.0, &[2, 64], &Device::Cpu).unwrap();
        let output = projection.forward(&x).unwrap();

        assert_eq!(output.dims(), &[2, 128]);
        assert_eq!(projection.in_features(), 64);
        assert_eq!(projection.out_features(), 128);
    }
}
