//! Feed-forward blocks.
//!
//! The sequential decoder variant uses a gated unit with a fused
//! gate/up projection; the parallel variant uses a plain two-layer
//! block with biases.
//!
//! # Formulas
//!
//! `Gated(x) = (up * act(gate)) @ down^T` where `[gate, up] = x @ gate_up^T`
//!
//! `Plain(x) = act(x @ fc1^T + b1) @ fc2^T + b2`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use crate::error::Result;
use crate::model::config::Activation;
use crate::model::linear::{Linear, Projection};
use crate::quantization::QuantMode;
use candle_core::{Device, Tensor, D};

/// Gated feed-forward block with a fused gate/up projection.
#[derive(Debug, Clone)]
pub struct GatedMlp {
    /// Fused projection: hidden -> 2 * intermediate
    gate_up_proj: Projection,
    /// Down projection: intermediate -> hidden
    down_proj: Projection,
    /// Activation applied to the gate half.
    activation: Activation,
    /// Hidden dimension.
    hidden_size: usize,
    /// Intermediate dimension.
    intermediate_size: usize,
}

impl GatedMlp {
    /// Create a new gated MLP from its projections.
    pub fn new(
        gate_up_proj: Projection,
        down_proj: Projection,
        activation: Activation,
    ) -> Result<Self> {
        let hidden_size = gate_up_proj.in_features();
        let intermediate_size = gate_up_proj.out_features() / 2;
        Ok(Self {
            gate_up_proj,
            down_proj,
            activation,
            hidden_size,
            intermediate_size,
        })
    }

    /// Create a gated MLP with random weights (for testing).
    pub fn random(hidden_size: usize, intermediate_size: usize, device: &Device) -> Result<Self> {
        let gate_up = Linear::random(hidden_size, 2 * intermediate_size, false, device)?;
        let down = Linear::random(intermediate_size, hidden_size, false, device)?;
        Self::new(
            Projection::Dense(gate_up),
            Projection::Dense(down),
            Activation::Silu,
        )
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // x @ gate_up^T -> [..., 2 * intermediate_size]
        let gate_up = self.gate_up_proj.forward(x)?;

        // Gate occupies the first half, up the second
        let gate = gate_up.narrow(D::Minus1, 0, self.intermediate_size)?;
        let up = gate_up.narrow(D::Minus1, self.intermediate_size, self.intermediate_size)?;

        // up * act(gate)
        let activated = (up * self.activation.forward(&gate)?)?;

        // activated @ down^T -> [..., hidden_size]
        self.down_proj.forward(&activated)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }
}

/// Plain two-layer feed-forward block with biases.
#[derive(Debug, Clone)]
pub struct PlainMlp {
    /// First projection: hidden -> intermediate
    fc1: Projection,
    /// Second projection: intermediate -> hidden
    fc2: Projection,
    /// Activation between the two projections.
    activation: Activation,
    /// Hidden dimension.
    hidden_size: usize,
    /// Intermediate dimension.
    intermediate_size: usize,
}

impl PlainMlp {
    /// Create a new plain MLP from its projections.
    pub fn new(fc1: Projection, fc2: Projection, activation: Activation) -> Result<Self> {
        let hidden_size = fc1.in_features();
        let intermediate_size = fc1.out_features();
        Ok(Self {
            fc1,
            fc2,
            activation,
            hidden_size,
            intermediate_size,
        })
    }

    /// Create a plain MLP with random weights (for testing).
    pub fn random(hidden_size: usize, intermediate_size: usize, device: &Device) -> Result<Self> {
        let fc1 = Linear::random(hidden_size, intermediate_size, true, device)?;
        let fc2 = Linear::random(intermediate_size, hidden_size, true, device)?;
        Self::new(
            Projection::Dense(fc1),
            Projection::Dense(fc2),
            Activation::GeluNew,
        )
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(x)?;
        let activated = self.activation.forward(&hidden)?;
        self.fc2.forward(&activated)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }
}

/// Feed-forward block for either decoder variant.
#[derive(Debug, Clone)]
pub enum Mlp {
    /// Gated unit (sequential variant).
    Gated(GatedMlp),
    /// Plain two-layer block (parallel variant).
    Plain(PlainMlp),
}

impl Mlp {
    /// Forward pass, dispatching on the variant.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Mlp::Gated(mlp) => mlp.forward(x),
            Mlp::Plain(mlp) => mlp.forward(x),
        }
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        match self {
            Mlp::Gated(mlp) => mlp.hidden_size(),
            Mlp::Plain(mlp) => mlp.hidden_size(),
        }
    }

    /// Parameter storage in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Mlp::Gated(mlp) => {
                mlp.gate_up_proj.size_in_bytes() + mlp.down_proj.size_in_bytes()
            }
            Mlp::Plain(mlp) => mlp.fc1.size_in_bytes() + mlp.fc2.size_in_bytes(),
        }
    }

    /// Quantize the block's projections in place.
    pub fn quantize(self, mode: QuantMode) -> Result<Self> {
        Ok(match self {
            Mlp::Gated(mlp) => {
                let GatedMlp {
                    gate_up_proj,
                    down_proj,
                    activation,
                    hidden_size,
                    intermediate_size,
                } = mlp;
                Mlp::Gated(GatedMlp {
                    gate_up_proj: gate_up_proj.quantize(mode)?,
                    down_proj: down_proj.quantize(mode)?,
                    activation,
                    hidden_size,
                    intermediate_size,
                })
            }
            Mlp::Plain(mlp) => {
                let PlainMlp {
                    fc1,
                    fc2,
                    activation,
                    hidden_size,
                    intermediate_size,
                } = mlp;
                Mlp::Plain(PlainMlp {
                    fc1: fc1.quantize(mode)?,
                    fc2: fc2.quantize(mode)?,
                    activation,
                    hidden_size,
                    intermediate_size,
                })
            }
        })
    }

    /// Copy the parameters onto another device.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(match self {
            Mlp::Gated(mlp) => Mlp::Gated(GatedMlp {
                gate_up_proj: mlp.gate_up_proj.to_device(device)?,
                down_proj: mlp.down_proj.to_device(device)?,
                activation: mlp.activation,
                hidden_size: mlp.hidden_size,
                intermediate_size: mlp.intermediate_size,
            }),
            Mlp::Plain(mlp) => Mlp::Plain(PlainMlp {
                fc1: mlp.fc1.to_device(device)?,
                fc2: mlp.fc2.to_device(device)?,
                activation: mlp.activation,
                hidden_size: mlp.hidden_size,
                intermediate_size: mlp.intermediate_size,
            }),
        })
    }
}
