//! Dense affine projections.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` or
//! `(rows, in_dim)` and return the same layout with the feature axis
//! mapped to `out_dim`. Weights are stored `(out_dim, in_dim)` and
//! initialised with Glorot-uniform samples; biases start at zero.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::checks;

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Outgoing feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector is applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a biased projection.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_shape(
            "linear.weight",
            &weight,
            &[config.output_dim, config.input_dim],
        )?;
        match (config.bias, &bias) {
            (true, Some(bias)) => {
                checks::expect_shape("linear.bias", bias, &[config.output_dim])?
            }
            (true, None) => {
                return Err(Error::Msg("config expects bias but none supplied".into()))
            }
            (false, Some(_)) => {
                return Err(Error::Msg("bias provided but config disables bias".into()))
            }
            (false, None) => {}
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a layer with Glorot-uniform weights and a zero bias.
    pub fn glorot(config: LinearConfig, device: &Device) -> Result<Self> {
        let (fan_out, fan_in) = (config.output_dim as f64, config.input_dim as f64);
        let bound = (6.0 / (fan_in + fan_out)).sqrt() as f32;
        let weight = Tensor::rand(
            -bound,
            bound,
            (config.output_dim, config.input_dim),
            device,
        )?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, DType::F32, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the static configuration used to validate inputs.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the weight tensor, shaped `(out_dim, in_dim)`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Returns the bias tensor if the layer carries one.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Applies the projection to a rank-2 or rank-3 input.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_feature("linear.input", hidden, self.config.input_dim)?;
        let weight_t = self.weight.t()?;
        let mut output = match *hidden.dims() {
            [batch, seq, _] => {
                let flat = hidden.reshape((batch * seq, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((batch, seq, self.config.output_dim))?
            }
            [_, _] => hidden.matmul(&weight_t)?,
            ref dims => {
                return Err(Error::Msg(format!(
                    "linear expects rank-2 or rank-3 input, got {dims:?}"
                )))
            }
        };
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias)?;
        }
        Ok(output)
    }
}
