//! Layer normalisation with learned scale and bias.
//!
//! Normalisation happens along the last (feature) axis while preserving
//! the `(batch, seq, feature)` layout. The epsilon matches the value the
//! rest of the model assumes (1e-6).

use candle_core::{DType, Device, Result, Tensor, D};

use crate::checks;

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Width of the feature axis being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration with the model-wide default epsilon.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-6,
        }
    }
}

/// Standard LayerNorm with learnable affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    scale: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Constructs a layer from existing scale and bias parameters.
    pub fn new(config: NormConfig, scale: Tensor, bias: Tensor) -> Result<Self> {
        checks::expect_shape("norm.scale", &scale, &[config.hidden_size])?;
        checks::expect_shape("norm.bias", &bias, &[config.hidden_size])?;
        Ok(Self {
            config,
            scale,
            bias,
        })
    }

    /// Builds a layer with unit scale and zero bias.
    pub fn identity_init(config: NormConfig, device: &Device) -> Result<Self> {
        let scale = Tensor::ones(config.hidden_size, DType::F32, device)?;
        let bias = Tensor::zeros(config.hidden_size, DType::F32, device)?;
        Self::new(config, scale, bias)
    }

    /// Returns the configuration so callers can check compatibility.
    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Normalises the feature axis and applies scale and bias.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_feature("norm.input", hidden, self.config.hidden_size)?;
        let width = self.config.hidden_size as f64;
        let mean = (hidden.sum_keepdim(D::Minus1)? / width)?;
        let centered = hidden.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / width)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalised = centered.broadcast_div(&denom)?;
        normalised
            .broadcast_mul(&self.scale)?
            .broadcast_add(&self.bias)
    }
}
