//! Activation catalogue for feed-forward and average-attention stacks.
//!
//! Activations consume tensors shaped `(batch, seq, feature)` and return
//! tensors with identical layout. The catalogue is deliberately limited
//! to the two non-linearities the model configuration may name; anything
//! else is a fatal configuration error.

use candle_core::Tensor;

use crate::ConfigError;

/// Non-linearity applied between dense projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Rectified linear unit.
    Relu,
    /// Swish / SiLU, `x * sigmoid(x)`.
    Swish,
}

impl Activation {
    /// Resolves a configured activation name.
    ///
    /// Unknown names abort the model build with
    /// [`ConfigError::UnknownActivation`].
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "relu" => Ok(Self::Relu),
            "swish" => Ok(Self::Swish),
            other => Err(ConfigError::UnknownActivation(other.to_string())),
        }
    }

    /// Applies the activation elementwise.
    pub fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Relu => input.relu(),
            Self::Swish => input.silu(),
        }
    }
}

/// Logistic sigmoid, used by highway connections and average-attention gates.
pub fn sigmoid(input: &Tensor) -> candle_core::Result<Tensor> {
    candle_nn::ops::sigmoid(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Result};

    #[test]
    fn resolves_known_names() {
        assert_eq!(Activation::from_name("relu").unwrap(), Activation::Relu);
        assert_eq!(Activation::from_name("swish").unwrap(), Activation::Swish);
    }

    #[test]
    fn unknown_name_is_fatal() {
        let err = Activation::from_name("gelu").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownActivation(name) if name == "gelu"));
    }

    #[test]
    fn relu_zeroes_negatives() -> Result<()> {
        let x = Tensor::from_vec(vec![-1.0f32, 0.0, 2.0], 3, &Device::Cpu)?;
        let y = Activation::Relu.forward(&x)?.to_vec1::<f32>()?;
        assert_eq!(y, vec![0.0, 0.0, 2.0]);
        Ok(())
    }

    #[test]
    fn swish_matches_formula() -> Result<()> {
        let x = Tensor::from_vec(vec![-2.0f32, -0.5, 0.0, 1.5], 4, &Device::Cpu)?;
        let y = Activation::Swish.forward(&x)?.to_vec1::<f32>()?;
        for (v, out) in [-2.0f32, -0.5, 0.0, 1.5].iter().zip(y) {
            let expected = v / (1.0 + (-v).exp());
            assert!((out - expected).abs() < 1e-6);
        }
        Ok(())
    }
}
