//! Training-gated dropout helpers.
//!
//! Dropout is a train-only concern: at inference, or when the configured
//! probability is zero, both helpers return the input unchanged so the
//! computation stays deterministic.

use candle_core::{bail, DType, Result, Tensor};

/// Applies elementwise inverted dropout to `input` during training.
pub fn dropout(input: &Tensor, probability: f32, training: bool) -> Result<Tensor> {
    if !training || probability <= 0.0 {
        return Ok(input.clone());
    }
    if probability >= 1.0 {
        bail!("dropout probability must be in [0, 1), got {probability}");
    }
    candle_nn::ops::dropout(input, probability)
}

/// Drops whole sequence positions from a `(batch, seq, feature)` tensor.
///
/// One Bernoulli draw is taken per position and broadcast over batch and
/// feature axes, so a dropped word disappears from every batch entry.
/// Survivors are rescaled by `1 / keep` as usual.
pub fn word_dropout(input: &Tensor, probability: f32, training: bool) -> Result<Tensor> {
    if !training || probability <= 0.0 {
        return Ok(input.clone());
    }
    if probability >= 1.0 {
        bail!("word dropout probability must be in [0, 1), got {probability}");
    }
    let (_, seq, _) = input.dims3()?;
    let keep = 1.0 - probability;
    let draws = Tensor::rand(0f32, 1f32, (seq, 1), input.device())?;
    let mask = draws
        .lt(keep as f64)?
        .to_dtype(DType::F32)?
        .affine(1.0 / keep as f64, 0.0)?;
    input.broadcast_mul(&mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn noop_at_inference_or_zero_probability() -> Result<()> {
        let x = Tensor::rand(0f32, 1f32, (2, 3, 4), &Device::Cpu)?;
        let same = dropout(&x, 0.5, false)?;
        let diff = x.sub(&same)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        let same = dropout(&x, 0.0, true)?;
        let diff = x.sub(&same)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn invalid_probability_is_rejected() {
        let x = Tensor::zeros((1, 1, 1), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(dropout(&x, 1.0, true).is_err());
        assert!(word_dropout(&x, 1.5, true).is_err());
    }

    #[test]
    fn word_dropout_removes_whole_positions() -> Result<()> {
        let x = Tensor::ones((3, 16, 4), candle_core::DType::F32, &Device::Cpu)?;
        let dropped = word_dropout(&x, 0.5, true)?;
        let values = dropped.to_vec3::<f32>()?;
        for pos in 0..16 {
            // Each position is either zeroed everywhere or rescaled everywhere.
            let mut seen = std::collections::BTreeSet::new();
            for batch in &values {
                for &v in &[batch[pos][0], batch[pos][1], batch[pos][2], batch[pos][3]] {
                    seen.insert(v.to_bits());
                }
            }
            assert_eq!(seen.len(), 1, "position {pos} was only partially dropped");
            let v = f32::from_bits(*seen.iter().next().unwrap());
            assert!(v == 0.0 || (v - 2.0).abs() < 1e-6);
        }
        Ok(())
    }
}
