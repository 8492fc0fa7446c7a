//! Mask builders shared by attention implementations.
//!
//! Masks exist in two forms. The multiplicative form holds `1.0` where
//! attention is permitted and `0.0` where it is not; it is what batch
//! providers hand over and what mask intersection operates on. The
//! additive form holds `0.0` / [`MASK_PENALTY`] and is added to
//! pre-softmax scores, driving masked positions to zero probability
//! while every value stays finite.

use candle_core::{bail, DType, Device, Result, Tensor};

/// Dtype shared by all masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Additive penalty for disallowed positions. Finite, but large enough
/// that softmax underflows masked entries to exactly zero in f32.
pub const MASK_PENALTY: f32 = -1e9;

/// Builds the `[length, length]` causal mask: entry `(i, j)` is `1.0`
/// iff `j <= i`, so each position attends to itself and its past.
pub fn causal_mask(device: &Device, length: usize) -> Result<Tensor> {
    let mut data = vec![0f32; length * length];
    for i in 0..length {
        for j in 0..=i {
            data[i * length + j] = 1.0;
        }
    }
    Tensor::from_vec(data, (length, length), device)
}

/// Converts a multiplicative mask into broadcastable additive form.
///
/// Accepted inputs, with the key axis innermost:
/// * `[batch, k_len]` padding masks, reshaped to `[batch, 1, 1, k_len]`,
/// * `[batch, q_len, k_len]` per-query masks (e.g. causal intersected
///   with padding), reshaped to `[batch, 1, q_len, k_len]`.
///
/// The singleton axes broadcast over heads (and query positions for the
/// first form) when the mask is added to `[bb, heads, q_len, k_len]`
/// scores.
pub fn to_additive(mask: &Tensor) -> Result<Tensor> {
    // (1 - m) * penalty, folded into a single affine map.
    let additive = mask.affine(-(MASK_PENALTY as f64), MASK_PENALTY as f64)?;
    match *additive.dims() {
        [batch, k_len] => additive.reshape((batch, 1, 1, k_len)),
        [batch, q_len, k_len] => additive.reshape((batch, 1, q_len, k_len)),
        ref dims => bail!("mask must be rank 2 or 3 with the key axis last, got {dims:?}"),
    }
}

/// Intersects two multiplicative masks by broadcast multiplication.
pub fn intersect(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    a.broadcast_mul(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::ops::softmax_last_dim;

    #[test]
    fn causal_mask_is_lower_triangular_inclusive() -> Result<()> {
        let length = 7;
        let mask = causal_mask(&Device::Cpu, length)?.to_vec2::<f32>()?;
        for i in 0..length {
            for j in 0..length {
                let expected = if j <= i { 1.0 } else { 0.0 };
                assert_eq!(mask[i][j], expected, "entry ({i}, {j})");
            }
        }
        Ok(())
    }

    #[test]
    fn masked_positions_get_zero_probability() -> Result<()> {
        let device = Device::Cpu;
        // Padding pattern: the last two of five keys are padding.
        let mask = Tensor::from_vec(vec![1.0f32, 1.0, 1.0, 0.0, 0.0], (1, 5), &device)?;
        let additive = to_additive(&mask)?;
        assert_eq!(additive.dims(), &[1, 1, 1, 5]);

        let logits = Tensor::rand(-5f32, 5f32, (1, 2, 3, 5), &device)?;
        let masked = logits.broadcast_add(&additive)?;
        let probs = softmax_last_dim(&masked)?;
        let values = probs.flatten_all()?.to_vec1::<f32>()?;
        for row in values.chunks(5) {
            assert_eq!(row[3], 0.0);
            assert_eq!(row[4], 0.0);
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn rank_three_masks_keep_per_query_rows() -> Result<()> {
        let device = Device::Cpu;
        let causal = causal_mask(&device, 3)?.reshape((1, 3, 3))?;
        let additive = to_additive(&causal)?;
        assert_eq!(additive.dims(), &[1, 1, 3, 3]);
        let values = additive.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values[1], MASK_PENALTY);
        assert_eq!(values[0], 0.0);
        Ok(())
    }

    #[test]
    fn intersection_combines_causal_and_padding() -> Result<()> {
        let device = Device::Cpu;
        let causal = causal_mask(&device, 3)?.reshape((1, 3, 3))?;
        // Second batch entry has its last position padded.
        let padding = Tensor::from_vec(
            vec![1.0f32, 1.0, 1.0, 1.0, 1.0, 0.0],
            (2, 1, 3),
            &device,
        )?;
        let combined = intersect(&causal, &padding)?;
        assert_eq!(combined.dims(), &[2, 3, 3]);
        let values = combined.to_vec3::<f32>()?;
        // Batch 0 keeps the plain triangle.
        assert_eq!(values[0][2], vec![1.0, 1.0, 1.0]);
        // Batch 1 loses key 2 everywhere.
        assert_eq!(values[1][2], vec![1.0, 1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn unsupported_rank_is_rejected() -> Result<()> {
        let mask = Tensor::ones((2, 1, 1, 4), MASK_DTYPE, &Device::Cpu)?;
        assert!(to_additive(&mask).is_err());
        Ok(())
    }
}
