//! Sinusoidal positional encoding.
//!
//! The signal carries no learned parameters: position `p` (the absolute
//! index `start + local`) is encoded across `dim / 2` frequency bands,
//! with band `i` contributing `sin(p * exp(i * -ln(10000) / (bands - 1)))`
//! at feature `2i` and the matching cosine at feature `2i + 1`.

use candle_core::{bail, Device, Result, Tensor};

/// Builds the positional signal as a `[length, 1, dim]` tensor.
///
/// The singleton middle axis makes the tensor broadcast across batch
/// entries; `start` offsets the absolute position, which is how the
/// decoder keeps positions consistent across incremental steps.
pub fn sinusoidal_signal(
    device: &Device,
    dim_feature: usize,
    length: usize,
    start: usize,
) -> Result<Tensor> {
    if dim_feature == 0 || dim_feature % 2 != 0 {
        bail!("positional signal requires an even feature width, got {dim_feature}");
    }
    let bands = dim_feature / 2;
    let log_increment = if bands > 1 {
        (10000f64).ln() / (bands as f64 - 1.0)
    } else {
        0.0
    };

    let mut data = vec![0f32; length * dim_feature];
    for local in 0..length {
        let p = (start + local) as f64;
        for band in 0..bands {
            let angle = p * (-(band as f64) * log_increment).exp();
            data[local * dim_feature + 2 * band] = angle.sin() as f32;
            data[local * dim_feature + 2 * band + 1] = angle.cos() as f32;
        }
    }

    Tensor::from_vec(data, (length, 1, dim_feature), device)
}

/// Adds the positional signal to `(batch, seq, feature)` embeddings.
pub fn add_positional_signal(embeddings: &Tensor, start: usize) -> Result<Tensor> {
    let (_, length, dim) = embeddings.dims3()?;
    let signal = sinusoidal_signal(embeddings.device(), dim, length, start)?;
    // [length, 1, dim] -> [length, dim] so broadcasting aligns on the
    // trailing axes against [batch, length, dim].
    embeddings.broadcast_add(&signal.squeeze(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_shape_and_origin() -> Result<()> {
        let signal = sinusoidal_signal(&Device::Cpu, 8, 3, 0)?;
        assert_eq!(signal.dims(), &[3, 1, 8]);
        // Position 0: every sin is 0, every cos is 1.
        let first = signal.narrow(0, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        for (idx, v) in first.iter().enumerate() {
            let expected = if idx % 2 == 0 { 0.0 } else { 1.0 };
            assert!((v - expected).abs() < 1e-6, "feature {idx}");
        }
        Ok(())
    }

    #[test]
    fn start_offset_matches_absolute_positions() -> Result<()> {
        let device = Device::Cpu;
        let from_zero = sinusoidal_signal(&device, 16, 6, 0)?;
        let offset = sinusoidal_signal(&device, 16, 2, 4)?;
        let tail = from_zero.narrow(0, 4, 2)?;
        let diff = tail.sub(&offset)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-7);
        Ok(())
    }

    #[test]
    fn frequency_schedule_matches_formula() -> Result<()> {
        let dim = 8;
        let signal = sinusoidal_signal(&Device::Cpu, dim, 5, 0)?;
        let values = signal.flatten_all()?.to_vec1::<f32>()?;
        let bands = dim / 2;
        let log_inc = (10000f64).ln() / (bands as f64 - 1.0);
        for p in 0..5 {
            for band in 0..bands {
                let angle = p as f64 * (-(band as f64) * log_inc).exp();
                let sin = values[p * dim + 2 * band];
                let cos = values[p * dim + 2 * band + 1];
                assert!((sin as f64 - angle.sin()).abs() < 1e-6);
                assert!((cos as f64 - angle.cos()).abs() < 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn odd_width_is_rejected() {
        assert!(sinusoidal_signal(&Device::Cpu, 7, 2, 0).is_err());
    }

    #[test]
    fn broadcast_add_reaches_every_batch_entry() -> Result<()> {
        let device = Device::Cpu;
        let embeddings = Tensor::zeros((3, 4, 8), candle_core::DType::F32, &device)?;
        let summed = add_positional_signal(&embeddings, 2)?;
        let expected = sinusoidal_signal(&device, 8, 4, 2)?.squeeze(1)?;
        for b in 0..3 {
            let row = summed.narrow(0, b, 1)?.squeeze(0)?;
            let diff = row.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
            assert!(diff < 1e-7);
        }
        Ok(())
    }
}
