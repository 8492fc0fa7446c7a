//! Vocabulary output layer.
//!
//! Projects the decoder's final representation to unnormalized
//! vocabulary scores. The weight matrix is either owned, or the
//! transposed target embedding table (tying). A shortlist narrows
//! scoring to a subset of the vocabulary by gathering weight rows
//! before the projection, so the matmul shrinks with the shortlist.

use candle_core::{bail, DType, Device, Result, Tensor};

use embedding::TokenEmbedding;

enum WeightSource {
    Owned(Tensor),
    Tied(TokenEmbedding),
}

impl WeightSource {
    fn table(&self) -> Tensor {
        match self {
            WeightSource::Owned(weight) => weight.clone(),
            WeightSource::Tied(embedding) => embedding.weight(),
        }
    }
}

pub struct OutputLayer {
    source: WeightSource,
    bias: Tensor,
    vocab_size: usize,
    shortlist: Option<Tensor>,
}

impl OutputLayer {
    /// Freshly initialized `(vocab, model_dim)` projection.
    pub fn owned(vocab_size: usize, model_dim: usize, device: &Device) -> Result<Self> {
        if vocab_size == 0 {
            bail!("output layer needs a nonzero vocabulary");
        }
        let scale = 1.0 / (model_dim as f64).sqrt();
        let weight = Tensor::randn(0f32, scale as f32, (vocab_size, model_dim), device)?;
        let bias = Tensor::zeros(vocab_size, DType::F32, device)?;
        Ok(Self {
            source: WeightSource::Owned(weight),
            bias,
            vocab_size,
            shortlist: None,
        })
    }

    /// Reads logits through the transposed embedding table; the bias
    /// stays an independent parameter.
    pub fn tied(embedding: TokenEmbedding, device: &Device) -> Result<Self> {
        let vocab_size = embedding.config().vocab_size;
        let bias = Tensor::zeros(vocab_size, DType::F32, device)?;
        Ok(Self {
            source: WeightSource::Tied(embedding),
            bias,
            vocab_size,
            shortlist: None,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Restricts scoring to `indices` (u32, rank 1) into the vocabulary;
    /// `None` restores full-vocabulary scoring.
    pub fn set_shortlist(&mut self, indices: Option<Tensor>) -> Result<()> {
        if let Some(indices) = &indices {
            if indices.dims().len() != 1 {
                bail!("shortlist must be a rank-1 index tensor, got {:?}", indices.dims());
            }
            let max = indices.max_all()?.to_dtype(DType::U32)?.to_vec0::<u32>()?;
            if (max as usize) >= self.vocab_size {
                bail!(
                    "shortlist index {max} out of range for vocabulary {}",
                    self.vocab_size
                );
            }
        }
        self.shortlist = indices;
        Ok(())
    }

    /// `[bb, len, model_dim]` -> `[bb, len, vocab]` (or shortlist size).
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let (bb, len, dim) = hidden.dims3()?;
        let mut weight = self.source.table();
        let mut bias = self.bias.clone();
        if let Some(shortlist) = &self.shortlist {
            weight = weight.index_select(shortlist, 0)?;
            bias = bias.index_select(shortlist, 0)?;
        }
        let rows = hidden.reshape((bb * len, dim))?;
        let scores = rows.matmul(&weight.t()?)?.broadcast_add(&bias)?;
        let out = scores.dim(1)?;
        scores.reshape((bb, len, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedding::TokenEmbeddingConfig;

    #[test]
    fn tied_scores_peak_at_the_matching_token() -> Result<()> {
        let device = Device::Cpu;
        let embedding = TokenEmbedding::new(TokenEmbeddingConfig::new(6, 4), &device)?;
        let layer = OutputLayer::tied(embedding.clone(), &device)?;
        let ids = Tensor::from_vec(vec![3u32], (1, 1), &device)?;
        let hidden = embedding.forward(&ids)?;
        // scores are <hidden, e_v>; the self inner product dominates in
        // expectation but not surely, so only check shape and the tie:
        // logits must change when the shared table changes.
        let before = layer.forward(&hidden)?;
        assert_eq!(before.dims3()?, (1, 1, 6));

        let zeros = Tensor::zeros((6, 4), DType::F32, &device)?;
        embedding.var().set(&zeros)?;
        let after = layer
            .forward(&embedding.forward(&ids)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert_eq!(after, 0.0);
        Ok(())
    }

    #[test]
    fn shortlist_restricts_and_reorders_scores() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = OutputLayer::owned(8, 4, &device)?;
        let hidden = Tensor::rand(-1f32, 1f32, (1, 2, 4), &device)?;
        let full = layer.forward(&hidden)?;

        let shortlist = Tensor::from_vec(vec![5u32, 0, 2], 3, &device)?;
        layer.set_shortlist(Some(shortlist))?;
        let narrowed = layer.forward(&hidden)?;
        assert_eq!(narrowed.dims3()?, (1, 2, 3));

        let full_v = full.flatten_all()?.to_vec1::<f32>()?;
        let narrow_v = narrowed.flatten_all()?.to_vec1::<f32>()?;
        // row 0 of the narrowed scores is vocabulary entry 5.
        assert!((narrow_v[0] - full_v[5]).abs() < 1e-6);
        assert!((narrow_v[1] - full_v[0]).abs() < 1e-6);
        assert!((narrow_v[2] - full_v[2]).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn out_of_range_shortlist_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = OutputLayer::owned(4, 4, &device)?;
        let shortlist = Tensor::from_vec(vec![7u32], 1, &device)?;
        assert!(layer.set_shortlist(Some(shortlist)).is_err());
        Ok(())
    }
}
