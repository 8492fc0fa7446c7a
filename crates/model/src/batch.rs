//! Narrow batch interface.
//!
//! Corpus loading and batching live outside this crate; the stacks only
//! see token-id tensors and their padding masks, one sub-batch per
//! input stream.

use candle_core::{bail, DType, Device, Result, Tensor};

/// Token ids and padding for one stream of one batch.
#[derive(Debug, Clone)]
pub struct SubBatch {
    ids: Tensor,
    mask: Tensor,
    vocab_size: usize,
}

impl SubBatch {
    /// `ids` is `[batch, len]` u32, `mask` is `[batch, len]` f32 with 1
    /// at real tokens and 0 at padding.
    pub fn new(ids: Tensor, mask: Tensor, vocab_size: usize) -> Result<Self> {
        let shape = ids.dims2()?;
        if mask.dims2()? != shape {
            bail!(
                "sub-batch mask shape {:?} does not match ids shape {:?}",
                mask.dims(),
                ids.dims()
            );
        }
        if ids.dtype() != DType::U32 {
            bail!("sub-batch ids must be u32, got {:?}", ids.dtype());
        }
        if vocab_size == 0 {
            bail!("sub-batch vocabulary size must be nonzero");
        }
        Ok(Self {
            ids,
            mask,
            vocab_size,
        })
    }

    /// Builds a fully unpadded sub-batch from row-major token ids.
    pub fn dense(ids: Vec<u32>, batch: usize, len: usize, vocab_size: usize, device: &Device) -> Result<Self> {
        let ids = Tensor::from_vec(ids, (batch, len), device)?;
        let mask = Tensor::ones((batch, len), DType::F32, device)?;
        Self::new(ids, mask, vocab_size)
    }

    pub fn ids(&self) -> &Tensor {
        &self.ids
    }

    /// Multiplicative `[batch, len]` padding mask.
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn batch_size(&self) -> usize {
        self.ids.dims().first().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.ids.dims().get(1).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One batch: a sub-batch per encoder source, plus an optional target
/// side used for full-sequence scoring.
#[derive(Debug, Clone)]
pub struct Batch {
    sources: Vec<SubBatch>,
    target: Option<SubBatch>,
}

impl Batch {
    pub fn new(sources: Vec<SubBatch>, target: Option<SubBatch>) -> Result<Self> {
        if sources.is_empty() {
            bail!("a batch needs at least one source sub-batch");
        }
        let batch_size = sources[0].batch_size();
        for sub in sources.iter().chain(target.iter()) {
            if sub.batch_size() != batch_size {
                bail!(
                    "sub-batches disagree on batch size: {} vs {}",
                    sub.batch_size(),
                    batch_size
                );
            }
        }
        Ok(Self { sources, target })
    }

    pub fn source(&self, index: usize) -> Result<&SubBatch> {
        self.sources.get(index).ok_or_else(|| {
            candle_core::Error::Msg(format!(
                "batch has {} source sub-batches, encoder asked for index {index}",
                self.sources.len()
            ))
        })
    }

    pub fn sources(&self) -> &[SubBatch] {
        &self.sources
    }

    pub fn target(&self) -> Option<&SubBatch> {
        self.target.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.sources[0].batch_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_shape_must_match_ids() -> Result<()> {
        let device = Device::Cpu;
        let ids = Tensor::zeros((2, 3), DType::U32, &device)?;
        let mask = Tensor::ones((2, 4), DType::F32, &device)?;
        assert!(SubBatch::new(ids, mask, 10).is_err());
        Ok(())
    }

    #[test]
    fn batches_require_consistent_batch_size() -> Result<()> {
        let device = Device::Cpu;
        let a = SubBatch::dense(vec![0; 6], 2, 3, 10, &device)?;
        let b = SubBatch::dense(vec![0; 3], 1, 3, 10, &device)?;
        assert!(Batch::new(vec![a.clone()], Some(b)).is_err());
        assert!(Batch::new(vec![], None).is_err());
        assert!(Batch::new(vec![a], None).is_ok());
        Ok(())
    }
}
