//! Decoder state: per-layer caches, position counter, beam re-selection.
//!
//! States are immutable values. A step never mutates its input; it
//! returns a successor, so a beam-search driver can hold many snapshots
//! of the same decoding without aliasing hazards.

use std::sync::Arc;

use candle_core::{bail, Result, Tensor};

use crate::batch::Batch;
use crate::encoder::EncoderOutput;

/// Cached context for one decoder layer: the growing key/value history
/// for self-attention, or the running average for average-attention.
#[derive(Debug, Clone, Default)]
pub struct LayerState {
    cache: Option<Tensor>,
}

impl LayerState {
    pub(crate) fn with_cache(cache: Tensor) -> Self {
        Self { cache: Some(cache) }
    }

    pub fn cache(&self) -> Option<&Tensor> {
        self.cache.as_ref()
    }

    /// Length of the cached context along the time axis.
    pub fn cached_len(&self) -> usize {
        self.cache
            .as_ref()
            .and_then(|cache| cache.dims().get(1).copied())
            .unwrap_or(0)
    }

    fn gather(&self, rows: &Tensor) -> Result<Self> {
        let cache = match &self.cache {
            Some(cache) => Some(cache.index_select(rows, 0)?),
            None => None,
        };
        Ok(Self { cache })
    }
}

/// Pending input for the next step: target token ids `[bb, len]` and,
/// for full-sequence scoring, their padding mask `[bb, len]`.
#[derive(Debug, Clone)]
pub struct TargetInput {
    pub ids: Tensor,
    pub mask: Option<Tensor>,
}

/// Aggregate decoding state for one decoder stack.
#[derive(Clone)]
pub struct DecoderState {
    layers: Vec<LayerState>,
    position: usize,
    logits: Option<Tensor>,
    encoder_outputs: Vec<Arc<EncoderOutput>>,
    batch: Arc<Batch>,
    target: Option<TargetInput>,
}

impl DecoderState {
    pub(crate) fn initial(
        depth: usize,
        encoder_outputs: Vec<Arc<EncoderOutput>>,
        batch: Arc<Batch>,
    ) -> Self {
        Self {
            layers: vec![LayerState::default(); depth],
            position: 0,
            logits: None,
            encoder_outputs,
            batch,
            target: None,
        }
    }

    pub(crate) fn successor(
        &self,
        layers: Vec<LayerState>,
        logits: Tensor,
    ) -> Self {
        Self {
            layers,
            position: self.position + 1,
            logits: Some(logits),
            encoder_outputs: self.encoder_outputs.clone(),
            batch: Arc::clone(&self.batch),
            target: None,
        }
    }

    pub fn layers(&self) -> &[LayerState] {
        &self.layers
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Unnormalized vocabulary scores from the latest step, if any.
    pub fn logits(&self) -> Option<&Tensor> {
        self.logits.as_ref()
    }

    pub fn encoder_outputs(&self) -> &[Arc<EncoderOutput>] {
        &self.encoder_outputs
    }

    pub fn batch(&self) -> &Arc<Batch> {
        &self.batch
    }

    pub(crate) fn target(&self) -> Option<&TargetInput> {
        self.target.as_ref()
    }

    /// Returns a state carrying the next step's target tokens. `ids` is
    /// `[bb, len]` u32; `mask` is only meaningful for full-sequence
    /// scoring at position 0.
    pub fn with_target(&self, ids: Tensor, mask: Option<Tensor>) -> Result<Self> {
        let shape = ids.dims2()?;
        if let Some(mask) = &mask {
            if mask.dims2()? != shape {
                bail!(
                    "target mask shape {:?} does not match ids shape {:?}",
                    mask.dims(),
                    ids.dims()
                );
            }
        }
        let mut next = self.clone();
        next.target = Some(TargetInput { ids, mask });
        Ok(next)
    }

    /// Narrows (or expands) the state to the given hypothesis rows.
    ///
    /// `indices` index the folded `[beam * batch]` leading axis of every
    /// cache; gathering whole rows keeps each hypothesis's temporal
    /// order intact. The position counter is copied unchanged.
    pub fn select(&self, indices: &[usize], beam_width: usize) -> Result<Self> {
        if indices.len() != beam_width * self.batch.batch_size() {
            bail!(
                "selected {} hypotheses, expected beam {} x batch {}",
                indices.len(),
                beam_width,
                self.batch.batch_size()
            );
        }
        let current = self.beam_batch_rows();
        if let Some(out_of_range) = indices.iter().find(|&&i| i >= current) {
            bail!("hypothesis index {out_of_range} out of range for {current} rows");
        }
        let device = self
            .layers
            .iter()
            .find_map(|layer| layer.cache.as_ref().map(|c| c.device().clone()))
            .unwrap_or_else(|| candle_core::Device::Cpu);
        let rows = Tensor::from_vec(
            indices.iter().map(|&i| i as u32).collect::<Vec<u32>>(),
            indices.len(),
            &device,
        )?;
        let layers = self
            .layers
            .iter()
            .map(|layer| layer.gather(&rows))
            .collect::<Result<Vec<LayerState>>>()?;
        let logits = match &self.logits {
            Some(logits) => Some(logits.index_select(&rows, 0)?),
            None => None,
        };
        Ok(Self {
            layers,
            position: self.position,
            logits,
            encoder_outputs: self.encoder_outputs.clone(),
            batch: Arc::clone(&self.batch),
            target: self.target.clone(),
        })
    }

    /// Rows of the folded beam-batch axis currently held in the caches,
    /// falling back to the batch size before any step ran.
    fn beam_batch_rows(&self) -> usize {
        self.layers
            .iter()
            .find_map(|layer| {
                layer
                    .cache
                    .as_ref()
                    .and_then(|cache| cache.dims().first().copied())
            })
            .or_else(|| {
                self.logits
                    .as_ref()
                    .and_then(|logits| logits.dims().first().copied())
            })
            .unwrap_or_else(|| self.batch.batch_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SubBatch;
    use candle_core::{DType, Device};

    fn state_with_cache(cache: Tensor) -> Result<DecoderState> {
        let device = cache.device().clone();
        let batch = Arc::new(Batch::new(
            vec![SubBatch::dense(vec![1, 2], 1, 2, 10, &device)?],
            None,
        )?);
        let mut state = DecoderState::initial(1, vec![], batch);
        state.layers[0] = LayerState::with_cache(cache);
        state.position = 3;
        Ok(state)
    }

    #[test]
    fn identity_selection_reproduces_caches_exactly() -> Result<()> {
        let device = Device::Cpu;
        let cache = Tensor::rand(-1f32, 1f32, (2, 3, 4), &device)?;
        let state = state_with_cache(cache.clone())?;
        let same = state.select(&[0, 1], 2)?;
        let diff = same.layers()[0]
            .cache()
            .ok_or_else(|| candle_core::Error::Msg("cache lost in selection".into()))?
            .sub(&cache)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        assert_eq!(same.position(), 3);
        Ok(())
    }

    #[test]
    fn selection_gathers_whole_hypothesis_rows() -> Result<()> {
        let device = Device::Cpu;
        let cache = Tensor::from_vec(
            (0..12).map(|i| i as f32).collect::<Vec<f32>>(),
            (3, 2, 2),
            &device,
        )?;
        let mut state = state_with_cache(cache)?;
        // pretend beam 3 over batch 1
        state.position = 0;
        let narrowed = state.select(&[2], 1)?;
        let rows = narrowed.layers()[0]
            .cache()
            .ok_or_else(|| candle_core::Error::Msg("cache lost in selection".into()))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert_eq!(rows, vec![8.0, 9.0, 10.0, 11.0]);
        Ok(())
    }

    #[test]
    fn out_of_range_hypothesis_fails() -> Result<()> {
        let device = Device::Cpu;
        let cache = Tensor::zeros((2, 1, 4), DType::F32, &device)?;
        let state = state_with_cache(cache)?;
        assert!(state.select(&[0, 5], 2).is_err());
        assert!(state.select(&[0], 2).is_err());
        Ok(())
    }
}
