//! Token embedding table with tied readout support.
//!
//! The weight is held in a [`Var`] so the table can act as a trainable
//! leaf for the external graph engine. Cloning a [`TokenEmbedding`]
//! shares the underlying storage, which is exactly how tied embeddings
//! (shared source/target tables, transposed readout) are expressed:
//! the same storage observed through several roles.

use candle_core::{bail, DType, Device, Error, Result, Tensor, Var};

use layers::checks;

/// Configuration for building a token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbeddingConfig {
    /// Number of distinct tokens.
    pub vocab_size: usize,
    /// Dimensionality of each embedding vector (the model width).
    pub dim: usize,
    /// Whether the table is excluded from training updates.
    pub frozen: bool,
}

impl TokenEmbeddingConfig {
    /// Creates a trainable table configuration.
    pub fn new(vocab_size: usize, dim: usize) -> Self {
        Self {
            vocab_size,
            dim,
            frozen: false,
        }
    }
}

/// Learnable token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Var,
}

impl TokenEmbedding {
    /// Builds a table with parameters sampled from `N(0, 1)`.
    pub fn new(config: TokenEmbeddingConfig, device: &Device) -> Result<Self> {
        if config.vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if config.dim == 0 {
            bail!("token embedding requires dim > 0");
        }
        let weight = Var::randn(0f32, 1f32, (config.vocab_size, config.dim), device)?;
        Ok(Self { config, weight })
    }

    /// Builds a table from pretrained vectors, optionally row-normalised
    /// to unit length.
    pub fn from_pretrained(
        config: TokenEmbeddingConfig,
        vectors: Tensor,
        normalize: bool,
    ) -> Result<Self> {
        checks::expect_shape(
            "embedding.pretrained",
            &vectors,
            &[config.vocab_size, config.dim],
        )?;
        let vectors = if normalize {
            let norms = vectors.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1e-12)?;
            vectors.broadcast_div(&norms)?
        } else {
            vectors
        };
        let weight = Var::from_tensor(&vectors)?;
        Ok(Self { config, weight })
    }

    /// Returns the embedding configuration.
    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    /// Whether the table should be excluded from parameter updates.
    pub fn is_frozen(&self) -> bool {
        self.config.frozen
    }

    /// Returns the weight tensor, shaped `(vocab, dim)`; clones share storage.
    pub fn weight(&self) -> Tensor {
        self.weight.as_tensor().clone()
    }

    /// Returns the trainable leaf for optimizer registration.
    pub fn var(&self) -> &Var {
        &self.weight
    }

    /// Looks up embeddings for `(batch, seq)` integer token ids,
    /// producing `(batch, seq, dim)`.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = token_ids.dims2().map_err(|_| {
            Error::Msg(format!(
                "token ids must be shaped [batch, seq], got {:?}",
                token_ids.dims()
            ))
        })?;
        if batch == 0 || seq == 0 {
            bail!("token ids must have non-zero batch and seq dimensions");
        }
        let flat = token_ids.flatten_all()?.to_dtype(DType::U32)?;
        self.ensure_id_range(&flat)?;
        let gathered = self.weight.as_tensor().index_select(&flat, 0)?;
        gathered.reshape((batch, seq, self.config.dim))
    }

    /// Applies a tied linear readout using the transpose of the table,
    /// mapping `(batch, seq, dim)` to `(batch, seq, vocab)`.
    pub fn linear_out(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_feature("embedding.readout", hidden, self.config.dim)?;
        let (batch, seq, dim) = hidden.dims3()?;
        let weight_t = self.weight.as_tensor().t()?;
        hidden
            .reshape((batch * seq, dim))?
            .matmul(&weight_t)?
            .reshape((batch, seq, self.config.vocab_size))
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        if flat_ids.elem_count() == 0 {
            return Ok(());
        }
        let max_id = flat_ids.max_all()?.to_scalar::<u32>()?;
        if max_id as usize >= self.config.vocab_size {
            bail!(
                "token id {} exceeds vocab size {}",
                max_id,
                self.config.vocab_size
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_produces_batch_seq_dim() -> Result<()> {
        let device = Device::Cpu;
        let table = TokenEmbedding::new(TokenEmbeddingConfig::new(10, 4), &device)?;
        let ids = Tensor::from_vec(vec![0u32, 3, 9, 1, 2, 5], (2, 3), &device)?;
        let out = table.forward(&ids)?;
        assert_eq!(out.dims(), &[2, 3, 4]);
        Ok(())
    }

    #[test]
    fn out_of_range_ids_fail() -> Result<()> {
        let device = Device::Cpu;
        let table = TokenEmbedding::new(TokenEmbeddingConfig::new(4, 4), &device)?;
        let ids = Tensor::from_vec(vec![0u32, 4], (1, 2), &device)?;
        assert!(table.forward(&ids).is_err());
        Ok(())
    }

    #[test]
    fn clones_share_storage() -> Result<()> {
        let device = Device::Cpu;
        let table = TokenEmbedding::new(TokenEmbeddingConfig::new(6, 4), &device)?;
        let tied = table.clone();
        let zeros = Tensor::zeros((6, 4), DType::F32, &device)?;
        table.var().set(&zeros)?;
        let max = tied.weight().abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(max, 0.0);
        Ok(())
    }

    #[test]
    fn tied_readout_is_the_transposed_table() -> Result<()> {
        let device = Device::Cpu;
        let table = TokenEmbedding::new(TokenEmbeddingConfig::new(5, 3), &device)?;
        let hidden = Tensor::rand(-1f32, 1f32, (1, 2, 3), &device)?;
        let logits = table.linear_out(&hidden)?;
        assert_eq!(logits.dims(), &[1, 2, 5]);
        let reference = hidden
            .reshape((2, 3))?
            .matmul(&table.weight().t()?)?
            .reshape((1, 2, 5))?;
        let diff = logits.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn pretrained_vectors_can_be_normalised() -> Result<()> {
        let device = Device::Cpu;
        let vectors = Tensor::from_vec(vec![3.0f32, 4.0, 0.0, 5.0], (2, 2), &device)?;
        let table = TokenEmbedding::from_pretrained(
            TokenEmbeddingConfig::new(2, 2),
            vectors,
            true,
        )?;
        let rows = table.weight().to_vec2::<f32>()?;
        for row in rows {
            let norm = (row[0] * row[0] + row[1] * row[1]).sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        Ok(())
    }
}
