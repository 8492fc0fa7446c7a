//! Multi-head attention with per-source key/value projections.
//!
//! A single block can attend over several sources at once (one per
//! encoder in a multi-source setup). The query projection is shared;
//! every source gets its own key and value projections and its own
//! mask, and the per-source head outputs are concatenated along the
//! feature axis before the optional final projection.

use candle_core::{bail, Result, Tensor};
use layers::{Linear, LinearConfig};

use crate::scaled::ScaledDotProduct;

/// One attention target: projected inputs share a mask.
pub struct AttentionSource<'a> {
    /// `[bk, k_len, model_dim]` keys input, pre-projection.
    pub keys: &'a Tensor,
    /// `[bk, k_len, model_dim]` values input, pre-projection.
    pub values: &'a Tensor,
    /// Additive mask `[mb, 1, q_len|1, k_len]`, if any.
    pub mask: Option<&'a Tensor>,
}

#[derive(Debug, Clone)]
pub struct MultiHeadConfig {
    /// Width of the per-source attention space.
    pub model_dim: usize,
    /// Width of the block output.
    pub output_dim: usize,
    /// Head count; must divide `model_dim`.
    pub heads: usize,
    /// Number of sources attended over jointly.
    pub sources: usize,
    /// Dropout on attention weights, training only.
    pub dropout_p: f32,
    /// Force the final projection even when widths already agree.
    pub project_output: bool,
}

/// Projects queries, keys, and values, runs the scaled dot-product
/// kernel per head and per source, and merges the results.
pub struct MultiHeadAttention {
    config: MultiHeadConfig,
    query: Linear,
    keys: Vec<Linear>,
    values: Vec<Linear>,
    output: Option<Linear>,
    kernel: ScaledDotProduct,
}

impl MultiHeadAttention {
    pub fn new(
        config: MultiHeadConfig,
        query: Linear,
        keys: Vec<Linear>,
        values: Vec<Linear>,
        output: Option<Linear>,
    ) -> Result<Self> {
        if config.sources == 0 {
            bail!("attention block needs at least one source");
        }
        if config.heads == 0 || config.model_dim % config.heads != 0 {
            bail!(
                "head count {} must be nonzero and divide model width {}",
                config.heads,
                config.model_dim
            );
        }
        if keys.len() != config.sources || values.len() != config.sources {
            bail!(
                "expected {} key/value projections, got {} and {}",
                config.sources,
                keys.len(),
                values.len()
            );
        }
        let concat_dim = config.sources * config.model_dim;
        let needs_output = config.project_output || concat_dim != config.output_dim;
        if needs_output != output.is_some() {
            bail!(
                "output projection presence mismatch: concat width {concat_dim}, output width {}",
                config.output_dim
            );
        }
        let kernel = ScaledDotProduct::new(config.dropout_p);
        Ok(Self {
            config,
            query,
            keys,
            values,
            output,
            kernel,
        })
    }

    /// Builds a block with Glorot-initialized projections.
    pub fn glorot(config: MultiHeadConfig, device: &candle_core::Device) -> Result<Self> {
        let proj = |input_dim: usize, output_dim: usize| {
            Linear::glorot(
                LinearConfig {
                    input_dim,
                    output_dim,
                    bias: true,
                },
                device,
            )
        };
        let query = proj(config.model_dim, config.model_dim)?;
        let mut keys = Vec::with_capacity(config.sources);
        let mut values = Vec::with_capacity(config.sources);
        for _ in 0..config.sources {
            keys.push(proj(config.model_dim, config.model_dim)?);
            values.push(proj(config.model_dim, config.model_dim)?);
        }
        let concat_dim = config.sources * config.model_dim;
        let output = if config.project_output || concat_dim != config.output_dim {
            Some(proj(concat_dim, config.output_dim)?)
        } else {
            None
        };
        Self::new(config, query, keys, values, output)
    }

    pub fn config(&self) -> &MultiHeadConfig {
        &self.config
    }

    /// Attends `q` over every source and returns `[bb, q_len, output_dim]`.
    pub fn forward(
        &self,
        q: &Tensor,
        sources: &[AttentionSource<'_>],
        training: bool,
    ) -> Result<Tensor> {
        if sources.len() != self.config.sources {
            bail!(
                "block built for {} sources, called with {}",
                self.config.sources,
                sources.len()
            );
        }
        let (bb, q_len, q_dim) = q.dims3()?;
        if q_dim != self.config.model_dim {
            bail!(
                "query width {} does not match model width {}",
                q_dim,
                self.config.model_dim
            );
        }

        let q_heads = self.split_heads(&self.query.forward(q)?)?;
        let mut merged = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let (_, _, k_dim) = source.keys.dims3()?;
            let (_, _, v_dim) = source.values.dims3()?;
            if k_dim != self.config.model_dim || v_dim != self.config.model_dim {
                bail!(
                    "source {index} width mismatch: keys {k_dim}, values {v_dim}, expected {}",
                    self.config.model_dim
                );
            }
            let k_heads = self.split_heads(&self.keys[index].forward(source.keys)?)?;
            let v_heads = self.split_heads(&self.values[index].forward(source.values)?)?;
            let context = self
                .kernel
                .attend(&q_heads, &k_heads, &v_heads, source.mask, training)?;
            merged.push(join_heads(&context)?);
        }

        let concat = if merged.len() == 1 {
            merged.remove(0)
        } else {
            let views: Vec<&Tensor> = merged.iter().collect();
            Tensor::cat(&views, 2)?
        };
        debug_assert_eq!(
            concat.dims3()?,
            (bb, q_len, self.config.sources * self.config.model_dim)
        );
        match &self.output {
            Some(output) => output.forward(&concat),
            None => Ok(concat),
        }
    }

    /// `[bb, len, model_dim]` -> `[bb, heads, len, head_dim]`.
    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (bb, len, dim) = tensor.dims3()?;
        let head_dim = self.config.model_dim / self.config.heads;
        if dim != self.config.model_dim {
            bail!("cannot split width {dim} into {} heads", self.config.heads);
        }
        tensor
            .reshape((bb, len, self.config.heads, head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()
    }
}

/// `[bb, heads, len, head_dim]` -> `[bb, len, heads*head_dim]`.
fn join_heads(tensor: &Tensor) -> Result<Tensor> {
    let (bb, heads, len, head_dim) = tensor.dims4()?;
    tensor
        .permute((0, 2, 1, 3))?
        .contiguous()?
        .reshape((bb, len, heads * head_dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn config(sources: usize, output_dim: usize, project_output: bool) -> MultiHeadConfig {
        MultiHeadConfig {
            model_dim: 8,
            output_dim,
            heads: 2,
            sources,
            dropout_p: 0.0,
            project_output,
        }
    }

    #[test]
    fn output_keeps_query_layout() -> Result<()> {
        let device = Device::Cpu;
        let block = MultiHeadAttention::glorot(config(1, 8, false), &device)?;
        let q = Tensor::rand(-1f32, 1f32, (3, 5, 8), &device)?;
        let k = Tensor::rand(-1f32, 1f32, (3, 7, 8), &device)?;
        let v = Tensor::rand(-1f32, 1f32, (3, 7, 8), &device)?;
        let out = block.forward(
            &q,
            &[AttentionSource {
                keys: &k,
                values: &v,
                mask: None,
            }],
            false,
        )?;
        assert_eq!(out.dims3()?, (3, 5, 8));
        Ok(())
    }

    #[test]
    fn two_sources_concatenate_before_projection() -> Result<()> {
        let device = Device::Cpu;
        // concat width 16, output width 8: projection is mandatory.
        let block = MultiHeadAttention::glorot(config(2, 8, false), &device)?;
        let q = Tensor::rand(-1f32, 1f32, (2, 3, 8), &device)?;
        let k = Tensor::rand(-1f32, 1f32, (2, 4, 8), &device)?;
        let v = Tensor::rand(-1f32, 1f32, (2, 4, 8), &device)?;
        let source = AttentionSource {
            keys: &k,
            values: &v,
            mask: None,
        };
        let other = AttentionSource {
            keys: &k,
            values: &v,
            mask: None,
        };
        let out = block.forward(&q, &[source, other], false)?;
        assert_eq!(out.dims3()?, (2, 3, 8));
        Ok(())
    }

    #[test]
    fn forced_projection_is_applied() -> Result<()> {
        let device = Device::Cpu;
        let config = config(1, 8, true);
        let proj = |input_dim: usize| {
            Linear::glorot(
                LinearConfig {
                    input_dim,
                    output_dim: 8,
                    bias: false,
                },
                &device,
            )
        };
        // A zero output projection forces the block output to zero, which
        // proves the projection actually runs when widths already match.
        let zero = Linear::new(
            LinearConfig {
                input_dim: 8,
                output_dim: 8,
                bias: false,
            },
            Tensor::zeros((8, 8), DType::F32, &device)?,
            None,
        )?;
        let block =
            MultiHeadAttention::new(config, proj(8)?, vec![proj(8)?], vec![proj(8)?], Some(zero))?;
        let q = Tensor::rand(-1f32, 1f32, (1, 3, 8), &device)?;
        let out = block.forward(
            &q,
            &[AttentionSource {
                keys: &q,
                values: &q,
                mask: None,
            }],
            false,
        )?;
        let max = out.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(max, 0.0);
        Ok(())
    }

    #[test]
    fn zero_sources_rejected_at_build() {
        let device = Device::Cpu;
        assert!(MultiHeadAttention::glorot(config(0, 8, false), &device).is_err());
    }

    #[test]
    fn indivisible_heads_rejected() {
        let device = Device::Cpu;
        let mut config = config(1, 8, false);
        config.heads = 3;
        assert!(MultiHeadAttention::glorot(config, &device).is_err());
    }

    #[test]
    fn query_width_mismatch_fails() -> Result<()> {
        let device = Device::Cpu;
        let block = MultiHeadAttention::glorot(config(1, 8, false), &device)?;
        let q = Tensor::rand(-1f32, 1f32, (1, 3, 6), &device)?;
        let result = block.forward(
            &q,
            &[AttentionSource {
                keys: &q,
                values: &q,
                mask: None,
            }],
            false,
        );
        assert!(result.is_err());
        Ok(())
    }
}
