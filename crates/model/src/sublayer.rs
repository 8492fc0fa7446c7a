//! Sublayer bodies wrapped in their pre/post-process chains.
//!
//! Every block follows the same discipline: the pre chain runs on the
//! query/input, the body runs on raw inputs, and the post chain closes
//! over the original input for residual and highway connections.

use candle_core::{bail, Device, Result, Tensor};

use attention::{AttentionSource, MultiHeadAttention, MultiHeadConfig};
use layers::{sigmoid, DenseStack, Linear, LinearConfig, PostChain, PreChain};

use crate::config::TransformerConfig;

/// Multi-head attention between its op chains. The pre chain applies to
/// the query only; keys and values enter the projections untouched, so
/// cached decoder inputs stay comparable across steps.
pub struct AttentionSublayer {
    pre: PreChain,
    post: PostChain,
    attention: MultiHeadAttention,
}

impl AttentionSublayer {
    pub fn new(config: &TransformerConfig, sources: usize, device: &Device) -> Result<Self> {
        let pre = PreChain::new(&config.preprocess, config.model_dim, config.dropout, device)
            .map_err(candle_core::Error::wrap)?;
        let post = PostChain::new(&config.postprocess, config.model_dim, config.dropout, device)
            .map_err(candle_core::Error::wrap)?;
        let attention = MultiHeadAttention::glorot(
            MultiHeadConfig {
                model_dim: config.model_dim,
                output_dim: config.model_dim,
                heads: config.heads,
                sources,
                dropout_p: config.dropout_attn,
                project_output: !config.no_projection,
            },
            device,
        )?;
        Ok(Self {
            pre,
            post,
            attention,
        })
    }

    pub fn forward(
        &self,
        input: &Tensor,
        sources: &[AttentionSource<'_>],
        training: bool,
    ) -> Result<Tensor> {
        let query = self.pre.forward(input, training)?;
        let output = self.attention.forward(&query, sources, training)?;
        self.post.forward(&output, input, training)
    }
}

/// Position-wise feed-forward block.
pub struct FfnSublayer {
    pre: PreChain,
    post: PostChain,
    stack: DenseStack,
}

impl FfnSublayer {
    pub fn new(config: &TransformerConfig, device: &Device) -> Result<Self> {
        let pre = PreChain::new(&config.preprocess, config.model_dim, config.dropout, device)
            .map_err(candle_core::Error::wrap)?;
        let post = PostChain::new(&config.postprocess, config.model_dim, config.dropout, device)
            .map_err(candle_core::Error::wrap)?;
        let activation = config.ffn_activation().map_err(|e| e.wrap())?;
        let stack = DenseStack::feed_forward(
            config.model_dim,
            config.ffn_dim,
            config.ffn_depth,
            activation,
            config.dropout_ffn,
            device,
        )
        .map_err(candle_core::Error::wrap)?;
        Ok(Self { pre, post, stack })
    }

    pub fn forward(&self, input: &Tensor, training: bool) -> Result<Tensor> {
        let output = self.pre.forward(input, training)?;
        let output = self.stack.forward(&output, training)?;
        self.post.forward(&output, input, training)
    }
}

/// Average-attention block: replaces learned self-attention weights
/// with a cumulative average of the positions seen so far, refined by a
/// small dense stack and, unless disabled, blended with the input
/// through two independently learned sigmoid gates. The gates are not
/// normalized to sum to one.
pub struct AverageAttentionSublayer {
    pre: PreChain,
    post: PostChain,
    stack: DenseStack,
    gates: Option<(Linear, Linear)>,
}

impl AverageAttentionSublayer {
    pub fn new(config: &TransformerConfig, device: &Device) -> Result<Self> {
        let pre = PreChain::new(&config.preprocess, config.model_dim, config.dropout, device)
            .map_err(candle_core::Error::wrap)?;
        let post = PostChain::new(&config.postprocess, config.model_dim, config.dropout, device)
            .map_err(candle_core::Error::wrap)?;
        let activation = config.aan_activation().map_err(|e| e.wrap())?;
        let stack = DenseStack::average_attention(
            config.model_dim,
            config.aan_dim,
            config.aan_depth,
            activation,
            config.dropout_ffn,
            device,
        )
        .map_err(candle_core::Error::wrap)?;
        let gates = if config.aan_no_gate {
            None
        } else {
            let gate = || {
                Linear::glorot(
                    LinearConfig::new(config.model_dim, config.model_dim),
                    device,
                )
            };
            Some((gate()?, gate()?))
        };
        Ok(Self {
            pre,
            post,
            stack,
            gates,
        })
    }

    /// Closed-form cumulative average over a full sequence.
    ///
    /// `mask` is the multiplicative causal-and-padding mask, `[b, q, q]`
    /// with `b` equal to 1 or the batch size; its rows are normalized to
    /// sum to 1 before the batched multiply.
    pub fn average_matrix(input: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (bb, len, _) = input.dims3()?;
        let (mb, rows, cols) = mask.dims3()?;
        if rows != len || cols != len {
            bail!(
                "average mask {:?} does not cover sequence length {len}",
                mask.dims()
            );
        }
        if mb != 1 && bb % mb != 0 {
            bail!("average mask batch {mb} incompatible with input batch {bb}");
        }
        let row_sums = mask.sum_keepdim(candle_core::D::Minus1)?;
        let normalized = mask.broadcast_div(&row_sums)?;
        let normalized = normalized
            .broadcast_as((bb, len, len))?
            .contiguous()?;
        normalized.matmul(input)
    }

    /// Incremental recurrence at step `t > 0`:
    /// `(previous * t + input) / (t + 1)`.
    pub fn average_step(previous: &Tensor, input: &Tensor, t: usize) -> Result<Tensor> {
        previous
            .affine(t as f64, 0.0)?
            .add(input)?
            .affine(1.0 / (t as f64 + 1.0), 0.0)
    }

    /// Refines an already-computed average and applies gating and the
    /// post chain. `input` is the raw residual stream, `average` the
    /// cumulative average aligned with it.
    pub fn forward(&self, input: &Tensor, average: &Tensor, training: bool) -> Result<Tensor> {
        let refined = self.pre.forward(average, training)?;
        let mut refined = self.stack.forward(&refined, training)?;
        if let Some((input_gate, average_gate)) = &self.gates {
            let gi = sigmoid(&input_gate.forward(input)?)?;
            let gf = sigmoid(&average_gate.forward(&refined)?)?;
            refined = input.mul(&gi)?.add(&refined.mul(&gf)?)?;
        }
        self.post.forward(&refined, input, training)
    }
}
