//! Pre/post-process chains and dense stacks wrapped around every sublayer.
//!
//! Each attention or feed-forward sublayer is sandwiched between an
//! order-sensitive pair of operation chains configured as short symbolic
//! strings interpreted left to right:
//!
//! * `d` — dropout (training only),
//! * `n` — layer normalisation,
//! * `a` — residual addition (post only),
//! * `h` — highway connection gated on the residual input (post only).
//!
//! Any other symbol is a fatal configuration error. The chains own their
//! learned parameters (one norm per chain, one highway gate), created
//! eagerly when the chain is parsed.

use candle_core::{Device, Tensor};

use crate::activations::{sigmoid, Activation};
use crate::dropout::dropout;
use crate::linear::{Linear, LinearConfig};
use crate::norm::{LayerNorm, NormConfig};
use crate::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Dropout,
    Norm,
    Residual,
    Highway,
}

fn parse_ops(ops: &str, allow_post: bool) -> Result<Vec<Op>, ConfigError> {
    ops.chars()
        .map(|symbol| match symbol {
            'd' => Ok(Op::Dropout),
            'n' => Ok(Op::Norm),
            'a' if allow_post => Ok(Op::Residual),
            'h' if allow_post => Ok(Op::Highway),
            'a' | 'h' => Err(ConfigError::PostOnlyOp {
                symbol,
                ops: ops.to_string(),
            }),
            _ => Err(ConfigError::UnknownOp {
                symbol,
                ops: ops.to_string(),
            }),
        })
        .collect()
}

/// Operation chain applied before a sublayer body.
#[derive(Debug, Clone)]
pub struct PreChain {
    ops: Vec<Op>,
    norm: Option<LayerNorm>,
    dropout_p: f32,
}

impl PreChain {
    /// Parses `ops` and allocates the parameters the chain needs.
    pub fn new(
        ops: &str,
        hidden: usize,
        dropout_p: f32,
        device: &Device,
    ) -> Result<Self, ConfigError> {
        let ops = parse_ops(ops, false)?;
        let norm = if ops.contains(&Op::Norm) {
            Some(LayerNorm::identity_init(NormConfig::new(hidden), device)?)
        } else {
            None
        };
        Ok(Self {
            ops,
            norm,
            dropout_p,
        })
    }

    /// Applies the chain left to right.
    pub fn forward(&self, input: &Tensor, training: bool) -> candle_core::Result<Tensor> {
        let mut output = input.clone();
        for op in &self.ops {
            output = match op {
                Op::Dropout => dropout(&output, self.dropout_p, training)?,
                Op::Norm => self
                    .norm
                    .as_ref()
                    .expect("norm allocated when chain contains 'n'")
                    .forward(&output)?,
                Op::Residual | Op::Highway => unreachable!("rejected during parsing"),
            };
        }
        Ok(output)
    }
}

/// Operation chain applied after a sublayer body.
///
/// The chain sees both the sublayer output and the original (pre-chain)
/// input, so residual and highway connections always close over the raw
/// residual stream.
#[derive(Debug, Clone)]
pub struct PostChain {
    ops: Vec<Op>,
    norm: Option<LayerNorm>,
    highway: Option<Linear>,
    dropout_p: f32,
}

impl PostChain {
    /// Parses `ops` and allocates the parameters the chain needs.
    pub fn new(
        ops: &str,
        hidden: usize,
        dropout_p: f32,
        device: &Device,
    ) -> Result<Self, ConfigError> {
        let ops = parse_ops(ops, true)?;
        let norm = if ops.contains(&Op::Norm) {
            Some(LayerNorm::identity_init(NormConfig::new(hidden), device)?)
        } else {
            None
        };
        let highway = if ops.contains(&Op::Highway) {
            Some(Linear::glorot(LinearConfig::new(hidden, hidden), device)?)
        } else {
            None
        };
        Ok(Self {
            ops,
            norm,
            highway,
            dropout_p,
        })
    }

    /// Applies the chain to `(output, residual_input)` left to right.
    pub fn forward(&self, output: &Tensor, residual: &Tensor, training: bool) -> candle_core::Result<Tensor> {
        let mut current = output.clone();
        for op in &self.ops {
            current = match op {
                Op::Dropout => dropout(&current, self.dropout_p, training)?,
                Op::Norm => self
                    .norm
                    .as_ref()
                    .expect("norm allocated when chain contains 'n'")
                    .forward(&current)?,
                Op::Residual => current.add(residual)?,
                Op::Highway => {
                    let gate_proj = self
                        .highway
                        .as_ref()
                        .expect("gate allocated when chain contains 'h'");
                    let gate = sigmoid(&gate_proj.forward(residual)?)?;
                    let ones = Tensor::ones_like(&gate)?;
                    let inverse = ones.sub(&gate)?;
                    current.mul(&gate)?.add(&residual.mul(&inverse)?)?
                }
            };
        }
        Ok(current)
    }
}

/// A stack of dense transforms shared by the feed-forward and
/// average-attention sublayers.
///
/// The first `activated` layers apply the configured non-linearity and
/// dropout; the remaining layers are plain projections back to model
/// width. The stack may be empty (average-attention with depth 1 and a
/// hidden width already equal to model width), in which case `forward`
/// is the identity.
#[derive(Debug, Clone)]
pub struct DenseStack {
    layers: Vec<Linear>,
    activated: usize,
    activation: Activation,
    dropout_p: f32,
}

impl DenseStack {
    /// Feed-forward flavour: `depth - 1` activated layers at `hidden_dim`,
    /// then a final projection to `model_dim` with no activation.
    pub fn feed_forward(
        model_dim: usize,
        hidden_dim: usize,
        depth: usize,
        activation: Activation,
        dropout_p: f32,
        device: &Device,
    ) -> Result<Self, ConfigError> {
        if depth < 1 {
            return Err(ConfigError::StackDepth(depth));
        }
        let mut layers = Vec::with_capacity(depth);
        let mut width = model_dim;
        for _ in 1..depth {
            layers.push(Self::project(width, hidden_dim, device)?);
            width = hidden_dim;
        }
        layers.push(Self::project(width, model_dim, device)?);
        Ok(Self {
            layers,
            activated: depth - 1,
            activation,
            dropout_p,
        })
    }

    /// Average-attention flavour: `depth - 1` activated layers at
    /// `hidden_dim`, with a final projection back to `model_dim` only
    /// when the running width no longer matches it.
    pub fn average_attention(
        model_dim: usize,
        hidden_dim: usize,
        depth: usize,
        activation: Activation,
        dropout_p: f32,
        device: &Device,
    ) -> Result<Self, ConfigError> {
        if depth < 1 {
            return Err(ConfigError::StackDepth(depth));
        }
        let mut layers = Vec::new();
        let mut width = model_dim;
        for _ in 1..depth {
            layers.push(Self::project(width, hidden_dim, device)?);
            width = hidden_dim;
        }
        let activated = layers.len();
        if width != model_dim {
            layers.push(Self::project(width, model_dim, device)?);
        }
        Ok(Self {
            layers,
            activated,
            activation,
            dropout_p,
        })
    }

    fn project(input: usize, output: usize, device: &Device) -> Result<Linear, ConfigError> {
        Ok(Linear::glorot(LinearConfig::new(input, output), device)?)
    }

    /// Runs the stack; the identity when no layers were allocated.
    pub fn forward(&self, input: &Tensor, training: bool) -> candle_core::Result<Tensor> {
        let mut output = input.clone();
        for (index, layer) in self.layers.iter().enumerate() {
            output = layer.forward(&output)?;
            if index < self.activated {
                output = self.activation.forward(&output)?;
                output = dropout(&output, self.dropout_p, training)?;
            }
        }
        Ok(output)
    }
}
