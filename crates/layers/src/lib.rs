//! Building blocks for transformer sublayers.
//!
//! Everything in this crate operates on tensors following the
//! `(batch, seq, feature)` convention, where the leading axis may fold a
//! beam dimension during decoding. Learned parameters are owned by the
//! layer structs and created eagerly at construction time; weight tying
//! is expressed as explicit shared storage rather than a global
//! parameter namespace.

use thiserror::Error;

pub mod activations;
pub mod checks;
pub mod dropout;
pub mod linear;
pub mod norm;
pub mod sublayer;

pub use activations::{sigmoid, Activation};
pub use dropout::{dropout, word_dropout};
pub use linear::{Linear, LinearConfig};
pub use norm::{LayerNorm, NormConfig};
pub use sublayer::{DenseStack, PostChain, PreChain};

/// Fatal configuration mistakes surfaced while assembling layers.
///
/// These indicate programmer or configuration errors and abort the model
/// build; they are never recoverable at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An operation symbol outside the supported pre/post-process set.
    #[error("unknown sublayer operation '{symbol}' in \"{ops}\" (expected d, n, a, or h)")]
    UnknownOp { symbol: char, ops: String },
    /// An operation symbol only valid in post-processing used in a pre chain.
    #[error("operation '{symbol}' is only valid in post-processing chains, got \"{ops}\"")]
    PostOnlyOp { symbol: char, ops: String },
    /// An activation name outside the supported catalogue.
    #[error("unknown activation '{0}' (expected relu or swish)")]
    UnknownActivation(String),
    /// A dense stack configured with no layers at all.
    #[error("dense stack depth must be at least 1, got {0}")]
    StackDepth(usize),
    /// Parameter allocation failed while assembling a chain or stack.
    #[error("parameter allocation failed: {0}")]
    Allocation(#[from] candle_core::Error),
}
