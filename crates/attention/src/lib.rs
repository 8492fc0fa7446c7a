//! Attention primitives for the seq2seq transformer.
//!
//! The crate covers three layers of the attention story:
//!
//! * [`masks`] — multiplicative `{0, 1}` mask builders and the
//!   conversion into additive log-domain masks added to pre-softmax
//!   scores,
//! * [`scaled`] — the scaled dot-product kernel over
//!   `[beam*batch, heads, seq, head_dim]` tensors, including the beam
//!   broadcast of cached keys and values during decoding,
//! * [`multihead`] — the multi-head wrapper owning the learned
//!   projections, with support for several key/value sources whose
//!   outputs are concatenated before the final projection.

pub mod masks;
pub mod multihead;
pub mod scaled;

pub use multihead::{AttentionSource, MultiHeadAttention, MultiHeadConfig};
pub use scaled::ScaledDotProduct;
