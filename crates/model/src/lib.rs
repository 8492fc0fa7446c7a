//! Sequence-to-sequence transformer stacks.
//!
//! The crate wires the attention, embedding, and layer building blocks
//! into an encoder stack, a decoder stack with an incremental stepping
//! state machine, and the vocabulary output layer. Corpus handling,
//! beam search itself, training loops, and checkpointing live outside;
//! they interact through `Batch`, `EncoderOutput`, and `DecoderState`.

pub mod batch;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod output;
pub mod state;
pub mod sublayer;
pub mod transformer;

pub use batch::{Batch, SubBatch};
pub use config::{ModelError, TransformerConfig};
pub use decoder::Decoder;
pub use encoder::{Encoder, EncoderOutput};
pub use output::OutputLayer;
pub use state::{DecoderState, LayerState, TargetInput};
pub use transformer::{EmbeddingInit, Transformer};
