//! Token embeddings and the deterministic positional signal.

pub mod positional;
pub mod token;

pub use positional::{add_positional_signal, sinusoidal_signal};
pub use token::{TokenEmbedding, TokenEmbeddingConfig};
