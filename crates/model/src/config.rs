//! Flat model configuration.
//!
//! One serde-friendly struct carries every option the encoder and
//! decoder stacks consume. Validation happens once, up front; anything
//! that survives `validate` builds without further configuration
//! checks, so a bad option string or activation name can never surface
//! in the middle of a forward pass.

use layers::{Activation, ConfigError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Autoregressive sublayer selector for the decoder.
pub const AUTOREG_SELF_ATTENTION: &str = "self-attention";
pub const AUTOREG_AVERAGE_ATTENTION: &str = "average-attention";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Layer(#[from] ConfigError),
    #[error("unknown autoregressive layer type `{0}` (expected `self-attention` or `average-attention`)")]
    UnknownAutoreg(String),
    #[error("attention heads {heads} must be nonzero and divide model width {model_dim}")]
    Heads { heads: usize, model_dim: usize },
    #[error("model width {0} must be even for the sinusoidal positional signal")]
    OddModelWidth(usize),
    #[error("{field} must be at least 1")]
    ZeroDepth { field: &'static str },
    #[error("{side} vocabulary size must be nonzero")]
    EmptyVocabulary { side: &'static str },
    #[error("tying all embeddings requires equal vocabularies, got source {src} and target {trg}")]
    TiedVocabularies { src: usize, trg: usize },
}

impl ModelError {
    /// Lifts a configuration error into the tensor-engine error type
    /// used by the build and step APIs.
    pub fn wrap(self) -> candle_core::Error {
        candle_core::Error::wrap(self)
    }
}

/// Every option consumed by the transformer stacks, in one flat struct.
///
/// Defaults follow the conventional base setup: post-norm residual
/// blocks (`postprocess = "dan"`), embedding dropout only, relu
/// feed-forward, self-attention decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    /// Model (feature) width at every sublayer boundary.
    pub model_dim: usize,
    /// Attention head count; must divide `model_dim`.
    pub heads: usize,
    pub enc_depth: usize,
    pub dec_depth: usize,
    pub src_vocab_size: usize,
    pub trg_vocab_size: usize,
    /// Number of encoder stacks attended over by the decoder.
    pub encoder_sources: usize,

    pub ffn_dim: usize,
    pub ffn_depth: usize,
    /// `relu` or `swish`.
    pub ffn_activation: String,

    pub aan_dim: usize,
    pub aan_depth: usize,
    pub aan_activation: String,
    /// Disables the two sigmoid gates of the average-attention blend.
    pub aan_no_gate: bool,
    /// `self-attention` or `average-attention`.
    pub autoreg: String,

    /// Op chain run before every sublayer body (`d`, `n`).
    pub preprocess: String,
    /// Op chain run after every sublayer body (`d`, `n`, `a`, `h`).
    pub postprocess: String,
    /// Op chain run on embeddings before the first layer.
    pub postprocess_emb: String,

    /// Dropout inside the pre/post chains.
    pub dropout: f32,
    /// Dropout on attention weights.
    pub dropout_attn: f32,
    /// Dropout between activated dense layers.
    pub dropout_ffn: f32,
    /// Whole-position word dropout on source embeddings.
    pub dropout_src: f32,
    /// Whole-position word dropout on target embeddings.
    pub dropout_trg: f32,

    /// Ties the output projection to the target embedding (transposed).
    pub tied_embeddings: bool,
    /// Shares one embedding table across source, target, and output.
    pub tied_embeddings_all: bool,
    pub fix_src_embeddings: bool,
    pub fix_trg_embeddings: bool,
    /// Skips the attention output projection when widths already agree.
    pub no_projection: bool,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            model_dim: 512,
            heads: 8,
            enc_depth: 6,
            dec_depth: 6,
            src_vocab_size: 0,
            trg_vocab_size: 0,
            encoder_sources: 1,
            ffn_dim: 2048,
            ffn_depth: 2,
            ffn_activation: "relu".to_string(),
            aan_dim: 2048,
            aan_depth: 2,
            aan_activation: "relu".to_string(),
            aan_no_gate: false,
            autoreg: AUTOREG_SELF_ATTENTION.to_string(),
            preprocess: String::new(),
            postprocess: "dan".to_string(),
            postprocess_emb: "d".to_string(),
            dropout: 0.0,
            dropout_attn: 0.0,
            dropout_ffn: 0.0,
            dropout_src: 0.0,
            dropout_trg: 0.0,
            tied_embeddings: false,
            tied_embeddings_all: false,
            fix_src_embeddings: false,
            fix_trg_embeddings: false,
            no_projection: false,
        }
    }
}

impl TransformerConfig {
    /// Checks every option that could otherwise fail mid-build.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.heads == 0 || self.model_dim % self.heads != 0 {
            return Err(ModelError::Heads {
                heads: self.heads,
                model_dim: self.model_dim,
            });
        }
        if self.model_dim % 2 != 0 {
            return Err(ModelError::OddModelWidth(self.model_dim));
        }
        for (field, value) in [
            ("enc_depth", self.enc_depth),
            ("dec_depth", self.dec_depth),
            ("ffn_depth", self.ffn_depth),
            ("aan_depth", self.aan_depth),
            ("encoder_sources", self.encoder_sources),
        ] {
            if value < 1 {
                return Err(ModelError::ZeroDepth { field });
            }
        }
        if self.src_vocab_size == 0 {
            return Err(ModelError::EmptyVocabulary { side: "source" });
        }
        if self.trg_vocab_size == 0 {
            return Err(ModelError::EmptyVocabulary { side: "target" });
        }
        Activation::from_name(&self.ffn_activation)?;
        Activation::from_name(&self.aan_activation)?;
        self.autoreg_is_average()?;
        if self.tied_embeddings_all && self.src_vocab_size != self.trg_vocab_size {
            return Err(ModelError::TiedVocabularies {
                src: self.src_vocab_size,
                trg: self.trg_vocab_size,
            });
        }
        Ok(())
    }

    /// Resolves the autoregressive layer selector.
    pub fn autoreg_is_average(&self) -> Result<bool, ModelError> {
        match self.autoreg.as_str() {
            AUTOREG_SELF_ATTENTION => Ok(false),
            AUTOREG_AVERAGE_ATTENTION => Ok(true),
            other => Err(ModelError::UnknownAutoreg(other.to_string())),
        }
    }

    pub(crate) fn ffn_activation(&self) -> Result<Activation, ModelError> {
        Ok(Activation::from_name(&self.ffn_activation)?)
    }

    pub(crate) fn aan_activation(&self) -> Result<Activation, ModelError> {
        Ok(Activation::from_name(&self.aan_activation)?)
    }
}
