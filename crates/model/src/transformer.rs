//! Top-level model: encoder stacks plus decoder, with embedding tying.
//!
//! Tying is explicit shared storage: a cloned `TokenEmbedding` reads
//! and writes the same underlying variable, and a tied output layer
//! projects through the transposed table of the embedding it was built
//! from. Every parameter is allocated here, at build time.

use std::sync::Arc;

use candle_core::{Device, Result, Tensor};

use embedding::{TokenEmbedding, TokenEmbeddingConfig};

use crate::batch::Batch;
use crate::config::TransformerConfig;
use crate::decoder::Decoder;
use crate::encoder::{Encoder, EncoderOutput};
use crate::output::OutputLayer;
use crate::state::DecoderState;

/// How to fill an embedding table at build time.
pub enum EmbeddingInit {
    Random,
    /// A `(vocab, dim)` tensor of vectors, optionally length-normalized.
    Pretrained { vectors: Tensor, normalize: bool },
}

impl EmbeddingInit {
    fn build(self, config: TokenEmbeddingConfig, device: &Device) -> Result<TokenEmbedding> {
        match self {
            EmbeddingInit::Random => TokenEmbedding::new(config, device),
            EmbeddingInit::Pretrained { vectors, normalize } => {
                TokenEmbedding::from_pretrained(config, vectors, normalize)
            }
        }
    }
}

pub struct Transformer {
    config: TransformerConfig,
    encoders: Vec<Encoder>,
    decoder: Decoder,
}

impl Transformer {
    pub fn new(config: TransformerConfig, device: &Device) -> Result<Self> {
        Self::with_embeddings(config, EmbeddingInit::Random, EmbeddingInit::Random, device)
    }

    /// Builds the full model, wiring embedding tables according to the
    /// tying flags: `tied_embeddings_all` shares one table everywhere,
    /// `tied_embeddings` ties the output projection to the target table.
    pub fn with_embeddings(
        config: TransformerConfig,
        src_init: EmbeddingInit,
        trg_init: EmbeddingInit,
        device: &Device,
    ) -> Result<Self> {
        config.validate().map_err(|e| e.wrap())?;

        let src_config = TokenEmbeddingConfig {
            frozen: config.fix_src_embeddings,
            ..TokenEmbeddingConfig::new(config.src_vocab_size, config.model_dim)
        };
        let trg_config = TokenEmbeddingConfig {
            frozen: config.fix_trg_embeddings,
            ..TokenEmbeddingConfig::new(config.trg_vocab_size, config.model_dim)
        };

        let src_embedding = src_init.build(src_config, device)?;
        let trg_embedding = if config.tied_embeddings_all {
            src_embedding.clone()
        } else {
            trg_init.build(trg_config, device)?
        };

        let encoders = (0..config.encoder_sources)
            .map(|index| Encoder::new(&config, index, src_embedding.clone(), device))
            .collect::<Result<Vec<Encoder>>>()?;

        let output = if config.tied_embeddings || config.tied_embeddings_all {
            OutputLayer::tied(trg_embedding.clone(), device)?
        } else {
            OutputLayer::owned(config.trg_vocab_size, config.model_dim, device)?
        };
        let decoder = Decoder::new(&config, trg_embedding, output, device)?;

        Ok(Self {
            config,
            encoders,
            decoder,
        })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn encoders(&self) -> &[Encoder] {
        &self.encoders
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut Decoder {
        &mut self.decoder
    }

    /// Runs every encoder over the batch and opens a decoding state.
    pub fn start(&self, batch: Arc<Batch>, training: bool) -> Result<DecoderState> {
        let outputs = self
            .encoders
            .iter()
            .map(|encoder| Ok(Arc::new(encoder.build(&batch, training)?)))
            .collect::<Result<Vec<Arc<EncoderOutput>>>>()?;
        self.decoder.start_state(batch, outputs)
    }

    /// Scores a full target sequence in one step at position 0,
    /// returning `[batch, trg_len, vocab]` logits.
    pub fn score(
        &self,
        batch: Arc<Batch>,
        training: bool,
    ) -> Result<Tensor> {
        let target = batch.target().ok_or_else(|| {
            candle_core::Error::Msg("scoring needs a target sub-batch".to_string())
        })?;
        let ids = target.ids().clone();
        let mask = target.mask().clone();
        let state = self.start(Arc::clone(&batch), training)?;
        let state = state.with_target(ids, Some(mask))?;
        let stepped = self.decoder.step(&state, training)?;
        stepped.logits().cloned().ok_or_else(|| {
            candle_core::Error::Msg("decoder step produced no logits".to_string())
        })
    }
}
