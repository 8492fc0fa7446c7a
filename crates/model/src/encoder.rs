//! Encoder stack.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use attention::masks::to_additive;
use attention::AttentionSource;
use embedding::{add_positional_signal, TokenEmbedding};
use layers::{word_dropout, PreChain};

use crate::batch::Batch;
use crate::config::TransformerConfig;
use crate::sublayer::{AttentionSublayer, FfnSublayer};

/// Immutable product of one encoder pass, shared read-only by every
/// decoder step and every beam hypothesis.
#[derive(Clone)]
pub struct EncoderOutput {
    /// `[batch, src_len, model_dim]` context.
    pub context: Tensor,
    /// Multiplicative `[batch, src_len]` padding mask.
    pub mask: Tensor,
    pub batch: Arc<Batch>,
}

struct EncoderLayer {
    self_attention: AttentionSublayer,
    ffn: FfnSublayer,
}

/// Embeds one source stream and runs it through `enc_depth` layers of
/// self-attention and feed-forward sublayers.
pub struct Encoder {
    config: TransformerConfig,
    source_index: usize,
    embedding: TokenEmbedding,
    embedding_chain: PreChain,
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub fn new(
        config: &TransformerConfig,
        source_index: usize,
        embedding: TokenEmbedding,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let embedding_chain = PreChain::new(
            &config.postprocess_emb,
            config.model_dim,
            config.dropout,
            device,
        )
        .map_err(candle_core::Error::wrap)?;
        let mut layers = Vec::with_capacity(config.enc_depth);
        for _ in 0..config.enc_depth {
            layers.push(EncoderLayer {
                self_attention: AttentionSublayer::new(config, 1, device)?,
                ffn: FfnSublayer::new(config, device)?,
            });
        }
        log::debug!(
            "encoder[{source_index}] built: depth={} width={} heads={}",
            config.enc_depth,
            config.model_dim,
            config.heads
        );
        Ok(Self {
            config: config.clone(),
            source_index,
            embedding,
            embedding_chain,
            layers,
        })
    }

    pub fn embedding(&self) -> &TokenEmbedding {
        &self.embedding
    }

    /// Encodes this encoder's source sub-batch into a shared output.
    pub fn build(&self, batch: &Arc<Batch>, training: bool) -> Result<EncoderOutput> {
        let source = batch.source(self.source_index)?;
        let mask = source.mask().clone();

        let embedded = self.embedding.forward(source.ids())?;
        let embedded = word_dropout(&embedded, self.config.dropout_src, training)?;
        let scaled = embedded.affine((self.config.model_dim as f64).sqrt(), 0.0)?;
        let positioned = add_positional_signal(&scaled, 0)?;
        let mut hidden = self.embedding_chain.forward(&positioned, training)?;

        // [batch, 1, 1, src_len], broadcasts over heads and query length.
        let additive = to_additive(&mask)?;
        for layer in &self.layers {
            hidden = layer.self_attention.forward(
                &hidden,
                &[AttentionSource {
                    keys: &hidden,
                    values: &hidden,
                    mask: Some(&additive),
                }],
                training,
            )?;
            hidden = layer.ffn.forward(&hidden, training)?;
        }

        Ok(EncoderOutput {
            context: hidden,
            mask,
            batch: Arc::clone(batch),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SubBatch;
    use candle_core::Device;

    fn config() -> TransformerConfig {
        TransformerConfig {
            model_dim: 8,
            heads: 2,
            enc_depth: 1,
            dec_depth: 1,
            src_vocab_size: 12,
            trg_vocab_size: 12,
            ffn_dim: 16,
            aan_dim: 16,
            ..TransformerConfig::default()
        }
    }

    #[test]
    fn padded_positions_do_not_change_real_context() -> Result<()> {
        let device = Device::Cpu;
        let config = config();
        let embedding =
            TokenEmbedding::new(embedding::TokenEmbeddingConfig::new(12, 8), &device)?;
        let encoder = Encoder::new(&config, 0, embedding, &device)?;

        // Same three real tokens, once bare and once with two padding
        // positions whose ids differ; padding must not leak into the
        // attention result at the real positions.
        let bare = Arc::new(Batch::new(
            vec![SubBatch::dense(vec![1, 2, 3], 1, 3, 12, &device)?],
            None,
        )?);
        let ids = Tensor::from_vec(vec![1u32, 2, 3, 7, 9], (1, 5), &device)?;
        let mask = Tensor::from_vec(vec![1f32, 1.0, 1.0, 0.0, 0.0], (1, 5), &device)?;
        let padded = Arc::new(Batch::new(vec![SubBatch::new(ids, mask, 12)?], None)?);

        let bare_out = encoder.build(&bare, false)?;
        let padded_out = encoder.build(&padded, false)?;
        let real = padded_out.context.narrow(1, 0, 3)?;
        let diff = bare_out
            .context
            .sub(&real)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5, "padding leaked into real positions: {diff}");
        Ok(())
    }

    #[test]
    fn missing_source_stream_fails() -> Result<()> {
        let device = Device::Cpu;
        let config = config();
        let embedding =
            TokenEmbedding::new(embedding::TokenEmbeddingConfig::new(12, 8), &device)?;
        let encoder = Encoder::new(&config, 1, embedding, &device)?;
        let batch = Arc::new(Batch::new(
            vec![SubBatch::dense(vec![1, 2], 1, 2, 12, &device)?],
            None,
        )?);
        assert!(encoder.build(&batch, false).is_err());
        Ok(())
    }
}
