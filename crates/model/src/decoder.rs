//! Decoder stack and its step function.
//!
//! One `step` call covers both inference regimes: full-sequence scoring
//! passes the whole target with its padding mask at position 0, and
//! incremental decoding passes one token per call, each step consuming
//! a state and producing its successor.

use std::sync::Arc;

use candle_core::{bail, Result, Tensor};

use attention::masks::{causal_mask, intersect, to_additive};
use attention::AttentionSource;
use embedding::{add_positional_signal, TokenEmbedding};
use layers::{word_dropout, PreChain};

use crate::batch::Batch;
use crate::config::TransformerConfig;
use crate::encoder::EncoderOutput;
use crate::output::OutputLayer;
use crate::state::{DecoderState, LayerState};
use crate::sublayer::{AttentionSublayer, AverageAttentionSublayer, FfnSublayer};

enum AutoregLayer {
    SelfAttention(AttentionSublayer),
    Average(AverageAttentionSublayer),
}

struct DecoderLayer {
    autoreg: AutoregLayer,
    cross: Vec<AttentionSublayer>,
    ffn: FfnSublayer,
}

pub struct Decoder {
    config: TransformerConfig,
    embedding: TokenEmbedding,
    embedding_chain: PreChain,
    layers: Vec<DecoderLayer>,
    output: OutputLayer,
}

impl Decoder {
    pub fn new(
        config: &TransformerConfig,
        embedding: TokenEmbedding,
        output: OutputLayer,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let average = config.autoreg_is_average().map_err(|e| e.wrap())?;
        let embedding_chain = PreChain::new(
            &config.postprocess_emb,
            config.model_dim,
            config.dropout,
            device,
        )
        .map_err(candle_core::Error::wrap)?;
        let mut layers = Vec::with_capacity(config.dec_depth);
        for _ in 0..config.dec_depth {
            let autoreg = if average {
                AutoregLayer::Average(AverageAttentionSublayer::new(config, device)?)
            } else {
                AutoregLayer::SelfAttention(AttentionSublayer::new(config, 1, device)?)
            };
            let cross = (0..config.encoder_sources)
                .map(|_| AttentionSublayer::new(config, 1, device))
                .collect::<Result<Vec<_>>>()?;
            layers.push(DecoderLayer {
                autoreg,
                cross,
                ffn: FfnSublayer::new(config, device)?,
            });
        }
        log::debug!(
            "decoder built: depth={} width={} heads={} autoreg={}",
            config.dec_depth,
            config.model_dim,
            config.heads,
            config.autoreg
        );
        Ok(Self {
            config: config.clone(),
            embedding,
            embedding_chain,
            layers,
            output,
        })
    }

    pub fn embedding(&self) -> &TokenEmbedding {
        &self.embedding
    }

    pub fn output_layer(&self) -> &OutputLayer {
        &self.output
    }

    /// Restricts the vocabulary scored by subsequent steps.
    pub fn set_shortlist(&mut self, indices: Option<Tensor>) -> Result<()> {
        self.output.set_shortlist(indices)
    }

    /// Creates the initial state: empty per-layer caches, position 0,
    /// no logits yet.
    pub fn start_state(
        &self,
        batch: Arc<Batch>,
        encoder_outputs: Vec<Arc<EncoderOutput>>,
    ) -> Result<DecoderState> {
        if encoder_outputs.len() != self.config.encoder_sources {
            bail!(
                "decoder attends {} encoder sources, got {} encoder outputs",
                self.config.encoder_sources,
                encoder_outputs.len()
            );
        }
        Ok(DecoderState::initial(
            self.config.dec_depth,
            encoder_outputs,
            batch,
        ))
    }

    /// Consumes a state at position `k` and produces its successor at
    /// `k + 1` with updated caches and fresh logits. The input state is
    /// never modified.
    pub fn step(&self, state: &DecoderState, training: bool) -> Result<DecoderState> {
        let target = state.target().ok_or_else(|| {
            candle_core::Error::Msg(
                "decoder step needs pending target tokens; call with_target first".to_string(),
            )
        })?;
        let (bb, q_len) = target.ids.dims2()?;
        let position = state.position();
        if position > 0 && q_len > 1 {
            bail!("incremental steps past position 0 take one token at a time, got {q_len}");
        }
        let device = target.ids.device();

        let embedded = self.embedding.forward(&target.ids)?;
        let embedded = word_dropout(&embedded, self.config.dropout_trg, training)?;
        let scaled = embedded.affine((self.config.model_dim as f64).sqrt(), 0.0)?;
        let positioned = add_positional_signal(&scaled, position)?;
        let mut query = self.embedding_chain.forward(&positioned, training)?;

        // Square over the current query length; when attending a longer
        // cache the additive zeros broadcast across the key axis.
        let causal = causal_mask(device, q_len)?.reshape((1, q_len, q_len))?;
        let self_mult = match &target.mask {
            Some(mask) => {
                if position > 0 {
                    bail!("a target padding mask is only meaningful at position 0");
                }
                intersect(&causal, &mask.reshape((bb, 1, q_len))?)?
            }
            None => causal,
        };
        let self_additive = to_additive(&self_mult)?;

        let cross_masks = state
            .encoder_outputs()
            .iter()
            .map(|encoder| to_additive(&encoder.mask))
            .collect::<Result<Vec<Tensor>>>()?;

        let mut new_layers = Vec::with_capacity(self.layers.len());
        for (layer, prev) in self.layers.iter().zip(state.layers()) {
            let (output, cache) = match &layer.autoreg {
                AutoregLayer::SelfAttention(attention) => {
                    let history = match prev.cache() {
                        Some(cache) => Tensor::cat(&[cache, &query], 1)?,
                        None => query.clone(),
                    };
                    let output = attention.forward(
                        &query,
                        &[AttentionSource {
                            keys: &history,
                            values: &history,
                            mask: Some(&self_additive),
                        }],
                        training,
                    )?;
                    (output, history)
                }
                AutoregLayer::Average(average) => {
                    let averaged = match prev.cache() {
                        Some(cache) => {
                            let last = cache.narrow(1, cache.dim(1)? - 1, 1)?;
                            AverageAttentionSublayer::average_step(&last, &query, position)?
                        }
                        None if q_len > 1 => {
                            AverageAttentionSublayer::average_matrix(&query, &self_mult)?
                        }
                        None => query.clone(),
                    };
                    let output = average.forward(&query, &averaged, training)?;
                    (output, averaged)
                }
            };
            new_layers.push(LayerState::with_cache(cache));
            query = output;

            if layer.cross.len() != state.encoder_outputs().len() {
                bail!(
                    "decoder layer has {} cross-attention blocks, state carries {} encoders",
                    layer.cross.len(),
                    state.encoder_outputs().len()
                );
            }
            for ((cross, encoder), mask) in layer
                .cross
                .iter()
                .zip(state.encoder_outputs())
                .zip(&cross_masks)
            {
                query = cross.forward(
                    &query,
                    &[AttentionSource {
                        keys: &encoder.context,
                        values: &encoder.context,
                        mask: Some(mask),
                    }],
                    training,
                )?;
            }
            query = layer.ffn.forward(&query, training)?;
        }

        let logits = self.output.forward(&query)?;
        Ok(state.successor(new_layers, logits))
    }
}
