//! Transformer computation engine for sequence-to-sequence models.
//!
//! This crate implements the forward-pass machinery of an encoder-decoder
//! transformer (machine translation) and its encoder-only sibling (language
//! modeling) on top of [candle](https://github.com/huggingface/candle):
//! multi-head attention with an optional relative-position bias, per-layer
//! key/value caching for incremental decoding, sinusoidal embeddings, layer
//! normalization, dense-residual layer aggregation, and the attention-mask
//! algebra that ties padding and causality into every attention call.
//!
//! Training loops, beam search, tokenization and data handling live outside
//! this crate; they drive the entry points on
//! [`TransformerModel`](crate::models::transformer::TransformerModel).

pub mod config;
pub mod error;
pub mod kv_cache;
pub mod layers;
pub mod models;
#[cfg(test)]
pub(crate) mod util;
