use std::iter::repeat_with;

use candle_core::Tensor;
use snafu::{ensure, ResultExt, Snafu};

/// Key-value cache errors.
#[derive(Debug, Snafu)]
pub enum KeyValueCacheError {
    #[snafu(display("Cannot append to a cache holding fixed entries"))]
    AppendToFixed,

    #[snafu(display("Cached batch size {cached} does not match update batch size {update}"))]
    BatchSize { cached: usize, update: usize },

    #[snafu(display("Cannot extend cached key"))]
    ExtendKey { source: candle_core::Error },

    #[snafu(display("Cannot extend cached value"))]
    ExtendValue { source: candle_core::Error },

    #[snafu(display("Cannot project key and value"))]
    Project { source: candle_core::Error },

    #[snafu(display("Cannot reuse projections from a cache holding grown entries"))]
    ReuseGrown,

    #[snafu(display("Cannot select cached batches"))]
    SelectBatch { source: candle_core::Error },
}

/// Internal representation of `KeyValueCache`.
enum CacheState {
    /// Nothing stored yet.
    Empty,

    /// Entries computed once and reused unchanged on every later step.
    Fixed { key: Tensor, value: Tensor },

    /// Entries extended along the time dimension on every step.
    Growing { key: Tensor, value: Tensor },
}

/// Key-value cache for one attention sublayer.
///
/// The cache distinguishes entries that grow step by step (decoder
/// self-attention) from entries that are projected once and reused
/// (encoder-decoder attention). A sublayer must stick to one of the two
/// protocols; mixing them on the same cache is an error. Tensors are
/// stored before the head split. *Shape:* `(batch_size, seq_len,
/// hidden_width)`
pub struct KeyValueCache {
    state: CacheState,
    enabled: bool,
}

impl KeyValueCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            state: CacheState::Empty,
            enabled: true,
        }
    }

    /// Create a pass-through cache.
    ///
    /// This type of cache does not store anything. Updates to the cache are
    /// discarded.
    pub fn disabled() -> Self {
        Self {
            state: CacheState::Empty,
            enabled: false,
        }
    }

    /// Check whether the cache stores updates.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Switch storing of updates on or off.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Check whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        matches!(self.state, CacheState::Empty)
    }

    /// Length of the stored entries along the time dimension.
    pub fn seen_len(&self) -> usize {
        match &self.state {
            CacheState::Empty => 0,
            CacheState::Fixed { key, .. } | CacheState::Growing { key, .. } => {
                key.dim(1).unwrap_or(0)
            }
        }
    }

    /// Drop all stored entries.
    pub fn clear(&mut self) {
        self.state = CacheState::Empty;
    }

    /// Extend the cache along the time dimension.
    ///
    /// Returns the full entries including the update. On a pass-through
    /// cache the update is returned unchanged.
    ///
    /// * `key` - Key update. *Shape:* `(batch_size, new_len, hidden_width)`
    /// * `value` - Value update. *Shape:* `(batch_size, new_len, hidden_width)`
    pub fn append(
        &mut self,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor), KeyValueCacheError> {
        if !self.enabled {
            return Ok((key.clone(), value.clone()));
        }

        match &mut self.state {
            CacheState::Empty => {
                self.state = CacheState::Growing {
                    key: key.clone(),
                    value: value.clone(),
                };
                Ok((key.clone(), value.clone()))
            }
            CacheState::Growing {
                key: cached_key,
                value: cached_value,
            } => {
                let cached = cached_key.dim(0).context(ExtendKeySnafu)?;
                let update = key.dim(0).context(ExtendKeySnafu)?;
                ensure!(cached == update, BatchSizeSnafu { cached, update });

                *cached_key = Tensor::cat(&[&*cached_key, key], 1).context(ExtendKeySnafu)?;
                *cached_value =
                    Tensor::cat(&[&*cached_value, value], 1).context(ExtendValueSnafu)?;

                Ok((cached_key.clone(), cached_value.clone()))
            }
            CacheState::Fixed { .. } => AppendToFixedSnafu.fail(),
        }
    }

    /// Compute the entries on the first call and reuse them afterwards.
    ///
    /// `project` is only invoked when the cache is empty. On a pass-through
    /// cache it is invoked on every call.
    pub fn reuse_projected<F>(&mut self, project: F) -> Result<(Tensor, Tensor), KeyValueCacheError>
    where
        F: FnOnce() -> Result<(Tensor, Tensor), candle_core::Error>,
    {
        if !self.enabled {
            return project().context(ProjectSnafu);
        }

        match &self.state {
            CacheState::Empty => {
                let (key, value) = project().context(ProjectSnafu)?;
                self.state = CacheState::Fixed {
                    key: key.clone(),
                    value: value.clone(),
                };
                Ok((key, value))
            }
            CacheState::Fixed { key, value } => Ok((key.clone(), value.clone())),
            CacheState::Growing { .. } => ReuseGrownSnafu.fail(),
        }
    }

    /// Keep only the batches selected by `live`.
    ///
    /// * `live` - Indices of the batches to keep. *Shape:* `(n_live,)`
    pub fn keep_alive(&mut self, live: &Tensor) -> Result<(), KeyValueCacheError> {
        self.select_batches(live)
    }

    /// Put the cached batches into a new order.
    ///
    /// * `permutation` - Batch index per output slot. *Shape:* `(batch_size,)`
    pub fn reorder(&mut self, permutation: &Tensor) -> Result<(), KeyValueCacheError> {
        self.select_batches(permutation)
    }

    fn select_batches(&mut self, indices: &Tensor) -> Result<(), KeyValueCacheError> {
        match &mut self.state {
            CacheState::Empty => Ok(()),
            CacheState::Fixed { key, value } | CacheState::Growing { key, value } => {
                *key = key.index_select(indices, 0).context(SelectBatchSnafu)?;
                *value = value.index_select(indices, 0).context(SelectBatchSnafu)?;
                Ok(())
            }
        }
    }
}

impl Default for KeyValueCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Caches for all attention sublayers of a decoder.
///
/// Holds one growing cache per self-attention sublayer and one fixed cache
/// per encoder-decoder attention sublayer.
pub struct DecoderCache {
    self_attention: Vec<KeyValueCache>,
    cross_attention: Vec<KeyValueCache>,
}

impl DecoderCache {
    /// Create empty caches for `n_layers` decoder layers.
    pub fn new(n_layers: usize) -> Self {
        Self {
            self_attention: repeat_with(KeyValueCache::new).take(n_layers).collect(),
            cross_attention: repeat_with(KeyValueCache::new).take(n_layers).collect(),
        }
    }

    /// Create pass-through caches for `n_layers` decoder layers.
    pub fn disabled(n_layers: usize) -> Self {
        Self {
            self_attention: repeat_with(KeyValueCache::disabled)
                .take(n_layers)
                .collect(),
            cross_attention: repeat_with(KeyValueCache::disabled)
                .take(n_layers)
                .collect(),
        }
    }

    /// Number of layers covered by the cache.
    pub fn n_layers(&self) -> usize {
        self.self_attention.len()
    }

    /// Cache of the self-attention sublayer of `layer`.
    pub fn self_attention(&mut self, layer: usize) -> &mut KeyValueCache {
        &mut self.self_attention[layer]
    }

    /// Cache of the encoder-decoder attention sublayer of `layer`.
    pub fn cross_attention(&mut self, layer: usize) -> &mut KeyValueCache {
        &mut self.cross_attention[layer]
    }

    /// Caches of both attention sublayers of `layer`, self-attention first.
    pub(crate) fn layer(&mut self, layer: usize) -> (&mut KeyValueCache, &mut KeyValueCache) {
        (
            &mut self.self_attention[layer],
            &mut self.cross_attention[layer],
        )
    }

    /// Keep only the batches selected by `live` in every layer cache.
    pub fn keep_alive(&mut self, live: &Tensor) -> Result<(), KeyValueCacheError> {
        for cache in self.layer_caches() {
            cache.keep_alive(live)?;
        }
        Ok(())
    }

    /// Put the batches of every layer cache into a new order.
    pub fn reorder(&mut self, permutation: &Tensor) -> Result<(), KeyValueCacheError> {
        tracing::debug!("Reordering caches of {} decoder layers", self.n_layers());
        for cache in self.layer_caches() {
            cache.reorder(permutation)?;
        }
        Ok(())
    }

    /// Drop all stored entries, keeping the enable switches.
    pub fn clear(&mut self) {
        for cache in self.layer_caches() {
            cache.clear();
        }
    }

    fn layer_caches(&mut self) -> impl Iterator<Item = &mut KeyValueCache> {
        self.self_attention
            .iter_mut()
            .chain(self.cross_attention.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, IndexOp, Tensor};

    use super::{DecoderCache, KeyValueCache};

    fn filled(value: f32, batch_size: usize, len: usize, width: usize, device: &Device) -> Tensor {
        Tensor::full(value, (batch_size, len, width), device).unwrap()
    }

    #[test]
    fn append_extends_along_time() {
        let device = Device::Cpu;
        let mut cache = KeyValueCache::new();
        assert!(cache.is_empty());

        let (key, _value) = cache
            .append(&filled(1.0, 2, 1, 4, &device), &filled(2.0, 2, 1, 4, &device))
            .unwrap();
        assert_eq!(key.dims(), [2, 1, 4]);
        assert_eq!(cache.seen_len(), 1);

        let (key, value) = cache
            .append(&filled(3.0, 2, 1, 4, &device), &filled(4.0, 2, 1, 4, &device))
            .unwrap();
        assert_eq!(key.dims(), [2, 2, 4]);
        assert_eq!(cache.seen_len(), 2);
        assert_eq!(key.i((0, 0, 0)).unwrap().to_scalar::<f32>().unwrap(), 1.0);
        assert_eq!(key.i((0, 1, 0)).unwrap().to_scalar::<f32>().unwrap(), 3.0);
        assert_eq!(value.i((0, 1, 0)).unwrap().to_scalar::<f32>().unwrap(), 4.0);
    }

    #[test]
    fn reuse_projects_once() {
        let device = Device::Cpu;
        let mut cache = KeyValueCache::new();
        let mut calls = 0;

        for _ in 0..3 {
            let (key, _value) = cache
                .reuse_projected(|| {
                    calls += 1;
                    Ok((filled(5.0, 2, 3, 4, &device), filled(6.0, 2, 3, 4, &device)))
                })
                .unwrap();
            assert_eq!(key.dims(), [2, 3, 4]);
        }

        assert_eq!(calls, 1);
    }

    #[test]
    fn rejects_mixed_protocols() {
        let device = Device::Cpu;
        let key = filled(1.0, 1, 1, 2, &device);

        let mut cache = KeyValueCache::new();
        cache.append(&key, &key).unwrap();
        assert!(cache
            .reuse_projected(|| Ok((filled(0.0, 1, 1, 2, &device), filled(0.0, 1, 1, 2, &device))))
            .is_err());

        let mut cache = KeyValueCache::new();
        cache
            .reuse_projected(|| Ok((filled(0.0, 1, 1, 2, &device), filled(0.0, 1, 1, 2, &device))))
            .unwrap();
        assert!(cache.append(&key, &key).is_err());
    }

    #[test]
    fn rejects_batch_size_change() {
        let device = Device::Cpu;
        let mut cache = KeyValueCache::new();
        cache
            .append(&filled(1.0, 2, 1, 4, &device), &filled(1.0, 2, 1, 4, &device))
            .unwrap();
        assert!(cache
            .append(&filled(1.0, 3, 1, 4, &device), &filled(1.0, 3, 1, 4, &device))
            .is_err());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let device = Device::Cpu;
        let mut cache = KeyValueCache::disabled();

        let (key, _value) = cache
            .append(&filled(1.0, 2, 1, 4, &device), &filled(2.0, 2, 1, 4, &device))
            .unwrap();
        assert_eq!(key.dims(), [2, 1, 4]);
        assert!(cache.is_empty());

        let mut calls = 0;
        for _ in 0..2 {
            cache
                .reuse_projected(|| {
                    calls += 1;
                    Ok((filled(0.0, 2, 3, 4, &device), filled(0.0, 2, 3, 4, &device)))
                })
                .unwrap();
        }
        assert_eq!(calls, 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn keep_alive_selects_batches() {
        let device = Device::Cpu;
        let mut cache = KeyValueCache::new();
        let key = Tensor::from_slice(&[1f32, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 1, 2), &device).unwrap();
        cache.append(&key, &key).unwrap();

        let live = Tensor::from_slice(&[2u32, 0], (2,), &device).unwrap();
        cache.keep_alive(&live).unwrap();
        assert_eq!(cache.seen_len(), 1);

        let (key, _value) = cache
            .append(&filled(0.0, 2, 1, 2, &device), &filled(0.0, 2, 1, 2, &device))
            .unwrap();
        assert_eq!(key.dims(), [2, 2, 2]);
        assert_eq!(key.i((0, 0, 0)).unwrap().to_scalar::<f32>().unwrap(), 5.0);
        assert_eq!(key.i((1, 0, 0)).unwrap().to_scalar::<f32>().unwrap(), 1.0);
    }

    #[test]
    fn decoder_cache_reorders_all_layers() {
        let device = Device::Cpu;
        let mut cache = DecoderCache::new(2);
        for layer in 0..2 {
            let entry = Tensor::from_slice(&[1f32, 2.0], (2, 1, 1), &device).unwrap();
            cache.self_attention(layer).append(&entry, &entry).unwrap();
        }

        let permutation = Tensor::from_slice(&[1u32, 0], (2,), &device).unwrap();
        cache.reorder(&permutation).unwrap();

        for layer in 0..2 {
            let (key, _value) = cache
                .self_attention(layer)
                .append(&filled(0.0, 2, 1, 1, &device), &filled(0.0, 2, 1, 1, &device))
                .unwrap();
            assert_eq!(key.i((0, 0, 0)).unwrap().to_scalar::<f32>().unwrap(), 2.0);
        }

        cache.clear();
        assert!(cache.self_attention(0).is_empty());
        assert!(cache.cross_attention(1).is_empty());
    }
}
