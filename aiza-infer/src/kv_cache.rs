use aiza_core::error::{AizaError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvCacheConfig {
    pub num_layers: usize,
    pub batch_size: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    /// Capacity grows in multiples of this many positions.
    pub block_size: usize,
    /// Hard ceiling on positions; `None` means limited only by memory.
    pub max_positions: Option<usize>,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            num_layers: 1,
            batch_size: 1,
            num_heads: 1,
            head_dim: 64,
            block_size: 1024,
            max_positions: None,
        }
    }
}

/// Growable key/value cache for one in-flight request.
///
/// Storage is a flat `[layer][k|v][batch][head][position][head_dim]` array whose
/// position dimension (`capacity`) grows in whole blocks by copying into a
/// larger buffer. `position` counts fully completed steps: it only moves once
/// the last layer has been written.
pub struct KvCache {
    cfg: KvCacheConfig,
    storage: Vec<f32>,
    capacity: usize,
    position: usize,
    growth_events: u32,
}

impl KvCache {
    pub fn new(cfg: KvCacheConfig) -> Result<Self> {
        if cfg.num_layers == 0
            || cfg.batch_size == 0
            || cfg.num_heads == 0
            || cfg.head_dim == 0
            || cfg.block_size == 0
        {
            return Err(AizaError::InvalidConfig(format!(
                "kv cache dimensions must be non-zero: {cfg:?}"
            )));
        }
        Ok(Self {
            cfg,
            storage: Vec::new(),
            capacity: 0,
            position: 0,
            growth_events: 0,
        })
    }

    pub fn config(&self) -> &KvCacheConfig {
        &self.cfg
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of reallocations so far, the lazy first allocation included.
    pub fn growth_events(&self) -> u32 {
        self.growth_events
    }

    pub fn size_bytes(&self) -> u64 {
        (self.storage.len() * std::mem::size_of::<f32>()) as u64
    }

    pub fn remaining_positions(&self) -> Option<usize> {
        self.cfg
            .max_positions
            .map(|max| max.saturating_sub(self.position))
    }

    /// Rewind to position zero; storage is kept for reuse.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Rewind and free the storage.
    pub fn release(&mut self) {
        self.position = 0;
        self.capacity = 0;
        self.storage = Vec::new();
    }

    // elements in one [batch][head] row of positions
    fn row_len(&self, capacity: usize) -> usize {
        capacity * self.cfg.head_dim
    }

    fn rows_per_layer(&self) -> usize {
        2 * self.cfg.batch_size * self.cfg.num_heads
    }

    /// Write keys/values for positions `[position, position + new_len)` of `layer`
    /// and return the valid prefix `[0, position + new_len)` for that layer.
    ///
    /// `keys` and `values` are laid out `[batch][head][new_len][head_dim]`.
    pub fn insert(&mut self, layer: usize, keys: &[f32], values: &[f32]) -> Result<LayerKv<'_>> {
        let KvCacheConfig {
            num_layers,
            batch_size,
            num_heads,
            head_dim,
            ..
        } = self.cfg;

        if layer >= num_layers {
            return Err(AizaError::InvalidCacheWrite(format!(
                "layer {layer} out of range for {num_layers} layers"
            )));
        }
        if keys.len() != values.len() {
            return Err(AizaError::InvalidCacheWrite(format!(
                "keys ({}) and values ({}) differ in length",
                keys.len(),
                values.len()
            )));
        }
        let stride = batch_size * num_heads * head_dim;
        if keys.len() % stride != 0 {
            return Err(AizaError::InvalidCacheWrite(format!(
                "{} elements is not a whole number of positions (stride {stride})",
                keys.len()
            )));
        }

        let new_len = keys.len() / stride;
        let t0 = self.position;
        let t1 = t0 + new_len;
        if let Some(max) = self.cfg.max_positions {
            if t1 > max {
                return Err(AizaError::CacheExhausted { requested: t1, max });
            }
        }
        if t1 > self.capacity {
            self.grow(t1)?;
        }

        let row = self.row_len(self.capacity);
        let layer_base = layer * self.rows_per_layer() * row;
        let half = batch_size * num_heads * row;
        for bh in 0..batch_size * num_heads {
            let src = bh * new_len * head_dim..(bh + 1) * new_len * head_dim;
            let dst = bh * row + t0 * head_dim;
            let k_dst = layer_base + dst;
            let v_dst = layer_base + half + dst;
            self.storage[k_dst..k_dst + src.len()].copy_from_slice(&keys[src.clone()]);
            self.storage[v_dst..v_dst + src.len()].copy_from_slice(&values[src]);
        }

        // every layer of a step writes the same span; the step is complete
        // only once the last one has
        if layer == num_layers - 1 {
            self.position = t1;
        }

        let layer_len = self.rows_per_layer() * row;
        let slab = &self.storage[layer_base..layer_base + layer_len];
        let (k, v) = slab.split_at(half);
        Ok(LayerKv {
            keys: k,
            values: v,
            len: t1,
            capacity: self.capacity,
            num_heads,
            head_dim,
        })
    }

    fn grow(&mut self, needed: usize) -> Result<()> {
        let block = self.cfg.block_size;
        let new_capacity = needed.div_ceil(block) * block;

        let rows = self.cfg.num_layers * self.rows_per_layer();
        let total = rows
            .checked_mul(self.row_len(new_capacity))
            .ok_or(AizaError::CacheExhausted {
                requested: needed,
                max: self.capacity,
            })?;

        let mut storage: Vec<f32> = Vec::new();
        storage
            .try_reserve_exact(total)
            .map_err(|_| AizaError::CacheExhausted {
                requested: needed,
                max: self.capacity,
            })?;
        storage.resize(total, 0.0);

        // copy each [layer][k|v][batch][head] row into its wider slot
        let old_row = self.row_len(self.capacity);
        let new_row = self.row_len(new_capacity);
        if old_row > 0 {
            for r in 0..rows {
                storage[r * new_row..r * new_row + old_row]
                    .copy_from_slice(&self.storage[r * old_row..(r + 1) * old_row]);
            }
        }

        tracing::debug!(
            from = self.capacity,
            to = new_capacity,
            bytes = total * std::mem::size_of::<f32>(),
            "kv cache grown"
        );
        self.storage = storage;
        self.capacity = new_capacity;
        self.growth_events += 1;
        Ok(())
    }
}

/// Borrowed view of one layer's cached keys and values, positions `[0, len)`.
#[derive(Debug, Clone, Copy)]
pub struct LayerKv<'a> {
    keys: &'a [f32],
    values: &'a [f32],
    len: usize,
    capacity: usize,
    num_heads: usize,
    head_dim: usize,
}

impl<'a> LayerKv<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn offset(&self, batch: usize, head: usize, pos: usize) -> usize {
        assert!(pos < self.len, "position {pos} beyond valid prefix {}", self.len);
        ((batch * self.num_heads + head) * self.capacity + pos) * self.head_dim
    }

    /// Key vector (`head_dim` long) at one position.
    pub fn key(&self, batch: usize, head: usize, pos: usize) -> &'a [f32] {
        let off = self.offset(batch, head, pos);
        &self.keys[off..off + self.head_dim]
    }

    pub fn value(&self, batch: usize, head: usize, pos: usize) -> &'a [f32] {
        let off = self.offset(batch, head, pos);
        &self.values[off..off + self.head_dim]
    }

    /// All valid keys for one `(batch, head)`, `len * head_dim` contiguous values.
    pub fn keys_for(&self, batch: usize, head: usize) -> &'a [f32] {
        let start = (batch * self.num_heads + head) * self.capacity * self.head_dim;
        &self.keys[start..start + self.len * self.head_dim]
    }

    pub fn values_for(&self, batch: usize, head: usize) -> &'a [f32] {
        let start = (batch * self.num_heads + head) * self.capacity * self.head_dim;
        &self.values[start..start + self.len * self.head_dim]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(layers: usize, block: usize) -> KvCacheConfig {
        KvCacheConfig {
            num_layers: layers,
            batch_size: 1,
            num_heads: 2,
            head_dim: 2,
            block_size: block,
            max_positions: None,
        }
    }

    // one position for 2 heads x head_dim 2, tagged with `tag`
    fn step(tag: f32) -> Vec<f32> {
        vec![tag, tag + 0.5, -tag, -tag - 0.5]
    }

    #[test]
    fn storage_is_lazy() {
        let cache = KvCache::new(cfg(2, 4)).unwrap();
        assert_eq!(cache.capacity(), 0);
        assert_eq!(cache.size_bytes(), 0);
        assert_eq!(cache.growth_events(), 0);
    }

    #[test]
    fn position_advances_after_last_layer() {
        let mut cache = KvCache::new(cfg(3, 4)).unwrap();
        let kv = step(1.0);
        cache.insert(0, &kv, &kv).unwrap();
        assert_eq!(cache.position(), 0);
        cache.insert(1, &kv, &kv).unwrap();
        assert_eq!(cache.position(), 0);
        let view = cache.insert(2, &kv, &kv).unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(cache.position(), 1);
    }

    #[test]
    fn one_growth_per_block_boundary() {
        let mut cache = KvCache::new(cfg(1, 4)).unwrap();
        for t in 0..13 {
            let kv = step(t as f32);
            let view = cache.insert(0, &kv, &kv).unwrap();
            assert_eq!(view.len(), t + 1);
            assert_eq!(cache.position(), t + 1);
            assert_eq!(cache.capacity() % 4, 0);
            assert!(cache.position() <= cache.capacity());
        }
        // 13 positions cross into blocks 1, 2, 3 and 4
        assert_eq!(cache.growth_events(), 4);
        assert_eq!(cache.capacity(), 16);
    }

    #[test]
    fn multi_block_insert_grows_once() {
        let mut cache = KvCache::new(cfg(1, 4)).unwrap();
        let kv: Vec<f32> = (0..2 * 2 * 9).map(|i| i as f32).collect();
        let view = cache.insert(0, &kv, &kv).unwrap();
        assert_eq!(view.len(), 9);
        assert_eq!(cache.capacity(), 12);
        assert_eq!(cache.growth_events(), 1);
    }

    #[test]
    fn growth_preserves_content() {
        let mut cache = KvCache::new(cfg(2, 2)).unwrap();
        for t in 0..5 {
            let k = step(t as f32);
            let v = step(100.0 + t as f32);
            cache.insert(0, &k, &v).unwrap();
            cache.insert(1, &v, &k).unwrap();
        }
        let view = cache.insert(0, &step(5.0), &step(105.0)).unwrap();
        assert_eq!(view.len(), 6);
        for t in 0..6 {
            assert_eq!(view.key(0, 0, t), &[t as f32, t as f32 + 0.5]);
            assert_eq!(view.key(0, 1, t), &[-(t as f32), -(t as f32) - 0.5]);
            let vt = 100.0 + t as f32;
            assert_eq!(view.value(0, 0, t), &[vt, vt + 0.5]);
        }
        assert_eq!(view.keys_for(0, 0).len(), 6 * 2);
    }

    #[test]
    fn multi_position_span_layout() {
        // [batch][head][pos][dim] input with 2 new positions
        let mut cache = KvCache::new(cfg(1, 8)).unwrap();
        let keys = vec![
            1.0, 1.1, 2.0, 2.1, // head 0, pos 0..2
            3.0, 3.1, 4.0, 4.1, // head 1, pos 0..2
        ];
        let view = cache.insert(0, &keys, &keys).unwrap();
        assert_eq!(view.key(0, 0, 1), &[2.0, 2.1]);
        assert_eq!(view.key(0, 1, 0), &[3.0, 3.1]);
        assert_eq!(view.keys_for(0, 1), &[3.0, 3.1, 4.0, 4.1]);
    }

    #[test]
    fn reset_keeps_storage_release_frees_it() {
        let mut cache = KvCache::new(cfg(1, 4)).unwrap();
        let kv = step(1.0);
        cache.insert(0, &kv, &kv).unwrap();
        cache.reset();
        assert_eq!(cache.position(), 0);
        assert_eq!(cache.capacity(), 4);
        cache.release();
        assert_eq!(cache.capacity(), 0);
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn max_positions_exhausts() {
        let mut c = cfg(1, 4);
        c.max_positions = Some(6);
        let mut cache = KvCache::new(c).unwrap();
        for t in 0..6 {
            let kv = step(t as f32);
            cache.insert(0, &kv, &kv).unwrap();
        }
        assert_eq!(cache.remaining_positions(), Some(0));
        let kv = step(6.0);
        let err = cache.insert(0, &kv, &kv).unwrap_err();
        assert!(matches!(err, AizaError::CacheExhausted { requested: 7, max: 6 }));
    }

    #[test]
    fn rejects_bad_writes() {
        let mut cache = KvCache::new(cfg(1, 4)).unwrap();
        let kv = step(1.0);
        assert!(matches!(
            cache.insert(1, &kv, &kv),
            Err(AizaError::InvalidCacheWrite(_))
        ));
        assert!(matches!(
            cache.insert(0, &kv, &kv[..2]),
            Err(AizaError::InvalidCacheWrite(_))
        ));
        assert!(matches!(
            cache.insert(0, &kv[..3], &kv[..3]),
            Err(AizaError::InvalidCacheWrite(_))
        ));
    }

    #[test]
    fn zero_dimension_rejected() {
        let mut c = cfg(1, 4);
        c.head_dim = 0;
        assert!(matches!(KvCache::new(c), Err(AizaError::InvalidConfig(_))));
    }
}
