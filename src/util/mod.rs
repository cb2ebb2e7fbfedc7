//! Utility Functions Module
//!
//! Small helpers shared by the engine: the custom-range enum macro used by the
//! object model, and a striped lock used by the per-device state tables.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod enum_macros;

/// A fixed set of independently locked shards keyed by device instance.
///
/// Different devices are fully independent, so the device cache and the rate
/// limiter only ever lock the shard their instance number hashes to.
#[derive(Debug)]
pub struct Sharded<T> {
    shards: Box<[RwLock<T>]>,
}

impl<T: Default> Sharded<T> {
    /// Create `count` empty shards (at least one)
    pub fn new(count: usize) -> Self {
        let shards = (0..count.max(1)).map(|_| RwLock::new(T::default())).collect();
        Self { shards }
    }
}

impl<T> Sharded<T> {
    fn shard(&self, key: u32) -> &RwLock<T> {
        &self.shards[key as usize % self.shards.len()]
    }

    /// Shared access to the shard owning `key`
    pub fn read(&self, key: u32) -> RwLockReadGuard<'_, T> {
        self.shard(key)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the shard owning `key`
    pub fn write(&self, key: u32) -> RwLockWriteGuard<'_, T> {
        self.shard(key)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Visit every shard under its read lock, one at a time
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&T),
    {
        for shard in self.shards.iter() {
            visit(&shard.read().unwrap_or_else(PoisonError::into_inner));
        }
    }

    /// Visit every shard under its write lock, one at a time
    pub fn for_each_mut<F>(&self, mut visit: F)
    where
        F: FnMut(&mut T),
    {
        for shard in self.shards.iter() {
            visit(&mut shard.write().unwrap_or_else(PoisonError::into_inner));
        }
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_keys_map_to_stable_shards() {
        let sharded: Sharded<HashMap<u32, &str>> = Sharded::new(4);
        sharded.write(5).insert(5, "five");
        sharded.write(9).insert(9, "nine");

        // 5 and 9 share shard 1
        assert_eq!(sharded.read(1).len(), 2);
        assert_eq!(sharded.read(5).get(&9), Some(&"nine"));

        let mut total = 0;
        sharded.for_each(|shard| total += shard.len());
        assert_eq!(total, 2);
    }

    #[test]
    fn test_zero_shards_is_clamped() {
        let sharded: Sharded<Vec<u8>> = Sharded::new(0);
        assert_eq!(sharded.shard_count(), 1);
        sharded.write(u32::MAX).push(1);
        assert_eq!(sharded.read(0).len(), 1);
    }
}
