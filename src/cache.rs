//! Process-scoped device cache
//!
//! Every announcement the engine hears is recorded here, keyed by device
//! instance. The first address a device announced from stays bound to it
//! for the life of the cache; later announcements only refresh the
//! timestamps and capability summary.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::{debug, trace};

use crate::device::{Announcement, CapabilitySummary, DeviceIdentity};
use crate::util::Sharded;

/// A cached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDevice {
    pub identity: DeviceIdentity,
    pub summary: CapabilitySummary,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Announcements heard; zero for a device only ever read directly
    pub announcements: u64,
}

/// What [`DeviceCache::record`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    Inserted,
    Refreshed {
        /// The device announced from an address other than the bound one
        address_changed: bool,
    },
}

/// Sharded identity cache
#[derive(Debug)]
pub struct DeviceCache {
    shards: Sharded<HashMap<u32, CachedDevice>>,
}

impl DeviceCache {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shards: Sharded::new(shard_count),
        }
    }

    pub fn record(&self, announcement: &Announcement) -> CacheUpdate {
        self.record_at(announcement, Utc::now())
    }

    fn record_at(&self, announcement: &Announcement, now: DateTime<Utc>) -> CacheUpdate {
        let instance = announcement.identity.instance;
        let mut shard = self.shards.write(instance);
        match shard.get_mut(&instance) {
            Some(cached) => {
                let address_changed = cached.identity.address != announcement.identity.address;
                if address_changed {
                    debug!(
                        "Device {} re-announced from {}, keeping {}",
                        instance, announcement.identity.address, cached.identity.address
                    );
                }
                cached.summary = announcement.summary;
                cached.last_seen = now;
                cached.announcements += 1;
                CacheUpdate::Refreshed { address_changed }
            }
            None => {
                trace!("Caching {}", announcement.identity);
                shard.insert(
                    instance,
                    CachedDevice {
                        identity: announcement.identity.clone(),
                        summary: announcement.summary,
                        first_seen: now,
                        last_seen: now,
                        announcements: 1,
                    },
                );
                CacheUpdate::Inserted
            }
        }
    }

    /// Cache a device learned without an announcement, such as by reading it
    /// directly. An existing entry is left as it is; returns whether one was added.
    pub fn insert_if_absent(&self, announcement: &Announcement) -> bool {
        let instance = announcement.identity.instance;
        let mut shard = self.shards.write(instance);
        if shard.contains_key(&instance) {
            return false;
        }
        let now = Utc::now();
        trace!("Caching {} without an announcement", announcement.identity);
        shard.insert(
            instance,
            CachedDevice {
                identity: announcement.identity.clone(),
                summary: announcement.summary,
                first_seen: now,
                last_seen: now,
                announcements: 0,
            },
        );
        true
    }

    pub fn get(&self, instance: u32) -> Option<CachedDevice> {
        self.shards.read(instance).get(&instance).cloned()
    }

    /// The bound identity, as announced first
    pub fn identity(&self, instance: u32) -> Option<DeviceIdentity> {
        self.shards
            .read(instance)
            .get(&instance)
            .map(|cached| cached.identity.clone())
    }

    pub fn remove(&self, instance: u32) -> Option<CachedDevice> {
        self.shards.write(instance).remove(&instance)
    }

    /// Every cached device, ordered by instance
    pub fn snapshot(&self) -> Vec<CachedDevice> {
        let mut devices = Vec::new();
        self.shards
            .for_each(|shard| devices.extend(shard.values().cloned()));
        devices.sort_by_key(|cached| cached.identity.instance);
        devices
    }

    pub fn len(&self) -> usize {
        let mut total = 0;
        self.shards.for_each(|shard| total += shard.len());
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop devices not heard from within `max_age`; returns their instances
    pub fn evict_stale(&self, max_age: Duration) -> Vec<u32> {
        self.evict_older_than(Utc::now() - max_age)
    }

    /// Drop devices last heard before `cutoff`; returns their instances
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Vec<u32> {
        let mut evicted = Vec::new();
        self.shards.for_each_mut(|shard| {
            shard.retain(|instance, cached| {
                let keep = cached.last_seen >= cutoff;
                if !keep {
                    evicted.push(*instance);
                }
                keep
            });
        });
        evicted.sort_unstable();
        if !evicted.is_empty() {
            debug!("Evicted {} stale devices", evicted.len());
        }
        evicted
    }
}

impl Default for DeviceCache {
    fn default() -> Self {
        Self::new(crate::config::constants::DEFAULT_SHARD_COUNT)
    }
}
