//! Concurrent symbolic id to database id map.
//!
//! The cache is split into partitions selected by an xxh64 hash of the key.
//! Each partition keeps a bounded LRU in memory and pages evicted entries to
//! its own SQLite spill file; lookups check memory first, then the spill.

mod spill;

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, trace};
use xxhash_rust::xxh64::xxh64;

use crate::config::CacheConfig;
use crate::error::Result;
use spill::SpillTable;

/// Kind of object an entry points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheTag {
    /// Row of `feature`.
    Feature,
    /// Row of `feature` that is a city object group.
    Group,
    /// Non-polygon row of `surface_geometry`.
    Geometry,
    /// Polygon row of `surface_geometry`.
    Polygon,
    /// Linear ring; the id is the enclosing polygon.
    Ring,
    /// Row of `appearance`.
    Appearance,
    /// Row of `surface_data`.
    SurfaceData,
    /// Row of `tex_image`.
    TexImage,
}

impl CacheTag {
    /// Whether the entry is a `surface_geometry` row.
    pub fn is_geometry(self) -> bool {
        matches!(self, CacheTag::Geometry | CacheTag::Polygon)
    }

    /// Whether the entry is a `feature` row.
    pub fn is_feature(self) -> bool {
        matches!(self, CacheTag::Feature | CacheTag::Group)
    }

    fn code(self) -> i64 {
        match self {
            CacheTag::Feature => 0,
            CacheTag::Group => 1,
            CacheTag::Geometry => 2,
            CacheTag::Polygon => 3,
            CacheTag::Ring => 4,
            CacheTag::Appearance => 5,
            CacheTag::SurfaceData => 6,
            CacheTag::TexImage => 7,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => CacheTag::Feature,
            1 => CacheTag::Group,
            2 => CacheTag::Geometry,
            3 => CacheTag::Polygon,
            4 => CacheTag::Ring,
            5 => CacheTag::Appearance,
            6 => CacheTag::SurfaceData,
            7 => CacheTag::TexImage,
            _ => return None,
        })
    }
}

/// Database identity assigned to a symbolic id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    /// Generated id.
    pub id: i64,
    /// Kind of row.
    pub tag: CacheTag,
}

struct Partition {
    index: usize,
    memory: LruCache<String, CacheEntry>,
    spill: Option<SpillTable>,
}

impl Partition {
    fn lookup(&mut self, key: &str) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.memory.get(key) {
            return Ok(Some(*entry));
        }
        match &self.spill {
            Some(spill) => spill.get(key),
            None => Ok(None),
        }
    }

    fn store(&mut self, key: &str, entry: CacheEntry, dir: &TempDir) -> Result<()> {
        if let Some((evicted, value)) = self.memory.push(key.to_string(), entry) {
            if evicted != key {
                if self.spill.is_none() {
                    debug!(partition = self.index, "cache.spill.open");
                    self.spill = Some(SpillTable::open(dir.path(), self.index)?);
                }
                if let Some(spill) = &self.spill {
                    spill.put(&evicted, value)?;
                }
            }
        }
        Ok(())
    }
}

/// Partitioned identity cache shared by every worker of a run.
///
/// For any key at most one creation happens per run: the first caller of
/// [`IdentityCache::get_or_create`] runs the factory while holding the
/// partition lock, and concurrent callers observe its result.
pub struct IdentityCache {
    partitions: Vec<Mutex<Partition>>,
    spill_dir: TempDir,
}

impl IdentityCache {
    /// Creates an empty cache.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.capacity_per_partition).unwrap_or(NonZeroUsize::MIN);
        let mut builder = tempfile::Builder::new();
        builder.prefix("cityload-cache-");
        let spill_dir = match &config.spill_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        let partitions = (0..config.partitions.max(1))
            .map(|index| {
                Mutex::new(Partition {
                    index,
                    memory: LruCache::new(capacity),
                    spill: None,
                })
            })
            .collect();
        Ok(Self {
            partitions,
            spill_dir,
        })
    }

    fn partition(&self, key: &str) -> &Mutex<Partition> {
        let slot = xxh64(key.as_bytes(), 0) as usize % self.partitions.len();
        &self.partitions[slot]
    }

    /// Looks `key` up; absence is a normal outcome.
    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.partition(key).lock().lookup(key)
    }

    /// Returns the entry for `key`, creating it with `create` when missing.
    /// The flag is true when this call created the entry.
    pub fn get_or_create<F>(&self, key: &str, tag: CacheTag, create: F) -> Result<(CacheEntry, bool)>
    where
        F: FnOnce() -> Result<i64>,
    {
        let mut partition = self.partition(key).lock();
        if let Some(entry) = partition.lookup(key)? {
            return Ok((entry, false));
        }
        let entry = CacheEntry {
            id: create()?,
            tag,
        };
        partition.store(key, entry, &self.spill_dir)?;
        trace!(key, id = entry.id, "cache.create");
        Ok((entry, true))
    }

    /// Stores `entry` unless `key` is already mapped. Returns whether it was stored.
    pub fn insert_if_absent(&self, key: &str, entry: CacheEntry) -> Result<bool> {
        let mut partition = self.partition(key).lock();
        if partition.lookup(key)?.is_some() {
            return Ok(false);
        }
        partition.store(key, entry, &self.spill_dir)?;
        Ok(true)
    }

    /// Forgets `key`, wherever it lives. Returns whether it was mapped.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut partition = self.partition(key).lock();
        let mut removed = partition.memory.pop(key).is_some();
        if let Some(spill) = &partition.spill {
            removed |= spill.remove(key)?;
        }
        if removed {
            trace!(key, "cache.remove");
        }
        Ok(removed)
    }

    /// Number of entries, in memory and spilled.
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for partition in &self.partitions {
            let partition = partition.lock();
            total += partition.memory.len();
            if let Some(spill) = &partition.spill {
                total += spill.len()?;
            }
        }
        Ok(total)
    }

    /// Whether the cache holds no entry.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of entries paged out to spill files.
    pub fn spilled(&self) -> Result<usize> {
        let mut total = 0;
        for partition in &self.partitions {
            if let Some(spill) = &partition.lock().spill {
                total += spill.len()?;
            }
        }
        Ok(total)
    }

    /// Drops every entry. Called between input files.
    pub fn clear(&self) -> Result<()> {
        for partition in &self.partitions {
            let mut partition = partition.lock();
            partition.memory.clear();
            if let Some(spill) = &partition.spill {
                spill.clear()?;
            }
        }
        Ok(())
    }
}
