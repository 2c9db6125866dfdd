//! Dual-mode map and set
//!
//! A map starts in linear mode: parallel arrays of keys, values and
//! precomputed 32-bit hashes, scanned front to back. Insertion past 16
//! entries migrates it to hashed mode with 64 open buckets, each again a
//! set of parallel arrays. Key equality cannot be decided inside the map
//! (string comparison needs the gc pool), so lookups take the precomputed
//! hash plus an equality predicate supplied by the caller.
//!
//! Every mutation bumps `contentrevisionid`; active iterators check it.
//!
//! The set has the same shape without values, plus a linear fallback array
//! for elements whose type cannot hash, which participate in `contains`
//! through a plain equality scan.

use crate::heap::OomError;
use crate::value::Value;

pub const MAP_MIGRATE_HASHED_AT: usize = 16;
pub const MAP_BUCKET_COUNT: usize = 64;

#[derive(Debug, Default, PartialEq)]
struct EntryArrays {
    keys: Vec<Value>,
    values: Vec<Value>,
    hashes: Vec<u32>,
}

impl EntryArrays {
    fn push(&mut self, key: Value, value: Value, hash: u32) -> Result<(), OomError> {
        self.keys.try_reserve(1).map_err(|_| OomError)?;
        self.values.try_reserve(1).map_err(|_| OomError)?;
        self.hashes.try_reserve(1).map_err(|_| OomError)?;
        self.keys.push(key);
        self.values.push(value);
        self.hashes.push(hash);
        Ok(())
    }

    fn find(&self, hash: u32, mut key_eq: impl FnMut(&Value) -> bool) -> Option<usize> {
        for (i, h) in self.hashes.iter().enumerate() {
            if *h == hash && key_eq(&self.keys[i]) {
                return Some(i);
            }
        }
        None
    }

    fn remove_at(&mut self, i: usize) -> (Value, Value) {
        self.hashes.remove(i);
        (self.keys.remove(i), self.values.remove(i))
    }
}

#[derive(Debug, PartialEq)]
enum MapMode {
    Linear(EntryArrays),
    Hashed {
        buckets: Vec<EntryArrays>,
        entry_count: i64,
    },
}

/// Outcome of `set_with`.
#[derive(Debug, PartialEq)]
pub enum MapSetOutcome {
    Inserted,
    /// Key existed; previous value handed back for reference release.
    Replaced(Value),
}

#[derive(Debug, PartialEq)]
pub struct VmMap {
    mode: MapMode,
    revision: u64,
}

impl VmMap {
    pub fn new() -> Self {
        VmMap {
            mode: MapMode::Linear(EntryArrays::default()),
            revision: 0,
        }
    }

    pub fn count(&self) -> i64 {
        match &self.mode {
            MapMode::Linear(arr) => arr.keys.len() as i64,
            MapMode::Hashed { entry_count, .. } => *entry_count,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[cfg(test)]
    pub(crate) fn is_hashed(&self) -> bool {
        matches!(self.mode, MapMode::Hashed { .. })
    }

    pub fn get_with(&self, hash: u32, key_eq: impl FnMut(&Value) -> bool) -> Option<&Value> {
        match &self.mode {
            MapMode::Linear(arr) => arr.find(hash, key_eq).map(|i| &arr.values[i]),
            MapMode::Hashed { buckets, .. } => {
                let bucket = &buckets[hash as usize % MAP_BUCKET_COUNT];
                bucket.find(hash, key_eq).map(|i| &bucket.values[i])
            }
        }
    }

    pub fn contains_with(&self, hash: u32, key_eq: impl FnMut(&Value) -> bool) -> bool {
        self.get_with(hash, key_eq).is_some()
    }

    pub fn set_with(
        &mut self,
        key: Value,
        value: Value,
        hash: u32,
        key_eq: impl FnMut(&Value) -> bool,
    ) -> Result<MapSetOutcome, OomError> {
        self.revision += 1;
        match &mut self.mode {
            MapMode::Linear(arr) => {
                if let Some(i) = arr.find(hash, key_eq) {
                    let old = std::mem::replace(&mut arr.values[i], value);
                    return Ok(MapSetOutcome::Replaced(old));
                }
                if arr.keys.len() >= MAP_MIGRATE_HASHED_AT {
                    self.migrate_to_hashed()?;
                    return self.insert_hashed(key, value, hash);
                }
                arr.push(key, value, hash)?;
                Ok(MapSetOutcome::Inserted)
            }
            MapMode::Hashed { buckets, entry_count } => {
                let bucket = &mut buckets[hash as usize % MAP_BUCKET_COUNT];
                if let Some(i) = bucket.find(hash, key_eq) {
                    let old = std::mem::replace(&mut bucket.values[i], value);
                    return Ok(MapSetOutcome::Replaced(old));
                }
                bucket.push(key, value, hash)?;
                *entry_count += 1;
                Ok(MapSetOutcome::Inserted)
            }
        }
    }

    fn insert_hashed(
        &mut self,
        key: Value,
        value: Value,
        hash: u32,
    ) -> Result<MapSetOutcome, OomError> {
        match &mut self.mode {
            MapMode::Hashed { buckets, entry_count } => {
                buckets[hash as usize % MAP_BUCKET_COUNT].push(key, value, hash)?;
                *entry_count += 1;
                Ok(MapSetOutcome::Inserted)
            }
            MapMode::Linear(_) => unreachable!("called after migration"),
        }
    }

    fn migrate_to_hashed(&mut self) -> Result<(), OomError> {
        let mut buckets = Vec::new();
        buckets.try_reserve_exact(MAP_BUCKET_COUNT).map_err(|_| OomError)?;
        for _ in 0..MAP_BUCKET_COUNT {
            buckets.push(EntryArrays::default());
        }
        let old = std::mem::replace(
            &mut self.mode,
            MapMode::Hashed {
                buckets,
                entry_count: 0,
            },
        );
        if let MapMode::Linear(arr) = old {
            let count = arr.keys.len() as i64;
            if let MapMode::Hashed { buckets, entry_count } = &mut self.mode {
                for ((key, value), hash) in arr
                    .keys
                    .into_iter()
                    .zip(arr.values)
                    .zip(arr.hashes)
                {
                    buckets[hash as usize % MAP_BUCKET_COUNT].push(key, value, hash)?;
                }
                *entry_count = count;
            }
        }
        Ok(())
    }

    /// Returns the removed (key, value) pair so the caller can release
    /// both references.
    pub fn remove_with(
        &mut self,
        hash: u32,
        key_eq: impl FnMut(&Value) -> bool,
    ) -> Option<(Value, Value)> {
        let removed = match &mut self.mode {
            MapMode::Linear(arr) => arr.find(hash, key_eq).map(|i| arr.remove_at(i)),
            MapMode::Hashed { buckets, entry_count } => {
                let bucket = &mut buckets[hash as usize % MAP_BUCKET_COUNT];
                let removed = bucket.find(hash, key_eq).map(|i| bucket.remove_at(i));
                if removed.is_some() {
                    *entry_count -= 1;
                }
                removed
            }
        };
        if removed.is_some() {
            self.revision += 1;
        }
        removed
    }

    /// Iteration order: linear mode walks insertion order, hashed mode
    /// walks buckets front to back. `key_by_idx` captures the same order.
    pub fn pairs(&self) -> impl Iterator<Item = (&Value, &Value)> {
        let (linear, buckets): (Option<&EntryArrays>, &[EntryArrays]) = match &self.mode {
            MapMode::Linear(arr) => (Some(arr), &[]),
            MapMode::Hashed { buckets, .. } => (None, buckets.as_slice()),
        };
        linear
            .into_iter()
            .chain(buckets.iter())
            .flat_map(|arr| arr.keys.iter().zip(arr.values.iter()))
    }

    /// 0-based key access in iteration order.
    pub fn key_by_idx(&self, idx: i64) -> Option<&Value> {
        if idx < 0 {
            return None;
        }
        self.pairs().nth(idx as usize).map(|(k, _)| k)
    }

    pub fn drain_into(self, out: &mut Vec<Value>) {
        match self.mode {
            MapMode::Linear(arr) => {
                out.extend(arr.keys);
                out.extend(arr.values);
            }
            MapMode::Hashed { buckets, .. } => {
                for arr in buckets {
                    out.extend(arr.keys);
                    out.extend(arr.values);
                }
            }
        }
    }
}

impl Default for VmMap {
    fn default() -> Self {
        VmMap::new()
    }
}

/// Set: hashed elements plus a linear fallback for unhashable values.
#[derive(Debug, Default, PartialEq)]
pub struct VmSet {
    hashed: Vec<Value>,
    hashes: Vec<u32>,
    nonhashable: Vec<Value>,
    revision: u64,
}

impl VmSet {
    pub fn new() -> Self {
        VmSet::default()
    }

    pub fn count(&self) -> i64 {
        (self.hashed.len() + self.nonhashable.len()) as i64
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// `hash` is `None` for unhashable elements, which use the fallback
    /// array and plain equality.
    pub fn contains_with(&self, hash: Option<u32>, mut eq: impl FnMut(&Value) -> bool) -> bool {
        match hash {
            Some(h) => self
                .hashes
                .iter()
                .zip(self.hashed.iter())
                .any(|(eh, ev)| *eh == h && eq(ev)),
            None => self.nonhashable.iter().any(eq),
        }
    }

    /// Returns false if the element was already present.
    pub fn add_with(
        &mut self,
        v: Value,
        hash: Option<u32>,
        eq: impl FnMut(&Value) -> bool,
    ) -> Result<bool, OomError> {
        if self.contains_with(hash, eq) {
            return Ok(false);
        }
        match hash {
            Some(h) => {
                self.hashed.try_reserve(1).map_err(|_| OomError)?;
                self.hashes.try_reserve(1).map_err(|_| OomError)?;
                self.hashed.push(v);
                self.hashes.push(h);
            }
            None => {
                self.nonhashable.try_reserve(1).map_err(|_| OomError)?;
                self.nonhashable.push(v);
            }
        }
        self.revision += 1;
        Ok(true)
    }

    pub fn remove_with(
        &mut self,
        hash: Option<u32>,
        mut eq: impl FnMut(&Value) -> bool,
    ) -> Option<Value> {
        let removed = match hash {
            Some(h) => {
                let idx = self
                    .hashes
                    .iter()
                    .zip(self.hashed.iter())
                    .position(|(eh, ev)| *eh == h && eq(ev));
                idx.map(|i| {
                    self.hashes.remove(i);
                    self.hashed.remove(i)
                })
            }
            None => {
                let idx = self.nonhashable.iter().position(eq);
                idx.map(|i| self.nonhashable.remove(i))
            }
        };
        if removed.is_some() {
            self.revision += 1;
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.hashed.iter().chain(self.nonhashable.iter())
    }

    pub fn drain_into(self, out: &mut Vec<Value>) {
        out.extend(self.hashed);
        out.extend(self.nonhashable);
    }
}
