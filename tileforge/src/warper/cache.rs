//! Per-worker dataset cache.
//!
//! Opening a GDAL dataset costs milliseconds to seconds for large VRT
//! pyramids, so each worker keeps a small LRU of opened handles. The
//! cache is strictly worker-local; handles never cross threads.

use std::collections::HashMap;
use std::collections::VecDeque;

use tracing::debug;

use crate::geo::{GeoDataset, GeoResult};

/// Default number of datasets kept open per worker.
pub const DEFAULT_CAPACITY: usize = 32;

/// Bounded LRU of opened [`GeoDataset`] handles keyed by path.
pub struct DatasetCache {
    capacity: usize,
    entries: HashMap<String, GeoDataset>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

impl DatasetCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Opened handle for `path`, opening (and possibly evicting) on miss.
    pub fn get(&mut self, path: &str) -> GeoResult<&GeoDataset> {
        if self.entries.contains_key(path) {
            self.hits += 1;
            self.touch(path);
        } else {
            self.misses += 1;
            let dataset = GeoDataset::open(std::path::Path::new(path))?;
            self.insert(path.to_string(), dataset);
        }
        Ok(self.entries.get(path).expect("entry just ensured"))
    }

    fn insert(&mut self, path: String, dataset: GeoDataset) {
        while self.entries.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                debug!(path = %evicted, "Evicting cached dataset");
                self.entries.remove(&evicted);
            } else {
                break;
            }
        }
        self.order.push_back(path.clone());
        self.entries.insert(path, dataset);
    }

    fn touch(&mut self, path: &str) {
        if let Some(position) = self.order.iter().position(|p| p == path) {
            let entry = self.order.remove(position).expect("position is valid");
            self.order.push_back(entry);
        }
    }

    /// Drops every cached handle, e.g. on memory pressure.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_on_bad_path_is_error() {
        let mut cache = DatasetCache::new(4);
        assert!(cache.get("/nonexistent/data.tif").is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), (0, 1));
    }

    #[test]
    fn test_capacity_is_at_least_one() {
        let cache = DatasetCache::new(0);
        assert_eq!(cache.capacity, 1);
    }
}
