// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Named in-memory byte caches shared within a cache group.
//!
//! Stores joining the same group name share one bounded byte cache, so
//! peers reading the same hot blocks shed redundant downloads. Entries
//! are handed out as shared buffers without copying. A miss runs the
//! group's getter exactly once per key; concurrent callers wait for the
//! in-flight fill.

use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex};

use lru::LruCache;

/// Shared view onto cached bytes.
pub type Bytes = Arc<Vec<u8>>;

type Getter = Box<dyn Fn(&str) -> io::Result<Vec<u8>> + Send + Sync>;

type FillResult = Result<Bytes, (io::ErrorKind, String)>;

struct Fill {
    state: Mutex<Option<FillResult>>,
    cond: Condvar,
}

struct Entries {
    cache: LruCache<String, Bytes>,
    used: usize,
}

/// One named byte cache with a fixed byte budget.
pub struct CacheGroup {
    name: String,
    capacity: usize,
    getter: Getter,
    entries: Mutex<Entries>,
    fills: Mutex<HashMap<String, Arc<Fill>>>,
}

impl CacheGroup {
    fn new(name: &str, capacity: usize, getter: Getter) -> CacheGroup {
        CacheGroup {
            name: name.to_string(),
            capacity,
            getter,
            entries: Mutex::new(Entries {
                cache: LruCache::unbounded(),
                used: 0,
            }),
            fills: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `key` currently resides in the cache.
    pub fn is_cached(&self, key: &str) -> bool {
        self.entries.lock().unwrap().cache.contains(key)
    }

    /// Fetch `key`, filling the cache through the getter on a miss.
    /// Concurrent callers of the same key share one getter run.
    pub fn get(&self, key: &str) -> io::Result<Bytes> {
        if let Some(b) = self.lookup(key) {
            return Ok(b);
        }

        let (fill, filler) = {
            let mut fills = self.fills.lock().unwrap();
            match fills.get(key) {
                Some(f) => (f.clone(), false),
                None => {
                    let f = Arc::new(Fill {
                        state: Mutex::new(None),
                        cond: Condvar::new(),
                    });
                    fills.insert(key.to_string(), f.clone());
                    (f, true)
                }
            }
        };

        if !filler {
            let mut st = fill.state.lock().unwrap();
            while st.is_none() {
                st = fill.cond.wait(st).unwrap();
            }
            return match st.as_ref().map(|r| r.clone()) {
                Some(Ok(b)) => Ok(b),
                Some(Err((kind, msg))) => Err(io::Error::new(kind, msg)),
                None => Err(eio!("cache fill finished without a result")),
            };
        }

        let result = (self.getter)(key);
        let out = match result {
            Ok(data) => {
                let bytes: Bytes = Arc::new(data);
                self.insert(key, bytes.clone());
                Ok(bytes)
            }
            Err(e) => Err(e),
        };
        {
            let mut st = fill.state.lock().unwrap();
            *st = Some(match &out {
                Ok(b) => Ok(b.clone()),
                Err(e) => Err((e.kind(), e.to_string())),
            });
            fill.cond.notify_all();
        }
        self.fills.lock().unwrap().remove(key);
        out
    }

    fn lookup(&self, key: &str) -> Option<Bytes> {
        self.entries.lock().unwrap().cache.get(key).cloned()
    }

    fn insert(&self, key: &str, bytes: Bytes) {
        let mut e = self.entries.lock().unwrap();
        if let Some(old) = e.cache.put(key.to_string(), bytes.clone()) {
            e.used -= old.len();
        }
        e.used += bytes.len();
        while e.used > self.capacity {
            match e.cache.pop_lru() {
                Some((k, v)) => {
                    trace!("group {}: evict {} ({} bytes)", self.name, k, v.len());
                    e.used -= v.len();
                }
                None => break,
            }
        }
    }
}

lazy_static! {
    static ref GROUPS: Mutex<HashMap<String, Arc<CacheGroup>>> = Mutex::new(HashMap::new());
}

/// Look up the group `name`, creating it with `capacity` bytes and
/// `getter` when it does not exist yet. The getter of the creating
/// store is kept for the group's lifetime.
pub fn get_or_create(name: &str, capacity: usize, getter: Getter) -> Arc<CacheGroup> {
    let mut groups = GROUPS.lock().unwrap();
    if let Some(g) = groups.get(name) {
        return g.clone();
    }
    // keep at least one entry even for tiny budgets
    let capacity = NonZeroUsize::new(capacity).map(|c| c.get()).unwrap_or(1);
    let g = Arc::new(CacheGroup::new(name, capacity, getter));
    groups.insert(name.to_string(), g.clone());
    g
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_fill_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let g = CacheGroup::new(
            "t1",
            1 << 20,
            Box::new(move |key: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(key.as_bytes().to_vec())
            }),
        );
        assert!(!g.is_cached("a"));
        assert_eq!(&*g.get("a").unwrap(), b"a");
        assert_eq!(&*g.get("a").unwrap(), b"a");
        assert!(g.is_cached("a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_byte_budget() {
        let g = CacheGroup::new(
            "t2",
            10,
            Box::new(|_key: &str| Ok(vec![0u8; 6])),
        );
        g.get("a").unwrap();
        g.get("b").unwrap();
        // 12 bytes exceed the budget, the older entry was evicted
        assert!(!g.is_cached("a"));
        assert!(g.is_cached("b"));
        assert!(g.entries.lock().unwrap().used <= 10);
    }

    #[test]
    fn test_getter_error() {
        let g = CacheGroup::new(
            "t3",
            1 << 20,
            Box::new(|_key: &str| Err(enoent!("missing"))),
        );
        assert_eq!(g.get("x").unwrap_err().kind(), io::ErrorKind::NotFound);
        assert!(!g.is_cached("x"));
    }

    #[test]
    fn test_registry() {
        let g1 = get_or_create("shared-group", 1 << 20, Box::new(|_| Ok(Vec::new())));
        let g2 = get_or_create("shared-group", 1 << 20, Box::new(|_| Ok(Vec::new())));
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(g1.name(), "shared-group");
    }
}
