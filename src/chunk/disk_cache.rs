// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! On-disk block cache with a write-back staging area.
//!
//! Cached blocks live under `<dir>/raw/<key>`, blocks awaiting upload
//! under `<dir>/raw_staging/<key>`. An index of `(size, atime)` per key
//! guards the byte budget; least-recently-used cached entries are
//! evicted when the byte, count or free-space bound is exceeded. Staged
//! entries are tracked with a negative size and never evicted until
//! `uploaded` promotes them. The cache dir string may contain `*`/`?`
//! wildcards expanding to several directories, each running an
//! independent shard selected by a hash of the block key.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Result, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, Sender};
use nix::sys::statvfs::statvfs;

use super::cached_store::Config;
use super::page::Page;
use super::BLOCK_SIZE;

const CACHE_DIR: &str = "raw";
const STAGING_DIR: &str = "raw_staging";

/// An open cached block together with its path, so callers can drop
/// the file when it turns out to be corrupt.
pub(crate) struct CachedFile {
    pub file: File,
    pub path: PathBuf,
}

impl CachedFile {
    /// Read `buf.len()` bytes at `off`, stopping early at end of file.
    pub fn read_full_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        let mut read = 0;
        while read < buf.len() {
            let n = self.file.read_at(&mut buf[read..], off + read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }
}

/// Local persistence for blocks: read-through cache plus staging.
pub(crate) trait CacheManager: Send + Sync {
    /// Write a cached copy of `page` in the background; best effort.
    fn cache(&self, key: &str, p: &Page);
    /// Drop the cached and staged copies of `key`.
    fn remove(&self, key: &str);
    /// Open the cached copy of `key`.
    fn load(&self, key: &str) -> Result<CachedFile>;
    /// Persist a block awaiting upload; returns the staging path.
    fn stage(&self, key: &str, data: &[u8], keep_cache: bool) -> Result<PathBuf>;
    /// Promote a staged key to cached accounting after its upload.
    fn uploaded(&self, key: &str, size: usize);
    /// Keys still waiting in the staging tree, for startup recovery.
    fn scan_staging(&self) -> HashMap<String, PathBuf>;
    /// (number of keys, cached bytes)
    fn stats(&self) -> (usize, i64);
}

#[derive(Clone, Copy)]
struct CacheItem {
    // negative while the block is only staged
    size: i32,
    atime: u32,
}

#[derive(Default)]
struct CacheIndex {
    keys: HashMap<String, CacheItem>,
    used: i64,
}

pub(crate) struct CacheStore {
    dir: PathBuf,
    mode: u32,
    capacity: i64,
    free_ratio: f32,
    key_limit: usize,
    state: Mutex<CacheIndex>,
    pending: Sender<(String, Page)>,
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

impl CacheStore {
    pub fn new(
        dir: &str,
        capacity: i64,
        key_limit: usize,
        pending_pages: usize,
        conf: &Config,
    ) -> Result<Arc<CacheStore>> {
        let root = PathBuf::from(dir);
        let (tx, rx) = bounded(pending_pages.max(1));
        let store = Arc::new(CacheStore {
            dir: root,
            mode: if conf.cache_mode != 0 { conf.cache_mode } else { 0o600 },
            capacity,
            free_ratio: conf.free_space,
            key_limit: key_limit.max(1),
            state: Mutex::new(CacheIndex::default()),
            pending: tx,
        });

        if conf.auto_create {
            store.create_dir(&store.dir.join(CACHE_DIR))?;
            store.create_dir(&store.dir.join(STAGING_DIR))?;
        }
        let meta = fs::metadata(&store.dir)
            .map_err(|e| enoent!(format!("cache dir {}: {}", dir, e)))?;
        if !meta.is_dir() {
            return Err(enoent!(format!("cache dir {} is not a directory", dir)));
        }

        store.flush_loop(rx);
        store.expire_loop();
        let scanner = store.clone();
        let _ = thread::Builder::new()
            .name("cache-scan".to_string())
            .spawn(move || scanner.scan_cached());

        Ok(store)
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.dir.join(CACHE_DIR).join(key)
    }

    pub fn stage_path(&self, key: &str) -> PathBuf {
        self.dir.join(STAGING_DIR).join(key)
    }

    fn dir_mode(&self) -> u32 {
        // search bits so the tree stays traversable
        self.mode | 0o111
    }

    fn create_dir(&self, dir: &Path) -> Result<()> {
        if dir.is_dir() {
            return Ok(());
        }
        if let Some(parent) = dir.parent() {
            self.create_dir(parent)?;
        }
        match fs::create_dir(dir) {
            Ok(()) => {
                let _ = fs::set_permissions(dir, fs::Permissions::from_mode(self.dir_mode()));
                Ok(())
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    // Write a block file atomically with the configured permissions.
    fn flush_page(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir(parent)?;
        }
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.mode)
            .open(&tmp)?;
        if let Err(e) = f.write_all(data) {
            drop(f);
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        drop(f);
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(self.mode));
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }

    fn add(&self, key: &str, size: i32, atime: u32) {
        let victims = {
            let mut idx = self.state.lock().unwrap();
            if let Some(old) = idx.keys.insert(key.to_string(), CacheItem { size, atime }) {
                if old.size > 0 {
                    idx.used -= old.size as i64;
                }
            }
            if size > 0 {
                idx.used += size as i64;
            }
            if idx.used > self.capacity || idx.keys.len() >= self.key_limit {
                self.pick_victims(&mut idx)
            } else {
                Vec::new()
            }
        };
        for path in victims {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("evict {}: {}", path.display(), e);
                }
            }
        }
    }

    // Select least-recently-used cached entries until the byte and
    // count goals hold again; called with the index locked, files are
    // unlinked by the caller after the lock is dropped.
    fn pick_victims(&self, idx: &mut CacheIndex) -> Vec<PathBuf> {
        let goal_used = self.capacity * 95 / 100;
        let goal_keys = self.key_limit * 95 / 100;
        let mut cached: Vec<(String, CacheItem)> = idx
            .keys
            .iter()
            .filter(|(_, it)| it.size > 0)
            .map(|(k, it)| (k.clone(), *it))
            .collect();
        cached.sort_by_key(|(_, it)| it.atime);
        let mut victims = Vec::new();
        for (key, it) in cached {
            if idx.used <= goal_used && idx.keys.len() <= goal_keys {
                break;
            }
            idx.keys.remove(&key);
            idx.used -= it.size as i64;
            debug!("evict {} ({} bytes)", key, it.size);
            victims.push(self.cache_path(&key));
        }
        victims
    }

    fn free_space_ok(&self) -> bool {
        match statvfs(&self.dir) {
            Ok(st) => {
                let br = if st.blocks() > 0 {
                    st.blocks_available() as f32 / st.blocks() as f32
                } else {
                    1.0
                };
                let fr = if st.files() > 0 {
                    st.files_available() as f32 / st.files() as f32
                } else {
                    1.0
                };
                br >= self.free_ratio && fr >= self.free_ratio
            }
            Err(e) => {
                warn!("statvfs {}: {}", self.dir.display(), e);
                true
            }
        }
    }

    // Drop the oldest tenth of the cached entries to reclaim space.
    fn expire_for_space(&self) {
        let victims = {
            let mut idx = self.state.lock().unwrap();
            let mut cached: Vec<(String, CacheItem)> = idx
                .keys
                .iter()
                .filter(|(_, it)| it.size > 0)
                .map(|(k, it)| (k.clone(), *it))
                .collect();
            if cached.is_empty() {
                return;
            }
            cached.sort_by_key(|(_, it)| it.atime);
            let drop_n = (cached.len() / 10).max(1);
            let mut victims = Vec::with_capacity(drop_n);
            for (key, it) in cached.into_iter().take(drop_n) {
                idx.keys.remove(&key);
                idx.used -= it.size as i64;
                victims.push(self.cache_path(&key));
            }
            victims
        };
        for path in victims {
            let _ = fs::remove_file(&path);
        }
    }

    fn flush_loop(self: &Arc<Self>, rx: Receiver<(String, Page)>) {
        let me = Arc::downgrade(self);
        let _ = thread::Builder::new()
            .name("cache-flush".to_string())
            .spawn(move || {
                while let Ok((key, page)) = rx.recv() {
                    if let Some(store) = me.upgrade() {
                        if !store.free_space_ok() {
                            store.expire_for_space();
                        }
                        if store.free_space_ok() {
                            match store.flush_page(&store.cache_path(&key), page.data()) {
                                Ok(()) => store.add(&key, page.len() as i32, now()),
                                Err(e) => warn!("cache block {}: {}", key, e),
                            }
                        } else {
                            debug!("skip caching {}: disk is full", key);
                        }
                    }
                    page.release();
                }
            });
    }

    fn expire_loop(self: &Arc<Self>) {
        let me = Arc::downgrade(self);
        let _ = thread::Builder::new()
            .name("cache-expire".to_string())
            .spawn(move || loop {
                thread::sleep(Duration::from_secs(60));
                match me.upgrade() {
                    Some(store) => {
                        if !store.free_space_ok() {
                            store.expire_for_space();
                        }
                    }
                    None => return,
                }
            });
    }

    // Rebuild the index from the cached tree left by a previous run.
    fn scan_cached(&self) {
        let root = self.dir.join(CACHE_DIR);
        let mut count = 0usize;
        walk(&root, &mut |path, meta| {
            if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                let _ = fs::remove_file(path);
                return;
            }
            if let Ok(key) = path.strip_prefix(&root) {
                let key = key.to_string_lossy().into_owned();
                let exists = self.state.lock().unwrap().keys.contains_key(&key);
                if !exists {
                    self.add(&key, meta.len() as i32, meta.atime() as u32);
                    count += 1;
                }
            }
        });
        if count > 0 {
            info!("found {} cached blocks under {}", count, root.display());
        }
    }
}

impl CacheManager for CacheStore {
    fn cache(&self, key: &str, p: &Page) {
        if self.capacity == 0 {
            return;
        }
        if self.state.lock().unwrap().keys.contains_key(key) {
            return;
        }
        let copy = p.share();
        if let Err(e) = self.pending.try_send((key.to_string(), copy)) {
            // the write-behind queue is full, drop this copy
            let (_, page) = e.into_inner();
            page.release();
        }
    }

    fn remove(&self, key: &str) {
        {
            let mut idx = self.state.lock().unwrap();
            if let Some(it) = idx.keys.remove(key) {
                if it.size > 0 {
                    idx.used -= it.size as i64;
                }
            }
        }
        let _ = fs::remove_file(self.cache_path(key));
        let _ = fs::remove_file(self.stage_path(key));
    }

    fn load(&self, key: &str) -> Result<CachedFile> {
        {
            let mut idx = self.state.lock().unwrap();
            match idx.keys.get_mut(key) {
                Some(it) => it.atime = now(),
                None => return Err(enoent!(format!("block {} is not cached", key))),
            }
        }
        let path = self.cache_path(key);
        match File::open(&path) {
            Ok(file) => Ok(CachedFile { file, path }),
            Err(e) => {
                // stale index entry, the file is gone
                let mut idx = self.state.lock().unwrap();
                if let Some(it) = idx.keys.remove(key) {
                    if it.size > 0 {
                        idx.used -= it.size as i64;
                    }
                }
                Err(e)
            }
        }
    }

    fn stage(&self, key: &str, data: &[u8], keep_cache: bool) -> Result<PathBuf> {
        let path = self.stage_path(key);
        self.flush_page(&path, data)?;
        if self.capacity > 0 && keep_cache {
            let cpath = self.cache_path(key);
            match cpath
                .parent()
                .map(|p| self.create_dir(p))
                .unwrap_or(Ok(()))
                .and_then(|_| fs::hard_link(&path, &cpath))
            {
                Ok(()) => self.add(key, -(data.len() as i32), now()),
                Err(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.add(key, -(data.len() as i32), now())
                }
                Err(e) => warn!("link {} to cache: {}", key, e),
            }
        }
        Ok(path)
    }

    fn uploaded(&self, key: &str, size: usize) {
        self.add(key, size as i32, now());
    }

    fn scan_staging(&self) -> HashMap<String, PathBuf> {
        let root = self.dir.join(STAGING_DIR);
        let mut out = HashMap::new();
        walk(&root, &mut |path, _meta| {
            if let Ok(key) = path.strip_prefix(&root) {
                out.insert(key.to_string_lossy().into_owned(), path.to_path_buf());
            }
        });
        if !out.is_empty() {
            info!("found {} staging blocks under {}", out.len(), root.display());
        }
        out
    }

    fn stats(&self) -> (usize, i64) {
        let idx = self.state.lock().unwrap();
        (idx.keys.len(), idx.used)
    }
}

fn walk(dir: &Path, f: &mut dyn FnMut(&Path, &fs::Metadata)) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.metadata() {
            Ok(meta) if meta.is_dir() => walk(&path, f),
            Ok(meta) => f(&path, &meta),
            Err(_) => {}
        }
    }
}

// Sharding over several cache directories, selected by key hash.
struct CacheShards {
    stores: Vec<Arc<CacheStore>>,
}

impl CacheShards {
    fn store_for(&self, key: &str) -> &Arc<CacheStore> {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        &self.stores[(h.finish() % self.stores.len() as u64) as usize]
    }
}

impl CacheManager for CacheShards {
    fn cache(&self, key: &str, p: &Page) {
        self.store_for(key).cache(key, p)
    }

    fn remove(&self, key: &str) {
        self.store_for(key).remove(key)
    }

    fn load(&self, key: &str) -> Result<CachedFile> {
        self.store_for(key).load(key)
    }

    fn stage(&self, key: &str, data: &[u8], keep_cache: bool) -> Result<PathBuf> {
        self.store_for(key).stage(key, data, keep_cache)
    }

    fn uploaded(&self, key: &str, size: usize) {
        self.store_for(key).uploaded(key, size)
    }

    fn scan_staging(&self) -> HashMap<String, PathBuf> {
        let mut out = HashMap::new();
        for s in &self.stores {
            out.extend(s.scan_staging());
        }
        out
    }

    fn stats(&self) -> (usize, i64) {
        self.stores.iter().fold((0, 0), |acc, s| {
            let (k, u) = s.stats();
            (acc.0 + k, acc.1 + u)
        })
    }
}

// Used when caching is turned off; staging errors push writers onto
// the synchronous upload path.
struct DisabledCache;

impl CacheManager for DisabledCache {
    fn cache(&self, _key: &str, _p: &Page) {}

    fn remove(&self, _key: &str) {}

    fn load(&self, key: &str) -> Result<CachedFile> {
        Err(enoent!(format!("block {} is not cached", key)))
    }

    fn stage(&self, _key: &str, _data: &[u8], _keep_cache: bool) -> Result<PathBuf> {
        Err(enosys!("caching is disabled"))
    }

    fn uploaded(&self, _key: &str, _size: usize) {}

    fn scan_staging(&self) -> HashMap<String, PathBuf> {
        HashMap::new()
    }

    fn stats(&self) -> (usize, i64) {
        (0, 0)
    }
}

/// Build the cache layer for `conf`, expanding the cache-dir pattern
/// into one shard per physical directory. Unusable directories are
/// logged and skipped so the store still serves from the backend.
pub(crate) fn new_cache_manager(conf: &Config) -> Result<Arc<dyn CacheManager>> {
    if conf.cache_dir.is_empty() || conf.cache_size == 0 {
        return Ok(Arc::new(DisabledCache));
    }
    let dirs = expand_dir(&conf.cache_dir);
    let per_dir = conf.cache_size / dirs.len() as i64;
    let key_limit = (per_dir / BLOCK_SIZE as i64).max(2) as usize;
    let pending = if conf.page_size > 0 {
        (conf.buffer_size / conf.page_size).max(1)
    } else {
        1
    };
    let mut stores = Vec::with_capacity(dirs.len());
    for d in &dirs {
        match CacheStore::new(d, per_dir, key_limit, pending, conf) {
            Ok(s) => stores.push(s),
            Err(e) => warn!("open cache dir {}: {}", d, e),
        }
    }
    match stores.len() {
        0 => {
            warn!("no usable cache dir under {}, caching is disabled", conf.cache_dir);
            Ok(Arc::new(DisabledCache))
        }
        1 => {
            let single: Arc<dyn CacheManager> = stores.remove(0);
            Ok(single)
        }
        _ => Ok(Arc::new(CacheShards { stores })),
    }
}

fn has_meta(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

fn match_pattern(pat: &str, name: &str) -> bool {
    let p: Vec<char> = pat.chars().collect();
    let n: Vec<char> = name.chars().collect();
    fn matches(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&p[1..], n) || (!n.is_empty() && matches(p, &n[1..]))
            }
            (Some('?'), Some(_)) => matches(&p[1..], &n[1..]),
            (Some(c), Some(d)) if c == d => matches(&p[1..], &n[1..]),
            _ => false,
        }
    }
    matches(&p, &n)
}

/// Expand `*`/`?` wildcards in a cache-dir pattern against existing
/// directories. Components after the wildcard are appended verbatim;
/// a pattern matching nothing expands to itself.
pub(crate) fn expand_dir(path: &str) -> Vec<String> {
    if !has_meta(path) {
        return vec![path.to_string()];
    }
    let mut bases: Vec<PathBuf> = vec![PathBuf::from(if path.starts_with('/') { "/" } else { "" })];
    for comp in Path::new(path).components() {
        let name = match comp {
            std::path::Component::Normal(n) => n.to_string_lossy().into_owned(),
            _ => continue,
        };
        if has_meta(&name) {
            let mut next = Vec::new();
            for base in &bases {
                let dir = if base.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    base.clone()
                };
                if let Ok(entries) = fs::read_dir(&dir) {
                    let mut matched: Vec<String> = entries
                        .flatten()
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .filter(|n| match_pattern(&name, n))
                        .collect();
                    matched.sort();
                    for m in matched {
                        next.push(base.join(m));
                    }
                }
            }
            bases = next;
        } else {
            bases = bases.iter().map(|b| b.join(&name)).collect();
        }
    }
    let mut out: Vec<String> = bases
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    out.sort();
    if out.is_empty() {
        vec![path.to_string()]
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    #[test]
    fn test_expand() {
        let rs = expand_dir("/not/exists/blockCache");
        assert_eq!(rs, vec!["/not/exists/blockCache".to_string()]);

        let tmp = TempDir::new().unwrap();
        let base = tmp.as_path().to_path_buf();
        fs::create_dir_all(base.join("disk1")).unwrap();
        fs::create_dir_all(base.join("disk2")).unwrap();
        fs::create_dir_all(base.join("disk3").join("cache").join("blocks")).unwrap();

        let pattern = format!("{}/disk*/cache/blocks", base.display());
        let rs = expand_dir(&pattern);
        assert_eq!(rs.len(), 3);
        assert_eq!(rs[0], format!("{}/disk1/cache/blocks", base.display()));
    }

    #[test]
    fn test_match_pattern() {
        assert!(match_pattern("disk*", "disk12"));
        assert!(match_pattern("disk?", "disk1"));
        assert!(!match_pattern("disk?", "disk12"));
        assert!(match_pattern("*", "anything"));
        assert!(!match_pattern("disk*", "ssd1"));
    }

    #[test]
    fn test_cache_store() {
        let tmp = TempDir::new().unwrap();
        let mut conf = Config::default();
        conf.auto_create = true;
        let s = CacheStore::new(
            tmp.as_path().to_str().unwrap(),
            10240,
            3,
            1,
            &conf,
        )
        .unwrap();

        let key = "chunks/1";
        s.stage(key, &[1], true).unwrap();
        let f = s.load(key).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(f.read_full_at(&mut buf, 0).unwrap(), 1);
        assert_eq!(buf[0], 1);
        fs::remove_file(s.stage_path(key)).unwrap();
        s.uploaded(key, 1);

        for i in 0..10 {
            s.add(&i.to_string(), 10, now());
            let (keys, used) = s.stats();
            assert!(keys <= 2, "cached {} items", keys);
            assert!(used <= 10240, "cached {} bytes", used);
        }
    }

    #[test]
    fn test_staged_not_evicted() {
        let tmp = TempDir::new().unwrap();
        let mut conf = Config::default();
        conf.auto_create = true;
        let s = CacheStore::new(tmp.as_path().to_str().unwrap(), 100, 4, 1, &conf).unwrap();

        s.stage("chunks/0/0/7_0", &[7; 8], true).unwrap();
        for i in 0..10 {
            s.add(&format!("c{}", i), 30, now());
        }
        // the staged entry survived every cleanup round
        assert!(s.load("chunks/0/0/7_0").is_ok());
        let (_, used) = s.stats();
        assert!(used <= 100);
    }

    #[test]
    fn test_scan_staging() {
        let tmp = TempDir::new().unwrap();
        let mut conf = Config::default();
        conf.auto_create = true;
        let s = CacheStore::new(tmp.as_path().to_str().unwrap(), 1 << 20, 100, 1, &conf).unwrap();
        s.stage("chunks/0/0/123_0", b"good", false).unwrap();
        let staged = s.scan_staging();
        assert_eq!(staged.len(), 1);
        assert!(staged.contains_key("chunks/0/0/123_0"));
    }

    #[test]
    fn test_corrupt_entry_dropped() {
        let tmp = TempDir::new().unwrap();
        let mut conf = Config::default();
        conf.auto_create = true;
        let s = CacheStore::new(tmp.as_path().to_str().unwrap(), 1 << 20, 100, 1, &conf).unwrap();
        s.add("chunks/0/0/9_0_4", 4, now());
        // no file behind the entry: load fails and drops it
        assert!(s.load("chunks/0/0/9_0_4").is_err());
        let (keys, used) = s.stats();
        assert_eq!(keys, 0);
        assert_eq!(used, 0);
    }
}
