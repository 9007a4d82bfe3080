// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The cached chunk store: ranged reads through the cache tiers and a
//! write pipeline splitting chunks into uploaded blocks.
//!
//! Blocks are addressed by `chunks/{cid/1e6}/{cid/1e3}/{cid}_{indx}_{len}`
//! (or a hex-partitioned variant), where the trailing length is the
//! uncompressed block size. Reads consult the group cache, then the disk
//! cache, then the backend with duplicate suppression; a tiny read in
//! the middle of a block on a seekable backend turns into a ranged GET
//! plus a background prefetch of the whole block. Writes accumulate in
//! per-block page lists and are uploaded on flush, either synchronously
//! or via the on-disk staging area when write-back is enabled.

use std::collections::HashSet;
use std::fmt::Write as FmtWrite;
use std::fs;
use std::io::{ErrorKind, Read, Result};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use futures::executor::block_on;
use governor::{
    clock::QuantaClock, state::direct::NotKeyed, state::InMemoryState, Quota, RateLimiter,
};
use serde::Deserialize;

use silofs_utils::compress::{new_compressor, Compressor};

use super::disk_cache::{new_cache_manager, CacheManager};
use super::group_cache::{self, Bytes, CacheGroup};
use super::page::{alloc_page, free_page, Page};
use super::prefetch::Prefetcher;
use super::singleflight::Group;
use super::{ChunkStore, Context, Reader, Writer, BLOCK_SIZE, CHUNK_SIZE};
use crate::backend::ObjectStorage;

/// Requests slower than this are logged at info level.
const SLOW_REQUEST: Duration = Duration::from_secs(10);

/// Options for the cached store.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache_dir: String,
    pub cache_mode: u32,
    pub cache_size: i64,
    pub free_space: f32,
    pub auto_create: bool,
    pub compress: String,
    pub max_upload: usize,
    pub async_upload: bool,
    pub partitions: usize,
    pub page_size: usize,
    /// Outbound upload budget in bytes per second, zero for unlimited.
    pub upload_limit: usize,
    pub get_timeout: Duration,
    pub put_timeout: Duration,
    pub cache_group: String,
    pub cache_group_size: usize,
    pub cache_full_block: bool,
    pub buffer_size: usize,
    pub readahead: usize,
    pub prefetch: usize,
}

impl Config {
    /// Build a config from a JSON object, e.g. the storage section of a
    /// mount configuration file. Missing fields keep their defaults.
    pub fn from_value(v: serde_json::Value) -> Result<Config> {
        serde_json::from_value(v).map_err(|e| einval!(e))
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            cache_dir: String::new(),
            cache_mode: 0o600,
            cache_size: 0,
            free_space: 0.1,
            auto_create: false,
            compress: String::new(),
            max_upload: 1,
            async_upload: false,
            partitions: 1,
            page_size: 4 << 20,
            upload_limit: 0,
            get_timeout: Duration::from_secs(0),
            put_timeout: Duration::from_secs(0),
            cache_group: String::new(),
            cache_group_size: 0,
            cache_full_block: false,
            buffer_size: 0,
            readahead: 0,
            prefetch: 1,
        }
    }
}

// Hash salt appended to group-cache keys so hot blocks of one file
// spread over the peer group.
fn group_key(ctx: &Context, conf: &Config) -> String {
    if conf.cache_group_size == 0 {
        return String::new();
    }
    match ctx.inode {
        Some(ino) => format!("#{}-{}", ino, ctx.group.unwrap_or(0)),
        None => String::new(),
    }
}

/// Parse the uncompressed length a block key advertises in its suffix;
/// zero for legacy keys without one.
pub(crate) fn parse_origin_size(key: &str) -> usize {
    match key.rfind('_') {
        Some(p) => key[p + 1..].parse().unwrap_or(0),
        None => 0,
    }
}

fn block_key(id: u64, indx: usize, bsize: usize, partitions: usize) -> String {
    if partitions > 1 {
        format!(
            "chunks/{:02X}/{}/{}_{}_{}",
            id % 256,
            id / 1000 / 1000,
            id,
            indx,
            bsize
        )
    } else {
        format!(
            "chunks/{}/{}/{}_{}_{}",
            id / 1000 / 1000,
            id / 1000,
            id,
            indx,
            bsize
        )
    }
}

fn chunk_block_size(length: usize, page_size: usize, indx: usize) -> usize {
    (length - indx * page_size).min(page_size)
}

/// Run `f` on a worker thread and give up after `timeout`; the timeout
/// surfaces as an ordinary error while the worker finishes on its own.
fn with_timeout<T, F>(f: F, timeout: Duration) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    let _ = thread::Builder::new()
        .name("storage_op".to_string())
        .spawn(move || {
            let _ = tx.send(f());
        });
    match rx.recv_timeout(timeout) {
        Ok(r) => r,
        Err(_) => Err(etimedout!(format!("timeout after {:?}", timeout))),
    }
}

/// Read until `buf` is full or the stream ends; returns the count.
pub(crate) fn read_full(r: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

// Byte-rate limiter for outbound uploads. Waiting happens in steps of
// at most one burst so a block larger than the burst cannot wedge the
// limiter.
struct Throttle {
    limiter: RateLimiter<NotKeyed, InMemoryState, QuantaClock>,
    burst: u32,
}

impl Throttle {
    fn new(bytes_per_second: NonZeroU32) -> Throttle {
        Throttle {
            limiter: RateLimiter::direct(Quota::per_second(bytes_per_second)),
            burst: bytes_per_second.get(),
        }
    }

    fn wait(&self, bytes: usize) {
        let mut left = bytes as u64;
        while left > 0 {
            let step = left.min(self.burst as u64) as u32;
            left -= step as u64;
            let cells = match NonZeroU32::new(step) {
                Some(c) => c,
                None => continue,
            };
            if let Err(e) = self
                .limiter
                .check_n(cells)
                .or_else(|_| block_on(self.limiter.until_n_ready(cells)))
            {
                // insufficient capacity must not loop forever
                error!("{}: give up rate-limiting", e);
                return;
            }
        }
    }
}

static NEXT_PRIVATE_GROUP: AtomicU64 = AtomicU64::new(0);

// Releases an unused page when a single-flight closure is dropped
// without running.
struct PageGuard(Option<Page>);

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(p) = self.0.take() {
            p.release();
        }
    }
}

/// Chunk store over an object-storage backend with a group cache, a
/// disk cache, duplicate-suppressed downloads and staged uploads.
pub struct CachedStore {
    storage: Arc<dyn ObjectStorage>,
    gcache: Arc<CacheGroup>,
    bcache: Arc<dyn CacheManager>,
    fetcher: Prefetcher,
    conf: Config,
    group: Group,
    upload_slots: (Sender<()>, Receiver<()>),
    pending_keys: Mutex<HashSet<String>>,
    compressor: Arc<dyn Compressor>,
    seekable: bool,
    throttle: Option<Throttle>,
}

impl CachedStore {
    pub fn new(storage: Arc<dyn ObjectStorage>, mut config: Config) -> Result<Arc<CachedStore>> {
        let compressor = new_compressor(&config.compress)
            .ok_or_else(|| einval!(format!("unknown compress algorithm: {}", config.compress)))?;
        if config.get_timeout.as_secs() == 0 {
            config.get_timeout = Duration::from_secs(60);
        }
        if config.put_timeout.as_secs() == 0 {
            config.put_timeout = Duration::from_secs(60);
        }
        if config.cache_size == 0 {
            // prefetching only fills the disk cache
            config.prefetch = 0;
        }
        let bcache = new_cache_manager(&config)?;
        let seekable = compressor.compress_bound(0) == 0
            && !storage.to_string().contains("(encrypted)");
        let throttle = NonZeroU32::new(config.upload_limit as u32).map(|v| {
            info!("uploads are limited at {} bytes per second", v);
            Throttle::new(v)
        });
        let group_name = if config.cache_group.is_empty() {
            format!("block-{}", NEXT_PRIVATE_GROUP.fetch_add(1, Ordering::Relaxed))
        } else {
            config.cache_group.clone()
        };
        let group_size = if config.cache_group_size > 0 {
            config.cache_group_size
        } else {
            32 << 20
        };

        let store = Arc::new_cyclic(|me: &Weak<CachedStore>| {
            let getter_me = me.clone();
            let get_timeout = config.get_timeout;
            let gcache = group_cache::get_or_create(
                &group_name,
                group_size,
                Box::new(move |key: &str| {
                    let store = getter_me
                        .upgrade()
                        .ok_or_else(|| eio!("chunk store is gone"))?;
                    let key = key.to_string();
                    with_timeout(move || store.group_fetch(&key), get_timeout)
                }),
            );
            let fetch_me = me.clone();
            let fetcher = Prefetcher::new(
                config.prefetch,
                Arc::new(move |key: &str| {
                    if let Some(store) = fetch_me.upgrade() {
                        if let Err(e) = store.gcache.get(key) {
                            debug!("prefetch {}: {}", key, e);
                        }
                    }
                }),
            );
            CachedStore {
                storage,
                gcache,
                bcache,
                fetcher,
                upload_slots: bounded(config.max_upload.max(1)),
                pending_keys: Mutex::new(HashSet::new()),
                compressor,
                seekable,
                throttle,
                group: Group::new(),
                conf: config,
            }
        });
        store.upload_staging();
        Ok(store)
    }

    /// Whether ranged GETs read stored bytes directly: the codec is a
    /// pass-through and the backend does not re-encode objects.
    pub fn seekable(&self) -> bool {
        self.seekable
    }

    pub fn config(&self) -> &Config {
        &self.conf
    }

    fn should_cache(&self, size: usize) -> bool {
        size < self.conf.page_size || self.conf.cache_full_block
    }

    // Download a whole block into `page`, decompressing when the codec
    // inflates and populating the disk cache on success. After the
    // second failed GET a short block is rebuilt from objects sharing
    // the key prefix.
    pub(crate) fn load(&self, key: &str, page: &mut Page, cache: bool) -> Result<()> {
        let start = Instant::now();
        let mut input: Option<Box<dyn Read + Send>> = None;
        let mut last_err = eio!("not downloaded");
        let mut tried = 0u32;
        while input.is_none() && tried < 2 {
            thread::sleep(Duration::from_secs((tried * tried) as u64));
            let st = Instant::now();
            let r = self.storage.get(key, 0, -1);
            let used = st.elapsed();
            debug!(
                "GET {} ({:?}, {:.3}s)",
                key,
                r.as_ref().err(),
                used.as_secs_f64()
            );
            if used > SLOW_REQUEST {
                info!("slow request: GET {} ({:.3}s)", key, used.as_secs_f64());
            }
            match r {
                Ok(r) => input = Some(r),
                Err(e) => {
                    if tried == 1 && page.len() < self.conf.page_size {
                        let recovered = recover_appended_key(
                            self.storage.as_ref(),
                            key,
                            self.compressor.as_ref(),
                            page,
                        );
                        if recovered.is_ok() {
                            if cache {
                                self.bcache.cache(key, page);
                            }
                            return Ok(());
                        }
                    }
                    last_err = e;
                }
            }
            tried += 1;
        }
        let mut input = match input {
            Some(r) => r,
            None => {
                return Err(std::io::Error::new(
                    last_err.kind(),
                    format!("get {}: {}", key, last_err),
                ))
            }
        };

        let needed = self.compressor.compress_bound(page.len());
        if needed > page.len() {
            let mut compressed = Page::new_off_heap(needed);
            let cn = match read_full(&mut input, compressed.data_mut()) {
                Ok(cn) => cn,
                Err(e) => {
                    compressed.release();
                    return Err(e);
                }
            };
            let r = self.compressor.decompress(page.data_mut(), &compressed.data()[..cn]);
            compressed.release();
            let n = r?;
            if n < page.len() {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!(
                        "read {} fully: {} < {} after {:?} (tried {})",
                        key,
                        n,
                        page.len(),
                        start.elapsed(),
                        tried
                    ),
                ));
            }
        } else {
            let n = read_full(&mut input, page.data_mut())?;
            if n < page.len() {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!(
                        "read {} fully: {} < {} after {:?} (tried {})",
                        key,
                        n,
                        page.len(),
                        start.elapsed(),
                        tried
                    ),
                ));
            }
        }
        if cache {
            self.bcache.cache(key, page);
        }
        Ok(())
    }

    // Fill a group-cache miss: strip the hash salt, honor an optional
    // `,off,len` range suffix, serve from the disk cache when possible
    // and fall back to a full download.
    fn group_fetch(&self, raw_key: &str) -> Result<Vec<u8>> {
        let mut key = raw_key;
        if let Some(p) = key.find('#') {
            key = &key[..p];
        }
        let (base, mut boff, mut limit) = match key.find(',') {
            Some(_) => {
                let mut parts = key.splitn(3, ',');
                let base = parts.next().unwrap_or("");
                let boff = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let limit = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                (base, boff, limit)
            }
            None => (key, 0, 0),
        };
        let size = parse_origin_size(base);
        if size == 0 || size > self.conf.page_size {
            return Err(einval!(format!("invalid block key: {}", base)));
        }
        if limit == 0 {
            limit = size;
        }
        if boff + limit > size {
            boff = 0;
            limit = size;
        }

        if let Ok(f) = self.bcache.load(base) {
            let mut block = vec![0u8; limit];
            match f.read_full_at(&mut block, boff as u64) {
                Ok(n) if n == limit => return Ok(block),
                r => {
                    error!("short cached block {}: {:?} < {}", base, r, size);
                    let _ = fs::remove_file(&f.path);
                }
            }
        }

        let mut page = Page::new(vec![0u8; size]);
        let r = self.load(base, &mut page, true);
        let out = match r {
            Ok(()) => Ok(page.data()[boff..boff + limit].to_vec()),
            Err(e) => Err(e),
        };
        page.release();
        out
    }

    fn put(&self, key: &str, block: &Page) -> Result<()> {
        if let Some(t) = &self.throttle {
            t.wait(block.len());
        }
        let data = block.share();
        let storage = self.storage.clone();
        let key = key.to_string();
        with_timeout(
            move || {
                let st = Instant::now();
                let r = storage.put(&key, data.data());
                data.release();
                let used = st.elapsed();
                debug!(
                    "PUT {} ({:?}, {:.3}s)",
                    key,
                    r.as_ref().err(),
                    used.as_secs_f64()
                );
                if used > SLOW_REQUEST {
                    info!("slow request: PUT {} ({:.3}s)", key, used.as_secs_f64());
                }
                r
            },
            self.conf.put_timeout,
        )
    }

    // Replay blocks left in the staging area by an earlier run.
    fn upload_staging(self: &Arc<Self>) {
        let store = self.clone();
        let _ = thread::Builder::new()
            .name("staging_scan".to_string())
            .spawn(move || {
                for (key, path) in store.bcache.scan_staging() {
                    if store.upload_slots.0.send(()).is_err() {
                        return;
                    }
                    let store = store.clone();
                    let _ = thread::Builder::new()
                        .name("staging_upload".to_string())
                        .spawn(move || {
                            store.upload_staged(&key, &path);
                            let _ = store.upload_slots.1.recv();
                        });
                }
            });
    }

    fn upload_staged(&self, key: &str, path: &Path) {
        let block = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                error!("open {}: {}", path.display(), e);
                return;
            }
        };
        let mut buf = Page::new_off_heap(self.compressor.compress_bound(block.len()));
        let n = match self.compressor.compress(buf.data_mut(), &block) {
            Ok(n) => n,
            Err(e) => {
                error!("compress staged block {}: {}", path.display(), e);
                buf.release();
                return;
            }
        };
        buf.set_len(n);

        let mut key = key.to_string();
        if key.matches('_').count() == 1 {
            // legacy object without the origin length suffix
            let _ = write!(key, "_{}", block.len());
        }
        let mut try_ = 0u32;
        loop {
            match self.put(&key, &buf) {
                Ok(()) => break,
                Err(e) => {
                    info!("upload {}: {} (try {})", key, e, try_);
                    try_ += 1;
                    thread::sleep(Duration::from_secs((try_ * try_) as u64));
                }
            }
        }
        buf.release();
        self.bcache.uploaded(&key, block.len());
        let _ = fs::remove_file(path);
    }
}

/// Rebuild a block from an object sharing its key prefix but
/// advertising at least the wanted length; used when the exact key is
/// gone because the object was re-written with more data appended.
pub(crate) fn recover_appended_key(
    storage: &dyn ObjectStorage,
    key: &str,
    compressor: &dyn Compressor,
    page: &mut Page,
) -> Result<()> {
    let pos = key
        .rfind('_')
        .ok_or_else(|| einval!(format!("invalid block key: {}", key)))?;
    let prefix = &key[..pos];
    let want = page.len();
    let objs = storage.list(prefix, "", 1000)?;
    for obj in objs {
        let l = parse_origin_size(&obj.key);
        if l < want || l == 0 {
            continue;
        }
        let mut input = match storage.get(&obj.key, 0, -1) {
            Ok(r) => r,
            Err(e) => {
                warn!("get {}: {}", obj.key, e);
                continue;
            }
        };
        let mut src = Vec::new();
        if input.read_to_end(&mut src).is_err() {
            continue;
        }
        let mut decoded = Page::new_off_heap(l);
        match compressor.decompress(decoded.data_mut(), &src) {
            Ok(n) if n >= want => {
                page.data_mut().copy_from_slice(&decoded.data()[..want]);
                decoded.release();
                info!("recovered {} using {}", key, obj.key);
                return Ok(());
            }
            r => {
                warn!("load {}: {:?} ({} wanted)", obj.key, r, want);
                decoded.release();
            }
        }
    }
    Err(enoent!(format!("{} is not recoverable", key)))
}

// Read access to one chunk.
struct RChunk {
    id: u64,
    length: usize,
    store: Arc<CachedStore>,
}

impl RChunk {
    fn new(id: u64, length: usize, store: Arc<CachedStore>) -> RChunk {
        RChunk { id, length, store }
    }

    fn block_size(&self, indx: usize) -> usize {
        chunk_block_size(self.length, self.store.conf.page_size, indx)
    }

    fn key(&self, indx: usize) -> String {
        block_key(self.id, indx, self.block_size(indx), self.store.conf.partitions)
    }

    fn index(&self, off: usize) -> usize {
        off / self.store.conf.page_size
    }

    // Full-block fetch through the group cache, with retries because a
    // contended fill may come back empty-handed.
    fn load_page(&self, ctx: &Context, indx: usize) -> Result<Bytes> {
        let key = format!("{}{}", self.key(indx), group_key(ctx, &self.store.conf));
        let mut last = eio!(format!("can not download {}", key));
        for i in 0..3u32 {
            thread::sleep(Duration::from_secs((i * i) as u64));
            match self.store.gcache.get(&key) {
                Ok(b) if !b.is_empty() => return Ok(b),
                Ok(_) => last = eio!(format!("can not download {} after 3 tries", key)),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    fn read_block(&self, ctx: &Context, page: &mut Page, off: usize) -> Result<usize> {
        let len = page.len();
        let store = &self.store;
        let psize = store.conf.page_size;
        let indx = self.index(off);
        let boff = off % psize;
        let block_size = self.block_size(indx);
        let key = self.key(indx);

        let in_gcache = store.gcache.is_cached(&key);
        if store.conf.cache_size > 0 && !in_gcache {
            if let Ok(f) = store.bcache.load(&key) {
                match f.read_full_at(page.data_mut(), boff as u64) {
                    Ok(n) if n == len => return Ok(len),
                    r => {
                        warn!(
                            "remove partial cached block {}: {:?} < {}",
                            f.path.display(),
                            r,
                            len
                        );
                        let _ = fs::remove_file(&f.path);
                    }
                }
            }
        }

        if !store.should_cache(len) || (store.conf.cache_group.is_empty() && !in_gcache) {
            if store.seekable && boff > 0 && len <= block_size / 4 && !in_gcache {
                // tiny read in the middle of a block
                let st = Instant::now();
                let r = store.storage.get(&key, boff as u64, len as i64);
                let used = st.elapsed();
                debug!(
                    "GET {} RANGE({},{}) ({:.3}s)",
                    key,
                    boff,
                    len,
                    used.as_secs_f64()
                );
                if used > SLOW_REQUEST {
                    info!("slow request: GET {} ({:.3}s)", key, used.as_secs_f64());
                }
                store.fetcher.fetch(&key);
                if let Ok(mut input) = r {
                    return read_full(&mut *input, page.data_mut());
                }
            }
            let whole = boff == 0 && len == block_size;
            let mut target = PageGuard(if whole { Some(page.share()) } else { None });
            let store2 = store.clone();
            let key2 = key.clone();
            let cache_eligible = store.should_cache(block_size);
            let timeout = store.conf.get_timeout;
            let block = store.group.execute(&key, move || {
                let tmp = match target.0.take() {
                    Some(p) => p,
                    None => Page::new_off_heap(block_size),
                };
                let worker = tmp.share();
                let r = with_timeout(
                    move || {
                        let mut worker = worker;
                        let r = store2.load(&key2, &mut worker, cache_eligible);
                        worker.release();
                        r
                    },
                    timeout,
                );
                match r {
                    Ok(()) => Ok(tmp),
                    Err(e) => {
                        tmp.release();
                        Err(e)
                    }
                }
            })?;
            if !block.same_memory(page) {
                page.data_mut()
                    .copy_from_slice(&block.data()[boff..boff + len]);
            }
            block.release();
            return Ok(len);
        }

        if len < block_size / 2 && !store.conf.cache_group.is_empty() {
            // partial read served by the peer group
            let rkey = format!("{},{},{}{}", key, boff, len, group_key(ctx, &store.conf));
            for _ in 0..3 {
                if let Ok(bytes) = store.gcache.get(&rkey) {
                    page.data_mut().copy_from_slice(&bytes[..len]);
                    return Ok(len);
                }
            }
        }
        let block = self.load_page(ctx, indx)?;
        page.data_mut()
            .copy_from_slice(&block[boff..boff + len]);
        Ok(len)
    }

    fn delete_block(&self, indx: usize) -> Result<()> {
        let key = self.key(indx);
        let st = Instant::now();
        let r = self.store.storage.delete(&key);
        let used = st.elapsed();
        debug!(
            "DELETE {} ({:?}, {:.3}s)",
            key,
            r.as_ref().err(),
            used.as_secs_f64()
        );
        if used > SLOW_REQUEST {
            info!("slow request: DELETE {} ({:.3}s)", key, used.as_secs_f64());
        }
        r
    }

    fn remove(&self) -> Result<()> {
        if self.length == 0 {
            return Ok(());
        }
        let last_indx = (self.length - 1) / self.store.conf.page_size;
        let mut deleted = false;
        for i in 0..=last_indx {
            // concurrent removals of one chunk should all succeed as
            // long as any of them deletes a block
            let key = self.key(i);
            self.store.pending_keys.lock().unwrap().remove(&key);
            self.store.bcache.remove(&key);
            if self.delete_block(i).is_ok() {
                deleted = true;
            }
        }
        if deleted {
            Ok(())
        } else {
            Err(enoent!("chunk not found"))
        }
    }
}

impl Reader for RChunk {
    fn read_at(&self, ctx: &Context, page: &mut Page, off: usize) -> Result<usize> {
        if page.is_empty() {
            return Ok(0);
        }
        if off >= self.length {
            return Ok(0);
        }
        let len = page.len();
        let psize = self.store.conf.page_size;
        let boff = off % psize;
        let block_size = self.block_size(self.index(off));
        if boff + len > block_size {
            // read beyond the current block, one aligned piece at a time
            let mut got = 0;
            let mut off = off;
            while got < len {
                if off >= self.length {
                    break;
                }
                let l = (len - got).min(self.block_size(self.index(off)) - off % psize);
                let mut piece = page.slice(got, l);
                let r = self.read_block(ctx, &mut piece, off);
                piece.release();
                match r {
                    Ok(0) => break,
                    Ok(n) => {
                        got += n;
                        off += n;
                    }
                    Err(e) => return Err(e),
                }
            }
            return Ok(got);
        }
        self.read_block(ctx, page, off)
    }
}

// Write access to one chunk: an array of per-block page lists. The
// first block accumulates in 64 KiB pages to keep small appends cheap,
// later blocks use full-size pages.
struct WChunk {
    id: u64,
    length: usize,
    store: Arc<CachedStore>,
    pages: Vec<Vec<Page>>,
    uploaded: usize,
    pendings: usize,
    errors: (Sender<Result<()>>, Receiver<Result<()>>),
    poisoned: Arc<AtomicBool>,
}

impl WChunk {
    fn new(id: u64, store: Arc<CachedStore>) -> WChunk {
        let nblocks = CHUNK_SIZE / store.conf.page_size;
        WChunk {
            id,
            length: 0,
            store,
            pages: (0..nblocks).map(|_| Vec::new()).collect(),
            uploaded: 0,
            pendings: 0,
            errors: bounded(nblocks),
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    fn block_size(&self, indx: usize) -> usize {
        chunk_block_size(self.length, self.store.conf.page_size, indx)
    }

    fn key(&self, indx: usize) -> String {
        block_key(self.id, indx, self.block_size(indx), self.store.conf.partitions)
    }

    fn upload(&mut self, indx: usize) {
        let blen = self.block_size(indx);
        let key = self.key(indx);
        let pages = std::mem::replace(&mut self.pages[indx], Vec::new());
        self.pendings += 1;

        let store = self.store.clone();
        let errors = self.errors.0.clone();
        let poisoned = self.poisoned.clone();
        let spawned = thread::Builder::new()
            .name("chunk_upload".to_string())
            .spawn(move || {
                let block = match assemble_block(pages, blen) {
                    Ok(b) => b,
                    Err(e) => {
                        error!("assemble block {}: {}", key, e);
                        let _ = errors.send(Err(e));
                        return;
                    }
                };
                if store.conf.async_upload {
                    let keep_cache = store.should_cache(blen);
                    match store.bcache.stage(&key, block.data(), keep_cache) {
                        Ok(staging_path) => {
                            let _ = errors.send(Ok(()));
                            let store2 = store.clone();
                            let poisoned2 = poisoned.clone();
                            let _ = thread::Builder::new()
                                .name("chunk_upload_async".to_string())
                                .spawn(move || {
                                    async_upload_block(
                                        &store2,
                                        &key,
                                        block,
                                        &staging_path,
                                        &poisoned2,
                                    );
                                });
                        }
                        Err(e) => {
                            warn!("stage {}: {}, upload it directly", key, e);
                            sync_upload_block(&store, &key, block, &errors, &poisoned);
                        }
                    }
                } else {
                    sync_upload_block(&store, &key, block, &errors, &poisoned);
                }
            });
        if let Err(e) = spawned {
            let _ = self
                .errors
                .0
                .send(Err(eio!(format!("spawn upload worker: {}", e))));
        }
    }
}

// Concatenate the accumulated pages of one block into a single page.
fn assemble_block(mut pages: Vec<Page>, blen: usize) -> Result<Page> {
    if pages.len() == 1 {
        return Ok(pages.remove(0));
    }
    let mut block = Page::new_off_heap(blen);
    let mut off = 0;
    let mut overflow = false;
    for p in pages {
        if !overflow {
            let d = p.data();
            if off + d.len() <= blen {
                block.data_mut()[off..off + d.len()].copy_from_slice(d);
                off += d.len();
            } else {
                overflow = true;
            }
        }
        free_page(p);
    }
    if overflow || off != blen {
        block.release();
        return Err(eio!(format!(
            "block length does not match: {} != {}",
            off, blen
        )));
    }
    Ok(block)
}

// Compress and PUT one block, retrying with quadratic backoff. Blocks
// smaller than a full page are inserted into the disk cache first so
// readers see them immediately.
fn sync_upload_block(
    store: &Arc<CachedStore>,
    key: &str,
    block: Page,
    errors: &Sender<Result<()>>,
    poisoned: &AtomicBool,
) {
    let blen = block.len();
    let bound = store.compressor.compress_bound(blen);
    let mut buf = if bound > blen {
        Page::new_off_heap(bound)
    } else {
        block.share()
    };
    if !buf.same_memory(&block) {
        let n = match store.compressor.compress(buf.data_mut(), block.data()) {
            Ok(n) => n,
            Err(e) => {
                error!("compress block {}: {}", key, e);
                let _ = errors.send(Err(eio!(format!("compress block {}: {}", key, e))));
                buf.release();
                block.release();
                return;
            }
        };
        buf.set_len(n);
    }
    if blen < store.conf.page_size {
        // the copy is flushed to disk in the background
        store.bcache.cache(key, &block);
    }
    block.release();

    if store.upload_slots.0.send(()).is_err() {
        buf.release();
        return;
    }
    let mut try_ = 0u32;
    let mut last: Option<std::io::Error> = None;
    while try_ <= 10 && !poisoned.load(Ordering::Relaxed) {
        match store.put(key, &buf) {
            Ok(()) => {
                let _ = errors.send(Ok(()));
                buf.release();
                let _ = store.upload_slots.1.recv();
                return;
            }
            Err(e) => {
                try_ += 1;
                warn!("upload {}: {} (try {})", key, e, try_);
                last = Some(e);
                thread::sleep(Duration::from_secs((try_ * try_) as u64));
            }
        }
    }
    let msg = match last {
        Some(e) => format!("upload block {}: {} (after {} tries)", key, e, try_),
        None => format!("upload block {}: aborted", key),
    };
    let _ = errors.send(Err(eio!(msg)));
    buf.release();
    let _ = store.upload_slots.1.recv();
}

// Background upload of a staged block. When every upload slot is busy
// the in-memory copy is dropped and re-read from the staging file once
// a slot frees; a missing file means the chunk was removed meanwhile.
fn async_upload_block(
    store: &Arc<CachedStore>,
    key: &str,
    block: Page,
    staging_path: &Path,
    poisoned: &AtomicBool,
) {
    let block_size = block.len();
    let block = if store.upload_slots.0.try_send(()).is_ok() {
        block
    } else {
        block.release();
        store.pending_keys.lock().unwrap().insert(key.to_string());
        debug!("wait to upload {}", key);
        if store.upload_slots.0.send(()).is_err() {
            return;
        }
        match fs::read(staging_path) {
            Ok(data) => {
                store.pending_keys.lock().unwrap().remove(key);
                if data.len() != block_size {
                    error!(
                        "staging file {} is incomplete: {} < {}",
                        staging_path.display(),
                        data.len(),
                        block_size
                    );
                    let _ = store.upload_slots.1.recv();
                    return;
                }
                let mut p = Page::new_off_heap(block_size);
                p.data_mut().copy_from_slice(&data);
                p
            }
            Err(e) => {
                let pending = store.pending_keys.lock().unwrap().remove(key);
                if pending {
                    error!("read staging file {}: {}", staging_path.display(), e);
                } else {
                    debug!("{} is not needed, drop it", key);
                }
                let _ = store.upload_slots.1.recv();
                return;
            }
        }
    };

    let blen = block.len();
    let bound = store.compressor.compress_bound(blen);
    let mut buf = if bound > blen {
        Page::new_off_heap(bound)
    } else {
        block.share()
    };
    if !buf.same_memory(&block) {
        match store.compressor.compress(buf.data_mut(), block.data()) {
            Ok(n) => buf.set_len(n),
            Err(e) => {
                error!("compress block {}: {}", key, e);
                buf.release();
                block.release();
                let _ = store.upload_slots.1.recv();
                return;
            }
        }
    }
    block.release();

    let mut try_ = 0u32;
    let mut done = false;
    while !poisoned.load(Ordering::Relaxed) {
        match store.put(key, &buf) {
            Ok(()) => {
                done = true;
                break;
            }
            Err(e) => {
                warn!("upload {}: {} (tried {})", key, e, try_);
                try_ += 1;
                thread::sleep(Duration::from_secs(try_ as u64));
            }
        }
    }
    buf.release();
    if done {
        // keep the staging file for the next startup scan otherwise
        let _ = fs::remove_file(staging_path);
        store.bcache.uploaded(key, block_size);
    }
    let _ = store.upload_slots.1.recv();
}

impl Writer for WChunk {
    fn write_at(&mut self, buf: &[u8], off: u64) -> Result<usize> {
        let off = off as usize;
        if off + buf.len() > CHUNK_SIZE {
            return Err(einval!(format!(
                "write out of chunk boundary: {} > {}",
                off + buf.len(),
                CHUNK_SIZE
            )));
        }
        if off < self.uploaded {
            return Err(einval!(format!(
                "cannot overwrite uploaded block: {} < {}",
                off, self.uploaded
            )));
        }

        // pad the gap with zeros first
        if self.length < off {
            let zeros = vec![0u8; off - self.length];
            let at = self.length as u64;
            self.write_at(&zeros, at)?;
        }

        let psize = self.store.conf.page_size;
        let mut n = 0;
        while n < buf.len() {
            let pos = off + n;
            let indx = pos / psize;
            let boff = pos % psize;
            // the first block accumulates in small pages unless blocks
            // are smaller than the page unit itself
            let bs = if indx > 0 || BLOCK_SIZE > psize {
                psize
            } else {
                BLOCK_SIZE
            };
            let bi = boff / bs;
            let bo = boff % bs;
            if bi >= self.pages[indx].len() {
                let mut page = alloc_page(bs);
                page.set_len(0);
                self.pages[indx].push(page);
            }
            let page = &mut self.pages[indx][bi];
            let left = buf.len() - n;
            if bo + left > bs {
                page.set_len(bs);
            } else if page.len() < bo + left {
                page.set_len(bo + left);
            }
            let copied = (bs - bo).min(left);
            page.data_mut()[bo..bo + copied].copy_from_slice(&buf[n..n + copied]);
            n += copied;
        }
        if off + n > self.length {
            self.length = off + n;
        }
        Ok(n)
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn flush_to(&mut self, offset: usize) -> Result<()> {
        if offset < self.uploaded {
            return Err(einval!(format!(
                "invalid flush offset: {} < {}",
                offset, self.uploaded
            )));
        }
        let psize = self.store.conf.page_size;
        for i in 0..self.pages.len() {
            let start = i * psize;
            let end = start + psize;
            if start >= self.uploaded && end <= offset {
                if !self.pages[i].is_empty() {
                    self.upload(i);
                }
                self.uploaded = end;
            }
        }
        Ok(())
    }

    fn finish(&mut self, length: usize) -> Result<()> {
        if self.length != length {
            return Err(einval!(format!(
                "length mismatch: {} != {}",
                self.length, length
            )));
        }
        if length > 0 {
            let psize = self.store.conf.page_size;
            let n = (length - 1) / psize + 1;
            self.flush_to(n * psize)?;
        }
        let mut first_err = None;
        for _ in 0..self.pendings {
            match self.errors.1.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.poisoned.store(true, Ordering::Relaxed);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(eio!("upload workers exited unexpectedly"));
                    }
                }
            }
        }
        self.pendings = 0;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn abort(&mut self) {
        for pages in self.pages.iter_mut() {
            for p in pages.drain(..) {
                free_page(p);
            }
        }
    }
}

impl ChunkStore for Arc<CachedStore> {
    fn new_reader(&self, chunk_id: u64, length: usize) -> Box<dyn Reader> {
        Box::new(RChunk::new(chunk_id, length, self.clone()))
    }

    fn new_writer(&self, chunk_id: u64) -> Box<dyn Writer> {
        Box::new(WChunk::new(chunk_id, self.clone()))
    }

    fn remove(&self, chunk_id: u64, length: usize) -> Result<()> {
        RChunk::new(chunk_id, length, self.clone()).remove()
    }

    fn seekable(&self) -> bool {
        CachedStore::seekable(self)
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::AtomicUsize;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::backend::mem::MemStorage;
    use crate::backend::prefix::WithPrefix;
    use crate::chunk::DiskStore;

    fn default_conf(cache_dir: &str) -> Config {
        let mut conf = Config::default();
        conf.page_size = 1024;
        conf.cache_dir = cache_dir.to_string();
        conf.cache_size = 1 << 20;
        conf.auto_create = true;
        conf.compress = "lz4".to_string();
        conf.max_upload = 2;
        conf.get_timeout = Duration::from_secs(3);
        conf.put_timeout = Duration::from_secs(3);
        conf
    }

    // Shared round-trip harness: a write at offset 0, a write straddling
    // the first block boundary, then ranged reads of both.
    fn run_store_harness(store: &dyn ChunkStore, page_size: usize) {
        let mut writer = store.new_writer(1);
        let data = b"hello world";
        assert_eq!(writer.write_at(data, 0).unwrap(), 11);
        let offset = page_size - 3;
        assert_eq!(writer.write_at(data, offset as u64).unwrap(), 11);
        writer.flush_to(page_size + 3).unwrap();
        let size = offset + data.len();
        writer.finish(size).unwrap();

        let reader = store.new_reader(1, size);
        let ctx = Context::default();
        let mut p = Page::new(vec![0u8; 5]);
        assert_eq!(reader.read_at(&ctx, &mut p, 6).unwrap(), 5);
        assert_eq!(p.data(), b"world");
        p.release();

        let mut p = Page::new(vec![0u8; 20]);
        let n = reader.read_at(&ctx, &mut p, offset).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&p.data()[..n], b"hello world");
        p.release();

        store.remove(1, size).unwrap();
    }

    #[test]
    fn test_disk_store() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.as_path().to_str().unwrap());
        run_store_harness(&store, 1024);
    }

    #[test]
    fn test_cached_store() {
        let tmp = TempDir::new().unwrap();
        let blob: Arc<dyn ObjectStorage> = Arc::new(MemStorage::new("t"));
        let store = CachedStore::new(blob, default_conf(tmp.as_path().to_str().unwrap())).unwrap();
        run_store_harness(&store, 1024);
    }

    #[test]
    fn test_uncompressed_store() {
        let tmp = TempDir::new().unwrap();
        let blob: Arc<dyn ObjectStorage> = Arc::new(MemStorage::new("t"));
        let mut conf = default_conf(tmp.as_path().to_str().unwrap());
        conf.compress = String::new();
        conf.cache_size = 0;
        let store = CachedStore::new(blob, conf).unwrap();
        assert!(store.seekable());
        run_store_harness(&store, 1024);
    }

    #[test]
    fn test_partitioned_store() {
        let tmp = TempDir::new().unwrap();
        let blob: Arc<dyn ObjectStorage> = Arc::new(MemStorage::new("t"));
        let mut conf = default_conf(tmp.as_path().to_str().unwrap());
        conf.partitions = 10;
        let store = CachedStore::new(blob.clone(), conf).unwrap();
        run_store_harness(&store, 1024);

        // the partitioned key scheme prefixes a hex shard
        let mut writer = store.new_writer(7);
        writer.write_at(b"x", 0).unwrap();
        writer.finish(1).unwrap();
        assert!(blob.exists("chunks/07/0/7_0_1").is_ok());
        store.remove(7, 1).unwrap();
    }

    #[test]
    fn test_prefixed_store() {
        let tmp = TempDir::new().unwrap();
        let inner = Arc::new(MemStorage::new("t"));
        let blob: Arc<dyn ObjectStorage> = Arc::new(WithPrefix::new(inner, "vol1/"));
        let store = CachedStore::new(blob, default_conf(tmp.as_path().to_str().unwrap())).unwrap();
        run_store_harness(&store, 1024);
    }

    #[test]
    fn test_async_store() {
        let tmp = TempDir::new().unwrap();
        let blob: Arc<dyn ObjectStorage> = Arc::new(MemStorage::new("t"));
        let mut conf = default_conf(tmp.as_path().to_str().unwrap());
        conf.compress = String::new();
        conf.async_upload = true;
        conf.get_timeout = Duration::from_secs(5);

        // a block left staged by an earlier run
        let staged = tmp
            .as_path()
            .join("raw_staging")
            .join("chunks/0/0/123_0");
        fs::create_dir_all(staged.parent().unwrap()).unwrap();
        fs::write(&staged, b"good").unwrap();

        let store = CachedStore::new(blob.clone(), conf).unwrap();
        let mut replayed = false;
        for _ in 0..100 {
            if blob.exists("chunks/0/0/123_0_4").is_ok() {
                replayed = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(replayed, "staged block was not replayed");
        assert!(!staged.exists());

        run_store_harness(&store, 1024);
    }

    #[test]
    fn test_upload_limit() {
        let tmp = TempDir::new().unwrap();
        let blob: Arc<dyn ObjectStorage> = Arc::new(MemStorage::new("t"));
        let mut conf = default_conf(tmp.as_path().to_str().unwrap());
        conf.compress = String::new();
        conf.upload_limit = 128;
        let store = CachedStore::new(blob, conf).unwrap();

        // incompressible payload of twice the per-second budget
        let mut data = vec![0u8; 256];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let start = Instant::now();
        let mut writer = store.new_writer(1);
        writer.write_at(&data, 0).unwrap();
        writer.finish(data.len()).unwrap();
        assert!(
            start.elapsed() >= Duration::from_secs(1),
            "finished too fast: {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn test_permission_of_cached_block() {
        let tmp = TempDir::new().unwrap();
        let blob: Arc<dyn ObjectStorage> = Arc::new(MemStorage::new("t"));
        let mut conf = default_conf(tmp.as_path().to_str().unwrap());
        conf.cache_mode = 0o640;
        let store = CachedStore::new(blob, conf).unwrap();

        let mut writer = store.new_writer(1);
        writer.write_at(b"hello world", 0).unwrap();
        writer.finish(11).unwrap();
        thread::sleep(Duration::from_millis(300));

        let root = tmp.as_path();
        for dir in &["raw", "raw/chunks"] {
            let meta = fs::metadata(root.join(dir)).unwrap();
            assert!(meta.is_dir());
            assert_eq!(meta.permissions().mode() & 0o777, 0o751, "dir {}", dir);
        }
        let block = root.join("raw/chunks/0/0/1_0_11");
        let meta = fs::metadata(&block).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
    }

    #[test]
    fn test_recover_appended_object() {
        let mem = MemStorage::new("t");
        let comp = new_compressor("lz4").unwrap();

        let mut page = Page::new(vec![0u8; 2]);
        assert!(recover_appended_key(&mem, "chunks/1_0_2", comp.as_ref(), &mut page).is_err());

        let data = b"hello";
        let mut buf = vec![0u8; comp.compress_bound(data.len())];
        let n = comp.compress(&mut buf, data).unwrap();
        mem.put("chunks/1_0_5", &buf[..n]).unwrap();

        recover_appended_key(&mem, "chunks/1_0_2", comp.as_ref(), &mut page).unwrap();
        assert_eq!(page.data(), b"he");
        page.release();
    }

    #[test]
    fn test_write_contract() {
        let tmp = TempDir::new().unwrap();
        let blob: Arc<dyn ObjectStorage> = Arc::new(MemStorage::new("t"));
        let store = CachedStore::new(blob, default_conf(tmp.as_path().to_str().unwrap())).unwrap();
        let mut writer = store.new_writer(3);

        let e = writer
            .write_at(&[1u8; 10], (CHUNK_SIZE - 5) as u64)
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidInput);

        writer.write_at(b"hello", 0).unwrap();
        writer.flush_to(1024).unwrap();
        let e = writer.write_at(b"x", 100).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidInput);

        assert!(writer.finish(4).is_err());
        writer.finish(5).unwrap();
        store.remove(3, 5).unwrap();
    }

    #[test]
    fn test_zero_padding() {
        let tmp = TempDir::new().unwrap();
        let blob: Arc<dyn ObjectStorage> = Arc::new(MemStorage::new("t"));
        let store = CachedStore::new(blob, default_conf(tmp.as_path().to_str().unwrap())).unwrap();

        let mut writer = store.new_writer(4);
        writer.write_at(b"abc", 0).unwrap();
        writer.write_at(b"xyz", 100).unwrap();
        writer.finish(103).unwrap();

        let reader = store.new_reader(4, 103);
        let ctx = Context::default();
        let mut p = Page::new(vec![0u8; 10]);
        assert_eq!(reader.read_at(&ctx, &mut p, 50).unwrap(), 10);
        assert_eq!(p.data(), &[0u8; 10]);
        p.release();

        let mut p = Page::new(vec![0u8; 3]);
        assert_eq!(reader.read_at(&ctx, &mut p, 100).unwrap(), 3);
        assert_eq!(p.data(), b"xyz");
        p.release();
        store.remove(4, 103).unwrap();
    }

    // Backend wrapper counting concurrent PUTs.
    struct CountingStorage {
        inner: MemStorage,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingStorage {
        fn new() -> CountingStorage {
            CountingStorage {
                inner: MemStorage::new("t"),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl fmt::Display for CountingStorage {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "counting://")
        }
    }

    impl ObjectStorage for CountingStorage {
        fn get(&self, key: &str, off: u64, limit: i64) -> Result<Box<dyn Read + Send>> {
            self.inner.get(key, off, limit)
        }

        fn put(&self, key: &str, data: &[u8]) -> Result<()> {
            let cur = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(cur, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            let r = self.inner.put(key, data);
            self.current.fetch_sub(1, Ordering::SeqCst);
            r
        }

        fn exists(&self, key: &str) -> Result<()> {
            self.inner.exists(key)
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }

        fn list(&self, prefix: &str, marker: &str, limit: i64) -> Result<Vec<ObjInfo>> {
            self.inner.list(prefix, marker, limit)
        }
    }

    use crate::backend::ObjInfo;

    #[test]
    fn test_upload_concurrency() {
        let tmp = TempDir::new().unwrap();
        let counting = Arc::new(CountingStorage::new());
        let blob: Arc<dyn ObjectStorage> = counting.clone();
        let mut conf = default_conf(tmp.as_path().to_str().unwrap());
        conf.page_size = 256;
        conf.compress = String::new();
        conf.cache_size = 0;
        conf.max_upload = 2;
        let store = CachedStore::new(blob, conf).unwrap();

        let mut writer = store.new_writer(5);
        writer.write_at(&[7u8; 2048], 0).unwrap();
        writer.finish(2048).unwrap();

        let peak = counting.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak concurrent uploads: {}", peak);
    }

    #[test]
    fn test_seekable() {
        let tmp = TempDir::new().unwrap();
        let blob: Arc<dyn ObjectStorage> = Arc::new(MemStorage::new("t"));
        let mut conf = default_conf(tmp.as_path().to_str().unwrap());
        conf.compress = String::new();
        let store = CachedStore::new(blob.clone(), conf).unwrap();
        assert!(store.seekable());

        let tmp2 = TempDir::new().unwrap();
        let store = CachedStore::new(blob, default_conf(tmp2.as_path().to_str().unwrap())).unwrap();
        assert!(!store.seekable());
    }

    #[test]
    fn test_parse_origin_size() {
        assert_eq!(parse_origin_size("chunks/0/0/1_0_1024"), 1024);
        assert_eq!(parse_origin_size("chunks/0/0/1_0"), 0);
        assert_eq!(parse_origin_size("no-underscore"), 0);
    }

    #[test]
    fn test_config_from_json() {
        let v: serde_json::Value = serde_json::from_str(
            r#"{
                "cache_dir": "/var/cache/silofs",
                "cache_size": 1048576,
                "compress": "lz4",
                "max_upload": 8,
                "get_timeout": {"secs": 30, "nanos": 0}
            }"#,
        )
        .unwrap();
        let conf = Config::from_value(v).unwrap();
        assert_eq!(conf.cache_dir, "/var/cache/silofs");
        assert_eq!(conf.cache_size, 1048576);
        assert_eq!(conf.compress, "lz4");
        assert_eq!(conf.max_upload, 8);
        assert_eq!(conf.get_timeout, Duration::from_secs(30));
        // untouched fields keep their defaults
        assert_eq!(conf.page_size, 4 << 20);

        assert!(Config::from_value(serde_json::json!({"cache_size": "a lot"})).is_err());
    }
}
