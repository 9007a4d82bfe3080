// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Chunked object storage with a two-tier cache.
//!
//! A chunk is a fixed 64 MiB unit of file data identified by a 64-bit id
//! assigned by the metadata service. Chunks are split into blocks of up
//! to `Config::page_size` bytes; a block is what travels between this
//! engine, the local disk cache and the object store. The [`ChunkStore`]
//! trait is the surface consumed by the VFS layer.

mod cached_store;
mod disk_cache;
mod disk_store;
mod group_cache;
mod page;
mod prefetch;
mod singleflight;

pub use self::cached_store::{CachedStore, Config};
pub use self::disk_store::DiskStore;
pub use self::page::{Page, PageReader};
pub use self::singleflight::Group;

use std::io::Result;

/// Size of a logical chunk.
pub const CHUNK_SIZE: usize = 1 << 26; // 64 MiB

/// Allocation unit for write buffers and the page pool.
pub const BLOCK_SIZE: usize = 1 << 16; // 64 KiB

/// Request context forwarded from the VFS layer. The inode and process
/// group only salt the group-cache key so reads of hot blocks spread
/// over the peer group; they never change the stored object.
#[derive(Clone, Copy, Debug, Default)]
pub struct Context {
    pub inode: Option<u64>,
    pub group: Option<u64>,
}

/// Read access to one chunk of known length.
pub trait Reader: Send + Sync {
    /// Read into `page` starting at `off` within the chunk. Returns the
    /// number of bytes read; zero means end of chunk.
    fn read_at(&self, ctx: &Context, page: &mut Page, off: usize) -> Result<usize>;
}

/// Write access to one chunk. Calls are serialized by the caller.
pub trait Writer: Send {
    fn write_at(&mut self, buf: &[u8], off: u64) -> Result<usize>;
    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
    /// Upload every block fully below `offset`. Offsets must not go
    /// backwards across calls.
    fn flush_to(&mut self, offset: usize) -> Result<()>;
    /// Flush the remaining blocks and surface the first upload error.
    fn finish(&mut self, length: usize) -> Result<()>;
    /// Drop all buffered data without uploading.
    fn abort(&mut self);
}

/// A store of chunks addressed by `(chunk_id, length)`.
pub trait ChunkStore: Send + Sync {
    fn new_reader(&self, chunk_id: u64, length: usize) -> Box<dyn Reader>;
    fn new_writer(&self, chunk_id: u64) -> Box<dyn Writer>;
    fn remove(&self, chunk_id: u64, length: usize) -> Result<()>;
    /// Whether ranged reads can be served directly from the backend.
    fn seekable(&self) -> bool;
}
