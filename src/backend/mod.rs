// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The object-storage capability consumed by the chunk store.
//!
//! Backends only need whole-object PUT, ranged GET, DELETE, existence
//! checks and prefix listing. Production drivers live outside this
//! crate; the bundled `mem` and `file` drivers back tests and
//! single-node deployments.

pub mod localfs;
pub mod mem;
pub mod prefix;

use std::fmt::Display;
use std::io::{Read, Result};
use std::sync::Arc;

/// Metadata of one stored object.
#[derive(Clone, Debug)]
pub struct ObjInfo {
    pub key: String,
    pub size: u64,
    pub mtime: i64,
}

/// Minimal object-store surface. The `Display` identity names the
/// backend in logs and lets the store detect re-encoding wrappers.
pub trait ObjectStorage: Display + Send + Sync {
    /// Create the backing bucket or directory if needed.
    fn create(&self) -> Result<()> {
        Ok(())
    }
    /// Open a read stream at `off`; a negative `limit` reads to the end.
    fn get(&self, key: &str, off: u64, limit: i64) -> Result<Box<dyn Read + Send>>;
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    fn exists(&self, key: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Objects with `prefix` whose key sorts after `marker`, up to
    /// `limit` entries, in key order.
    fn list(&self, prefix: &str, marker: &str, limit: i64) -> Result<Vec<ObjInfo>>;
}

/// Build a backend from a URI such as `mem://name` or `file:///path`.
pub fn create_storage(uri: &str) -> Result<Arc<dyn ObjectStorage>> {
    if let Some(name) = uri.strip_prefix("mem://") {
        Ok(Arc::new(mem::MemStorage::new(name)))
    } else if let Some(dir) = uri.strip_prefix("file://") {
        Ok(Arc::new(localfs::LocalFs::new(dir)))
    } else {
        Err(einval!(format!("invalid storage uri: {}", uri)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_storage() {
        let s = create_storage("mem://unit").unwrap();
        assert_eq!(s.to_string(), "mem://unit");
        assert!(create_storage("s3://bucket").is_err());
    }
}
