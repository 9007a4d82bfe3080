// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory object storage, the mock backend for tests and benchmarks.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read, Result};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{ObjInfo, ObjectStorage};

pub struct MemStorage {
    name: String,
    objects: Mutex<BTreeMap<String, Arc<Vec<u8>>>>,
}

impl MemStorage {
    pub fn new(name: &str) -> MemStorage {
        MemStorage {
            name: name.to_string(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }
}

impl fmt::Display for MemStorage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "mem://{}", self.name)
    }
}

impl ObjectStorage for MemStorage {
    fn get(&self, key: &str, off: u64, limit: i64) -> Result<Box<dyn Read + Send>> {
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(key)
            .ok_or_else(|| enoent!(format!("object {} not found", key)))?;
        let off = off as usize;
        if off > data.len() {
            return Err(einval!(format!(
                "offset {} beyond object {} of {} bytes",
                off,
                key,
                data.len()
            )));
        }
        let end = if limit >= 0 {
            (off + limit as usize).min(data.len())
        } else {
            data.len()
        };
        Ok(Box::new(Cursor::new(data[off..end].to_vec())))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Arc::new(data.to_vec()));
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<()> {
        if self.objects.lock().unwrap().contains_key(key) {
            Ok(())
        } else {
            Err(enoent!(format!("object {} not found", key)))
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str, marker: &str, limit: i64) -> Result<Vec<ObjInfo>> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let objects = self.objects.lock().unwrap();
        let mut out = Vec::new();
        for (key, data) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if key.as_str() <= marker {
                continue;
            }
            out.push(ObjInfo {
                key: key.clone(),
                size: data.len() as u64,
                mtime: now,
            });
            if limit > 0 && out.len() == limit as usize {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let s = MemStorage::new("t");
        s.put("a/b/1", b"hello").unwrap();
        assert!(s.exists("a/b/1").is_ok());
        let mut r = s.get("a/b/1", 1, 3).unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(&buf, b"ell");
        s.delete("a/b/1").unwrap();
        assert!(s.exists("a/b/1").is_err());
        assert!(s.get("a/b/1", 0, -1).is_err());
    }

    #[test]
    fn test_list() {
        let s = MemStorage::new("t");
        for k in &["a/1", "a/2", "a/3", "b/1"] {
            s.put(k, b"x").unwrap();
        }
        let objs = s.list("a/", "", 10).unwrap();
        assert_eq!(objs.len(), 3);
        assert_eq!(objs[0].key, "a/1");
        let objs = s.list("a/", "a/1", 10).unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0].key, "a/2");
        let objs = s.list("a/", "", 1).unwrap();
        assert_eq!(objs.len(), 1);
    }
}
