// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A wrapper prepending a fixed prefix to every object key, so several
//! stores can share one bucket.

use std::fmt;
use std::io::{Read, Result};
use std::sync::Arc;

use super::{ObjInfo, ObjectStorage};

pub struct WithPrefix {
    inner: Arc<dyn ObjectStorage>,
    prefix: String,
}

impl WithPrefix {
    pub fn new(inner: Arc<dyn ObjectStorage>, prefix: &str) -> WithPrefix {
        WithPrefix {
            inner,
            prefix: prefix.to_string(),
        }
    }
}

impl fmt::Display for WithPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.inner, self.prefix)
    }
}

impl ObjectStorage for WithPrefix {
    fn create(&self) -> Result<()> {
        self.inner.create()
    }

    fn get(&self, key: &str, off: u64, limit: i64) -> Result<Box<dyn Read + Send>> {
        self.inner.get(&format!("{}{}", self.prefix, key), off, limit)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner.put(&format!("{}{}", self.prefix, key), data)
    }

    fn exists(&self, key: &str) -> Result<()> {
        self.inner.exists(&format!("{}{}", self.prefix, key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&format!("{}{}", self.prefix, key))
    }

    fn list(&self, prefix: &str, marker: &str, limit: i64) -> Result<Vec<ObjInfo>> {
        let marker = if marker.is_empty() {
            String::new()
        } else {
            format!("{}{}", self.prefix, marker)
        };
        let objs = self
            .inner
            .list(&format!("{}{}", self.prefix, prefix), &marker, limit)?;
        Ok(objs
            .into_iter()
            .map(|mut o| {
                o.key = o.key[self.prefix.len()..].to_string();
                o
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::mem::MemStorage;
    use super::*;

    #[test]
    fn test_prefixed_keys() {
        let inner = Arc::new(MemStorage::new("t"));
        let p = WithPrefix::new(inner.clone(), "vol1/");
        p.put("chunks/0/0/1_0_5", b"hello").unwrap();
        assert!(inner.exists("vol1/chunks/0/0/1_0_5").is_ok());
        assert!(p.exists("chunks/0/0/1_0_5").is_ok());
        let objs = p.list("chunks/", "", 10).unwrap();
        assert_eq!(objs[0].key, "chunks/0/0/1_0_5");
        p.delete("chunks/0/0/1_0_5").unwrap();
        assert!(inner.exists("vol1/chunks/0/0/1_0_5").is_err());
    }
}
