// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Object storage over a local directory tree; keys map to file paths.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Result, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{ObjInfo, ObjectStorage};

pub struct LocalFs {
    dir: PathBuf,
}

impl LocalFs {
    pub fn new(dir: &str) -> LocalFs {
        LocalFs {
            dir: PathBuf::from(dir),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key.trim_start_matches('/'))
    }

    fn collect(
        &self,
        dir: &Path,
        prefix: &str,
        marker: &str,
        limit: i64,
        out: &mut Vec<ObjInfo>,
    ) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        let mut names: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        names.sort();
        for path in names {
            if limit > 0 && out.len() >= limit as usize {
                break;
            }
            let meta = match fs::metadata(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.is_dir() {
                self.collect(&path, prefix, marker, limit, out)?;
                continue;
            }
            let key = match path.strip_prefix(&self.dir) {
                Ok(k) => k.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            if key.starts_with(prefix) && key.as_str() > marker {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                out.push(ObjInfo {
                    key,
                    size: meta.len(),
                    mtime,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for LocalFs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "file://{}", self.dir.display())
    }
}

impl ObjectStorage for LocalFs {
    fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
    }

    fn get(&self, key: &str, off: u64, limit: i64) -> Result<Box<dyn Read + Send>> {
        let mut f = File::open(self.path(key))?;
        if off > 0 {
            f.seek(SeekFrom::Start(off))?;
        }
        if limit >= 0 {
            let mut buf = vec![0u8; limit as usize];
            let mut n = 0;
            while n < buf.len() {
                let m = f.read(&mut buf[n..])?;
                if m == 0 {
                    break;
                }
                n += m;
            }
            buf.truncate(n);
            return Ok(Box::new(Cursor::new(buf)));
        }
        Ok(Box::new(f))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        f.write_all(data)
    }

    fn exists(&self, key: &str) -> Result<()> {
        fs::metadata(self.path(key)).map(|_| ())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list(&self, prefix: &str, marker: &str, limit: i64) -> Result<Vec<ObjInfo>> {
        let mut out = Vec::new();
        let root = self.dir.clone();
        self.collect(&root, prefix, marker, limit, &mut out)?;
        out.sort_by(|a, b| a.key.cmp(&b.key));
        if limit > 0 {
            out.truncate(limit as usize);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    #[test]
    fn test_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let s = LocalFs::new(tmp.as_path().to_str().unwrap());
        s.put("chunks/0/0/1_0_5", b"hello").unwrap();
        assert!(s.exists("chunks/0/0/1_0_5").is_ok());

        let mut r = s.get("chunks/0/0/1_0_5", 1, 3).unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(&buf, b"ell");

        s.put("chunks/0/0/1_1_5", b"world").unwrap();
        let objs = s.list("chunks/0/0/1_", "", 10).unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0].key, "chunks/0/0/1_0_5");
        assert_eq!(objs[0].size, 5);

        s.delete("chunks/0/0/1_0_5").unwrap();
        assert!(s.exists("chunks/0/0/1_0_5").is_err());
        // deleting a missing object is not an error
        s.delete("chunks/0/0/1_0_5").unwrap();
    }
}
