// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A trivial chunk store keeping whole chunks as local files; useful
//! without an object-storage backend and as a baseline in tests.

use std::fs::{self, File, OpenOptions};
use std::io::Result;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use super::page::Page;
use super::{ChunkStore, Context, Reader, Writer};

pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(dir: &str) -> DiskStore {
        let root = PathBuf::from(dir);
        if !root.is_dir() {
            if let Err(e) = fs::create_dir_all(&root) {
                warn!("create chunk dir {}: {}", root.display(), e);
            }
        }
        DiskStore { root }
    }

    fn chunk_path(&self, chunk_id: u64) -> PathBuf {
        self.root.join(format!("{}.chunk", chunk_id))
    }
}

struct DiskFile {
    id: u64,
    path: PathBuf,
}

impl DiskFile {
    fn size(&self) -> usize {
        fs::metadata(&self.path).map(|m| m.len() as usize).unwrap_or(0)
    }
}

impl Reader for DiskFile {
    fn read_at(&self, _ctx: &Context, page: &mut Page, off: usize) -> Result<usize> {
        let f = File::open(&self.path)?;
        let size = f.metadata()?.len() as usize;
        if off >= size {
            return Ok(0);
        }
        let want = page.len().min(size - off);
        let buf = &mut page.data_mut()[..want];
        let mut read = 0;
        while read < want {
            let n = f.read_at(&mut buf[read..], (off + read) as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }
}

impl Writer for DiskFile {
    fn write_at(&mut self, buf: &[u8], off: u64) -> Result<usize> {
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)?;
        f.write_all_at(buf, off)?;
        Ok(buf.len())
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn flush_to(&mut self, _offset: usize) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, length: usize) -> Result<()> {
        let size = self.size();
        if size < length {
            return Err(einval!(format!("data length mismatch: {} != {}", size, length)));
        }
        Ok(())
    }

    fn abort(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl ChunkStore for DiskStore {
    fn new_reader(&self, chunk_id: u64, _length: usize) -> Box<dyn Reader> {
        Box::new(DiskFile {
            id: chunk_id,
            path: self.chunk_path(chunk_id),
        })
    }

    fn new_writer(&self, chunk_id: u64) -> Box<dyn Writer> {
        Box::new(DiskFile {
            id: chunk_id,
            path: self.chunk_path(chunk_id),
        })
    }

    fn remove(&self, chunk_id: u64, _length: usize) -> Result<()> {
        fs::remove_file(self.chunk_path(chunk_id))
    }

    fn seekable(&self) -> bool {
        true
    }
}
