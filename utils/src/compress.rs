// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Block compression for uploaded objects.
//!
//! Blocks are compressed into caller-provided buffers sized by
//! `compress_bound`, so the hot path never allocates inside the codec.
//! The `none` algorithm is a pass-through whose bound equals the input
//! length; seekable backends are detected through that property.

use std::io;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::eio;

/// A block codec working on whole buffers.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &'static str;
    /// Upper bound of the compressed size for `len` input bytes.
    fn compress_bound(&self, len: usize) -> usize;
    /// Compress `src` into `dst`, returning the number of bytes written.
    fn compress(&self, dst: &mut [u8], src: &[u8]) -> io::Result<usize>;
    /// Decompress `src` into `dst`, returning the number of bytes written.
    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> io::Result<usize>;
}

/// Look up a codec by its configured name. Empty string and "none"
/// select the pass-through codec.
pub fn new_compressor(algr: &str) -> Option<Arc<dyn Compressor>> {
    match algr.to_lowercase().as_str() {
        "" | "none" => Some(Arc::new(NoOp)),
        "lz4" => Some(Arc::new(Lz4)),
        "gzip" | "zlib" => Some(Arc::new(Gzip)),
        _ => None,
    }
}

struct NoOp;

impl Compressor for NoOp {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress_bound(&self, len: usize) -> usize {
        len
    }

    fn compress(&self, dst: &mut [u8], src: &[u8]) -> io::Result<usize> {
        if dst.len() < src.len() {
            return Err(eio!(format!(
                "buffer too short: {} < {}",
                dst.len(),
                src.len()
            )));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> io::Result<usize> {
        if dst.len() < src.len() {
            return Err(eio!(format!(
                "buffer too short: {} < {}",
                dst.len(),
                src.len()
            )));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }
}

struct Lz4;

impl Compressor for Lz4 {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress_bound(&self, len: usize) -> usize {
        unsafe { lz4_sys::LZ4_compressBound(len as c_int) as usize }
    }

    fn compress(&self, dst: &mut [u8], src: &[u8]) -> io::Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let n = unsafe {
            lz4_sys::LZ4_compress_default(
                src.as_ptr() as *const c_char,
                dst.as_mut_ptr() as *mut c_char,
                src.len() as c_int,
                dst.len() as c_int,
            )
        };
        if n <= 0 {
            return Err(eio!(format!("lz4 compress failed: {}", n)));
        }
        Ok(n as usize)
    }

    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> io::Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let n = unsafe {
            lz4_sys::LZ4_decompress_safe(
                src.as_ptr() as *const c_char,
                dst.as_mut_ptr() as *mut c_char,
                src.len() as c_int,
                dst.len() as c_int,
            )
        };
        if n < 0 {
            return Err(eio!(format!("lz4 decompress failed: {}", n)));
        }
        Ok(n as usize)
    }
}

struct Gzip;

impl Compressor for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress_bound(&self, len: usize) -> usize {
        // deflate worst case plus the zlib wrapper
        len + (len >> 9) + 64
    }

    fn compress(&self, dst: &mut [u8], src: &[u8]) -> io::Result<usize> {
        let mut c = Compress::new(Compression::fast(), true);
        match c.compress(src, dst, FlushCompress::Finish) {
            Ok(Status::StreamEnd) => Ok(c.total_out() as usize),
            Ok(_) => Err(eio!(format!("buffer too short: {}", dst.len()))),
            Err(e) => Err(eio!(format!("gzip compress failed: {}", e))),
        }
    }

    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> io::Result<usize> {
        let mut d = Decompress::new(true);
        match d.decompress(src, dst, FlushDecompress::Finish) {
            Ok(Status::StreamEnd) => Ok(d.total_out() as usize),
            Ok(_) => Err(eio!(format!("buffer too short: {}", dst.len()))),
            Err(e) => Err(eio!(format!("gzip decompress failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_codec(name: &str) {
        let c = new_compressor(name).unwrap();
        let src = b"hello world, hello world, hello world";
        let mut buf = vec![0u8; c.compress_bound(src.len())];
        let n = c.compress(&mut buf, src).unwrap();
        assert!(n > 0);
        let mut out = vec![0u8; src.len()];
        let m = c.decompress(&mut out, &buf[..n]).unwrap();
        assert_eq!(m, src.len());
        assert_eq!(&out[..m], &src[..]);
    }

    #[test]
    fn test_roundtrip() {
        check_codec("none");
        check_codec("lz4");
        check_codec("gzip");
    }

    #[test]
    fn test_seekable_property() {
        // only the pass-through codec has a zero bound for empty input
        assert_eq!(new_compressor("none").unwrap().compress_bound(0), 0);
        assert!(new_compressor("lz4").unwrap().compress_bound(0) > 0);
        assert!(new_compressor("gzip").unwrap().compress_bound(0) > 0);
    }

    #[test]
    fn test_short_buffer() {
        let c = new_compressor("none").unwrap();
        let mut buf = vec![0u8; 2];
        assert!(c.compress(&mut buf, b"hello").is_err());
    }

    #[test]
    fn test_unknown_algorithm() {
        assert!(new_compressor("snappy").is_none());
    }
}
