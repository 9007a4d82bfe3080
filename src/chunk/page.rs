// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted byte buffers backing block reads and writes.
//!
//! A [`Page`] is a handle onto refcounted memory. `acquire`/`release`
//! track the number of live holders; when the count drops to zero the
//! backing buffer is freed immediately, or returned to a small pool when
//! it has the standard 64 KiB size. A slice shares its parent's refcount
//! and holds one additional reference. Releasing below zero is a fatal
//! refcounting bug and panics.

use std::cell::UnsafeCell;
use std::env;
use std::io::{Read, Result};
use std::slice;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use super::BLOCK_SIZE;

lazy_static! {
    static ref OFF_HEAP: bool = env::var("SILOFS_OFFHEAP").map(|v| !v.is_empty()).unwrap_or(false);
    static ref PAGE_POOL: (Sender<Page>, Receiver<Page>) = bounded(128);
}

enum Buf {
    Heap(Box<[u8]>),
    Raw { ptr: *mut u8, cap: usize },
}

impl Buf {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Buf::Heap(b) => b.as_ptr(),
            Buf::Raw { ptr, .. } => *ptr as *const u8,
        }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Buf::Heap(b) => b.as_mut_ptr(),
            Buf::Raw { ptr, .. } => *ptr,
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Buf::Heap(b) => b.len(),
            Buf::Raw { cap, .. } => *cap,
        }
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        if let Buf::Raw { ptr, .. } = self {
            unsafe { libc::free(*ptr as *mut libc::c_void) };
        }
    }
}

struct PageMem {
    refs: AtomicI32,
    buf: UnsafeCell<Option<Buf>>,
}

// Safe because access to `buf` is gated by the refcount protocol: the
// buffer is only taken out when the count reaches zero, at which point
// no holder may touch the data anymore.
unsafe impl Send for PageMem {}
unsafe impl Sync for PageMem {}

impl PageMem {
    fn capacity(&self) -> usize {
        unsafe { (*self.buf.get()).as_ref().map(|b| b.capacity()).unwrap_or(0) }
    }
}

/// A handle onto refcounted block memory; see the module docs for the
/// ownership protocol.
pub struct Page {
    mem: Arc<PageMem>,
    off: usize,
    len: usize,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("off", &self.off)
            .field("len", &self.len)
            .finish()
    }
}

impl Page {
    /// Wrap an existing buffer into a page with an initial refcount of 1.
    pub fn new(data: Vec<u8>) -> Page {
        let len = data.len();
        Page {
            mem: Arc::new(PageMem {
                refs: AtomicI32::new(1),
                buf: UnsafeCell::new(Some(Buf::Heap(data.into_boxed_slice()))),
            }),
            off: 0,
            len,
        }
    }

    /// Allocate a zeroed page of `size` bytes, outside the Rust heap
    /// when SILOFS_OFFHEAP is set in the environment.
    pub fn new_off_heap(size: usize) -> Page {
        let buf = if *OFF_HEAP && size > 0 {
            let mut ptr = unsafe { libc::calloc(size, 1) as *mut u8 };
            while ptr.is_null() {
                thread::sleep(Duration::from_millis(1));
                ptr = unsafe { libc::calloc(size, 1) as *mut u8 };
            }
            Buf::Raw { ptr, cap: size }
        } else {
            Buf::Heap(vec![0u8; size].into_boxed_slice())
        };
        Page {
            mem: Arc::new(PageMem {
                refs: AtomicI32::new(1),
                buf: UnsafeCell::new(Some(buf)),
            }),
            off: 0,
            len: size,
        }
    }

    /// Add one reference on behalf of the current holder.
    pub fn acquire(&self) {
        let prev = self.mem.refs.fetch_add(1, Ordering::SeqCst);
        assert!(prev > 0, "acquire on a released page");
    }

    /// Drop one reference; the last release frees the backing memory.
    pub fn release(&self) {
        let prev = self.mem.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "invalid refcount: released {} times too many", 1 - prev);
        if prev == 1 {
            // Safe because the count just hit zero, so no other holder
            // may access the buffer anymore.
            unsafe { *self.mem.buf.get() = None };
        }
    }

    /// Whether the backing memory is still held by anyone.
    pub fn is_live(&self) -> bool {
        self.mem.refs.load(Ordering::SeqCst) > 0
    }

    /// A new handle onto the same memory, holding its own reference.
    pub fn share(&self) -> Page {
        self.acquire();
        Page {
            mem: self.mem.clone(),
            off: self.off,
            len: self.len,
        }
    }

    /// A sub-range sharing the parent's refcount with one extra
    /// reference; releasing the slice decrements the shared count.
    pub fn slice(&self, off: usize, len: usize) -> Page {
        assert!(off + len <= self.len, "slice out of bounds");
        self.acquire();
        Page {
            mem: self.mem.clone(),
            off: self.off + off,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity of the backing buffer, zero once released.
    pub fn capacity(&self) -> usize {
        self.mem.capacity()
    }

    /// Shrink or grow the visible range, within the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(self.off + len <= self.mem.capacity(), "length out of bounds");
        self.len = len;
    }

    /// Whether two handles refer to the same backing memory.
    pub fn same_memory(&self, other: &Page) -> bool {
        Arc::ptr_eq(&self.mem, &other.mem)
    }

    pub fn data(&self) -> &[u8] {
        unsafe {
            let buf = (*self.mem.buf.get())
                .as_ref()
                .expect("access to a released page");
            slice::from_raw_parts(buf.as_ptr().add(self.off), self.len)
        }
    }

    /// Mutable view of the page. The caller must be the only writer;
    /// concurrent readers of other ranges are fine because slices never
    /// overlap a range being filled.
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe {
            let buf = (*self.mem.buf.get())
                .as_mut()
                .expect("access to a released page");
            slice::from_raw_parts_mut(buf.as_mut_ptr().add(self.off), self.len)
        }
    }
}

/// Pop a pooled page for the standard size, allocate otherwise.
pub(crate) fn alloc_page(size: usize) -> Page {
    if size != BLOCK_SIZE {
        return Page::new_off_heap(size);
    }
    match PAGE_POOL.1.try_recv() {
        Ok(p) => p,
        Err(_) => Page::new_off_heap(BLOCK_SIZE),
    }
}

/// Recycle a page. Only exclusively-held full-size buffers are pooled;
/// everything else is released.
pub(crate) fn free_page(p: Page) {
    if p.off != 0
        || p.capacity() != BLOCK_SIZE
        || p.mem.refs.load(Ordering::SeqCst) != 1
    {
        p.release();
        return;
    }
    let mut p = p;
    p.set_len(BLOCK_SIZE);
    if let Err(e) = PAGE_POOL.0.try_send(p) {
        e.into_inner().release();
    }
}

/// Sequential and positional reads over a shared page.
pub struct PageReader {
    page: Option<Page>,
    off: usize,
}

impl PageReader {
    pub fn new(p: &Page) -> PageReader {
        PageReader {
            page: Some(p.share()),
            off: 0,
        }
    }

    pub fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        let page = self
            .page
            .as_ref()
            .ok_or_else(|| einval!("read from a closed page reader"))?;
        if off >= page.len() {
            return Ok(0);
        }
        let data = page.data();
        let n = buf.len().min(data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    pub fn close(&mut self) {
        if let Some(p) = self.page.take() {
            p.release();
        }
    }
}

impl Read for PageReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(buf, self.off)?;
        self.off += n;
        Ok(n)
    }
}

impl Drop for PageReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcount() {
        let p1 = Page::new_off_heap(1);
        assert_eq!(p1.len(), 1);
        assert_eq!(p1.capacity(), 1);
        p1.acquire();
        p1.release();
        assert!(p1.is_live());

        let p2 = p1.slice(0, 1);
        p1.release();
        assert!(p1.is_live());

        p2.release();
        assert!(!p2.is_live());
        assert!(!p1.is_live());
    }

    #[test]
    #[should_panic(expected = "invalid refcount")]
    fn test_double_release() {
        let p = Page::new_off_heap(8);
        p.release();
        p.release();
    }

    #[test]
    fn test_slice_shares_memory() {
        let mut p = Page::new(b"hello world".to_vec());
        let s = p.slice(6, 5);
        assert_eq!(s.data(), b"world");
        assert!(s.same_memory(&p));
        p.data_mut()[6] = b'W';
        assert_eq!(s.data(), b"World");
        s.release();
        p.release();
    }

    #[test]
    fn test_pool_roundtrip() {
        let p = alloc_page(BLOCK_SIZE);
        assert_eq!(p.len(), BLOCK_SIZE);
        free_page(p);
        let q = alloc_page(BLOCK_SIZE);
        assert!(q.is_live());
        assert_eq!(q.len(), BLOCK_SIZE);
        q.release();

        let odd = alloc_page(100);
        assert_eq!(odd.len(), 100);
        free_page(odd);
    }

    #[test]
    fn test_page_reader() {
        let p = Page::new(b"hello".to_vec());
        let mut r = PageReader::new(&p);
        p.release();

        assert_eq!(r.read(&mut []).unwrap(), 0);
        let mut buf = [0u8; 3];
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(r.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(r.read_at(&mut buf, 4).unwrap(), 1);
        assert_eq!(r.read_at(&mut buf, 5).unwrap(), 0);
        r.close();
        assert!(r.read_at(&mut buf, 0).is_err());
    }
}
