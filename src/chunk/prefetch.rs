// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Best-effort background fetching of block keys.
//!
//! Keys are pushed onto a small bounded queue; when the queue is full
//! the key is dropped, prefetching never blocks the read path. Worker
//! threads dedupe against a busy set so a key already being fetched is
//! skipped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Sender};

pub(crate) struct Prefetcher {
    pending: Sender<String>,
    busy: Arc<Mutex<HashSet<String>>>,
}

impl Prefetcher {
    pub fn new(parallel: usize, op: Arc<dyn Fn(&str) + Send + Sync>) -> Prefetcher {
        let (tx, rx) = bounded::<String>(10);
        let busy = Arc::new(Mutex::new(HashSet::new()));
        for num in 0..parallel {
            let rx = rx.clone();
            let busy = busy.clone();
            let op = op.clone();
            let _ = thread::Builder::new()
                .name(format!("prefetch_thread_{}", num))
                .spawn(move || {
                    while let Ok(key) = rx.recv() {
                        if !busy.lock().unwrap().insert(key.clone()) {
                            continue;
                        }
                        op(&key);
                        busy.lock().unwrap().remove(&key);
                    }
                });
        }
        Prefetcher { pending: tx, busy }
    }

    /// Queue `key` for background fetching, dropping it when the queue
    /// is full.
    pub fn fetch(&self, key: &str) {
        let _ = self.pending.try_send(key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_bounded_queue() {
        let fetched = Arc::new(AtomicUsize::new(0));
        let counter = fetched.clone();
        let p = Prefetcher::new(
            1,
            Arc::new(move |_key: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
            }),
        );
        for i in 0..100 {
            p.fetch(&format!("chunks/0/0/{}_0_100", i));
        }
        thread::sleep(Duration::from_millis(500));
        let n = fetched.load(Ordering::SeqCst);
        // one in flight plus at most ten queued, the rest was dropped
        assert!(n >= 1 && n <= 11, "fetched {} keys", n);
        assert!(p.busy.lock().unwrap().len() <= 1);
    }

    #[test]
    fn test_no_workers() {
        let p = Prefetcher::new(0, Arc::new(|_key: &str| {}));
        for _ in 0..20 {
            p.fetch("chunks/0/0/1_0_100");
        }
    }
}
