// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Duplicate suppression for block downloads.
//!
//! All concurrent callers of [`Group::execute`] with the same key share
//! one producer run: the first caller executes the closure, everyone
//! else blocks and receives a reference onto the same result page. The
//! call entry holds one guard reference on the page which the last
//! departing participant drops, so a result stays alive until every
//! waiter had a chance to grab its own reference.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use super::page::Page;

struct CallState {
    done: bool,
    page: Option<Page>,
    err: Option<(io::ErrorKind, String)>,
}

struct Call {
    state: Mutex<CallState>,
    cond: Condvar,
    // participants still inside execute(); mutated under the group lock
    refs: AtomicI32,
}

impl Call {
    fn new() -> Arc<Call> {
        Arc::new(Call {
            state: Mutex::new(CallState {
                done: false,
                page: None,
                err: None,
            }),
            cond: Condvar::new(),
            refs: AtomicI32::new(1),
        })
    }

    // Drop the guard reference once the last participant leaves.
    fn leave(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(p) = self.state.lock().unwrap().page.take() {
                p.release();
            }
        }
    }
}

/// A namespace of keyed calls with duplicate suppression.
pub struct Group {
    calls: Mutex<HashMap<String, Arc<Call>>>,
}

impl Default for Group {
    fn default() -> Group {
        Group::new()
    }
}

impl Group {
    pub fn new() -> Group {
        Group {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key`, making sure at most one execution is in
    /// flight per key. Duplicate callers wait for the original and get
    /// a live reference onto the same page.
    pub fn execute<F>(&self, key: &str, f: F) -> io::Result<Page>
    where
        F: FnOnce() -> io::Result<Page>,
    {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            if let Some(c) = calls.get(key) {
                let c = c.clone();
                c.refs.fetch_add(1, Ordering::SeqCst);
                drop(calls);

                let mut st = c.state.lock().unwrap();
                while !st.done {
                    st = c.cond.wait(st).unwrap();
                }
                let res = match (&st.page, &st.err) {
                    (Some(p), None) => Ok(p.share()),
                    (_, Some((kind, msg))) => Err(io::Error::new(*kind, msg.clone())),
                    _ => Err(eio!("single-flight call finished without a result")),
                };
                drop(st);

                let _calls = self.calls.lock().unwrap();
                c.leave();
                return res;
            }
            let c = Call::new();
            calls.insert(key.to_string(), c.clone());
            c
        };

        let result = f();
        {
            let mut st = call.state.lock().unwrap();
            match &result {
                // guard reference kept for late waiters
                Ok(p) => st.page = Some(p.share()),
                Err(e) => st.err = Some((e.kind(), e.to_string())),
            }
            st.done = true;
            call.cond.notify_all();
        }

        let mut calls = self.calls.lock().unwrap();
        call.leave();
        calls.remove(key);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_duplicate_suppression() {
        let group = Arc::new(Group::new());
        let produced = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(1000));

        let mut handles = Vec::new();
        for i in 0..1000 {
            let group = group.clone();
            let produced = produced.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let key = format!("{}", i / 10);
                let page = group
                    .execute(&key, || {
                        produced.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        Ok(Page::new_off_heap(100))
                    })
                    .unwrap();
                assert!(page.is_live());
                assert_eq!(page.len(), 100);
                page.release();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // one producer per distinct key
        assert_eq!(produced.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_error_propagation() {
        let group = Group::new();
        let err = group
            .execute("k", || Err(enoent!("no such block")))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        // the failed call was removed from the table, a retry re-runs
        let page = group.execute("k", || Ok(Page::new_off_heap(1))).unwrap();
        page.release();
    }
}
