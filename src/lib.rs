// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Silofs storage engine.
//!
//! Files are decomposed into fixed-size chunks and chunks into blocks;
//! blocks are the unit transferred to and from the object store and the
//! unit of local caching. The engine sits between the VFS layer, which
//! issues per-file reads and writes at offsets, and an object-storage
//! backend offering only whole-object PUT, ranged GET and DELETE. Reads
//! go through an in-memory group cache and an on-disk block cache before
//! hitting the backend; concurrent misses on the same block are served
//! by a single download. Writes are split into blocks and uploaded
//! either synchronously or through an on-disk staging area.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate silofs_utils;

pub mod backend;
pub mod chunk;
