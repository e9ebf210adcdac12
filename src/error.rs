// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

//  Permission is hereby granted, free of charge, to any person obtaining a
//  copy of this software and associated documentation files (the "Software"),
//  to deal in the Software without restriction, including without limitation
//  the rights to use, copy, modify, merge, publish, distribute, sublicense,
//  and/or sell copies of the Software, and to permit persons to whom the
//  Software is furnished to do so, subject to the following conditions:
//
//  The above copyright notice and this permission notice shall be included in
//  all copies or substantial portions of the Software.
//
//  THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//  OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//  FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//  AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//  LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//  FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//  DEALINGS IN THE SOFTWARE.

//! Error types for the fallible entry points of the scheduler.
//!
//! Integrity violations (magic mismatch, double enqueue, refcount underflow)
//! are not represented here: they indicate memory corruption or API misuse
//! and are raised as panics, not propagated as `Result`.

use std::io;

/// Errors returned by the coroutine and coroutine-thread APIs.
#[derive(Debug, thiserror::Error)]
pub enum CoroutineError {
    /// The fixed-size, aligned stack allocation failed (`mmap`/`mprotect`).
    #[error("failed to allocate a {size}-byte coroutine stack: {source}")]
    StackAlloc {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// `CoroutineThread::start` could not spawn the underlying worker thread.
    #[error("failed to spawn coroutine worker thread {name:?}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A connection-handler I/O operation failed.
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoroutineError>;
