// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! The dedicated worker thread a `CoroutineThread` pins its coroutines to,
//! and the FIFO scheduler that runs on it.
//!
//! There is no work stealing and no multiplexed I/O event loop: every
//! coroutine created on a `CoroutineThread` runs on that one worker, full
//! stop. The scheduler is a ready-list behind a spinlock and a park/unpark
//! wait, a small machine that is correct precisely because only one thread
//! ever removes entries from the list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, info, trace, warn};

use crate::context::Context;
use crate::coroutine::{self, CoroutineInner};
use crate::error::{CoroutineError, Result};
use crate::options::ThreadOptions;
use crate::spinlock::SpinLock;

/// A dedicated OS thread that runs every coroutine created on it,
/// cooperatively, in FIFO order.
///
/// Always handed out wrapped in an `Arc` (see
/// [`start`](CoroutineThread::start)): coroutines created on it keep a raw
/// pointer back to it (`CoroutineInner::thread`), so its address has to
/// stay stable for as long as any of them exist.
pub struct CoroutineThread {
    /// The ready-list is the sole source of truth for whether the worker has
    /// more work to do: `worker_loop` parks only once it observes this
    /// empty, never from a separate wake counter that could be zeroed while
    /// a re-armed coroutine is still sitting in the list (see `notify` and
    /// `worker_loop`).
    pub(crate) ready: SpinLock<VecDeque<*mut CoroutineInner>>,
    stopping: AtomicBool,
    /// The scheduler's own context: coroutines swap into this to yield or
    /// finish, and the worker loop swaps out of it to enter a coroutine.
    worker_ctx: Context,
    worker: Mutex<Option<std::thread::Thread>>,
    join: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

// `ready`'s spinlock and the atomics carry the cross-thread synchronization;
// `worker_ctx` is touched only by the worker thread itself.
unsafe impl Send for CoroutineThread {}
unsafe impl Sync for CoroutineThread {}

impl CoroutineThread {
    /// Spawn the worker thread and return a handle to it. The worker parks
    /// immediately, waiting for the first coroutine to be started on it.
    pub fn start(opts: ThreadOptions) -> Result<Arc<CoroutineThread>> {
        let thread = Arc::new(CoroutineThread {
            ready: SpinLock::new(VecDeque::new()),
            stopping: AtomicBool::new(false),
            worker_ctx: Context::empty(),
            worker: Mutex::new(None),
            join: Mutex::new(None),
            name: opts.name.clone(),
        });

        let worker_thread = thread.clone();
        let cpu = opts.cpu;
        let spawn_name = opts.name.clone();
        let mut builder = std::thread::Builder::new();
        if !opts.name.is_empty() {
            builder = builder.name(opts.name.clone());
        }

        let join = builder
            .spawn(move || {
                if let Some(cpu) = cpu {
                    pin_current_thread_best_effort(cpu);
                }
                worker_loop(&worker_thread);
            })
            .map_err(|source| CoroutineError::Spawn {
                name: spawn_name,
                source,
            })?;

        *thread.worker.lock().unwrap() = Some(join.thread().clone());
        *thread.join.lock().unwrap() = Some(join);

        Ok(thread)
    }

    pub(crate) fn worker_ctx(&self) -> &Context {
        &self.worker_ctx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wake the worker if it is parked. Called after a coroutine is queued.
    /// `park`/`unpark`'s sticky token means a `notify` landing between the
    /// worker's last ready-list check and its `park` call is never lost:
    /// the very next `park` returns immediately instead of blocking.
    pub(crate) fn notify(&self) {
        if let Some(worker) = self.worker.lock().unwrap().as_ref() {
            worker.unpark();
        }
    }

    /// Stop accepting new work and wait for the worker to park for the
    /// last time. Any coroutines still on the ready-list when the worker
    /// notices `stopping` are dropped (the list's reference on them is
    /// released) without being resumed again; nothing outside this crate
    /// observes that as anything other than the coroutine simply never
    /// finishing, the same outward behavior a cooperative cancellation
    /// that's never acted on would have.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().unwrap().as_ref() {
            worker.unpark();
        }
        if let Some(join) = self.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

impl Drop for CoroutineThread {
    fn drop(&mut self) {
        if self.join.lock().unwrap().is_some() {
            self.stop();
        }
    }
}

impl std::fmt::Debug for CoroutineThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineThread")
            .field("name", &self.name)
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

// --- scheduler loop -------------------------------------------------------

fn worker_loop(thread: &CoroutineThread) {
    trace!("coroutine worker thread {:?} starting", thread.name());
    loop {
        let batch: Vec<*mut CoroutineInner> = { thread.ready.lock().drain(..).collect() };

        // Only park once the ready list is actually observed empty — never
        // from a separate wake counter. A re-armed coroutine that `enter`
        // just requeued (`requeue_or_release`, `remaining > 0`) is picked up
        // by the very next iteration of this loop with no external `signal`
        // required; parking here instead would strand it until some
        // unrelated future `signal()` happened to arrive.
        if batch.is_empty() {
            if thread.stopping.load(Ordering::Acquire) {
                break;
            }
            std::thread::park();
            continue;
        }

        for ptr in batch {
            enter(thread, ptr);
            requeue_or_release(thread, ptr);
        }
    }

    drain_remaining(thread);
    info!("coroutine worker thread {:?} stopped", thread.name());
}

/// Resume `ptr` for one quantum: swap from the worker's context into the
/// coroutine's, returning once it yields or finishes. Per Invariant 5
/// ("`running == false` is final; once observed false, the coroutine will
/// never be entered again"), a coroutine that has already finished or been
/// cancelled is not swapped into at all — the scheduler, not the
/// coroutine's own code, is what makes cancellation stick.
fn enter(thread: &CoroutineThread, ptr: *mut CoroutineInner) {
    let inner = unsafe { &*ptr };
    if inner.is_finished() || inner.is_cancelled() {
        trace!("coroutine {:?} finished or cancelled; skipping entry", ptr);
        inner.mark_retired();
        return;
    }

    crate::stack::set_entering_size(inner.stack_size());
    debug!("resuming coroutine {:?} ({:?})", ptr, inner.name());
    let result = unsafe { thread.worker_ctx.swap(inner.ctx(), 0) };
    debug_assert_eq!(
        result == coroutine::FINISHED,
        inner.is_finished(),
        "swap_context's FINISHED sentinel disagreed with the finished flag"
    );
    trace!(
        "coroutine {:?} {}",
        ptr,
        if result == coroutine::FINISHED { "finished" } else { "yielded" }
    );
}

/// Decide whether `ptr` goes back on the ready-list or loses the list's
/// reference, using the same decrement-under-lock discipline
/// `coroutine::signal`'s increment-and-enqueue uses, so the two can't race
/// each other into a lost wakeup (see `coroutine::signal`'s doc comment).
///
/// Mirrors spec §4.4's `next_ready` pseudocode exactly: the list's
/// reference is given back whenever a coroutine is truly dequeued
/// (`signaled` drained to zero), regardless of whether it ran to
/// completion — Invariant 2 ties the list's reference to list membership,
/// not to completion.
fn requeue_or_release(thread: &CoroutineThread, ptr: *mut CoroutineInner) {
    let inner = unsafe { &*ptr };
    let mut ready = thread.ready.lock();
    let remaining = inner.dec_signaled();
    if remaining > 0 {
        ready.push_back(ptr);
        return;
    }
    inner.clear_enqueued();
    drop(ready);
    unsafe { coroutine::deref_raw(ptr) };
}

fn drain_remaining(thread: &CoroutineThread) {
    let remaining: Vec<*mut CoroutineInner> = thread.ready.lock().drain(..).collect();
    if !remaining.is_empty() {
        warn!(
            "coroutine thread stopped with {} coroutine(s) still queued; releasing without resuming",
            remaining.len()
        );
    }
    for ptr in remaining {
        let inner = unsafe { &*ptr };
        inner.clear_enqueued();
        unsafe { coroutine::deref_raw(ptr) };
    }
}

#[cfg(target_os = "linux")]
fn pin_current_thread_best_effort(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!("failed to pin coroutine worker thread to cpu {cpu}, continuing unpinned");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread_best_effort(cpu: usize) {
    warn!("cpu pinning is not supported on this platform (requested cpu {cpu}), continuing unpinned");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_start_and_stop_idle() {
        let thread = CoroutineThread::start(ThreadOptions::default()).unwrap();
        thread.stop();
    }

    #[test]
    fn test_name_is_preserved() {
        let thread = CoroutineThread::start(ThreadOptions {
            name: "my-coroutines".into(),
            cpu: None,
        })
        .unwrap();
        assert_eq!(thread.name(), "my-coroutines");
        thread.stop();
    }
}
