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

//! A stackful coroutine: a function running on its own stack, scheduled
//! cooperatively on a single [`CoroutineThread`](crate::thread::CoroutineThread).
//!
//! A `Coroutine` is reference counted. The ready-list holds one of those
//! references for as long as the coroutine is queued to run; callers hold
//! the rest through [`Handle`]. The object is only ever freed once both the
//! last `Handle` is dropped and the coroutine is not queued.

use std::any::Any;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::trace;

use crate::context::Context;
use crate::error::Result;
use crate::options::Options;
use crate::stack::{self, Stack};
use crate::thread::CoroutineThread;

const MAGIC: usize = 0xC0A1_FACE_C0A1_FACE;

/// Value a coroutine's context switch returns with when it has run its
/// function to completion and will never be resumed again. Read by
/// `thread::enter` right at the point of resumption.
pub(crate) const FINISHED: usize = usize::MAX;

type Thunk = Box<dyn FnOnce(Handle) -> Box<dyn Any + Send> + Send>;

/// The coroutine object proper. Always accessed through a [`Handle`] or a
/// raw pointer recovered via stack-pointer masking; never moved or copied
/// once its stack's back-pointer has been written.
pub(crate) struct CoroutineInner {
    magic: usize,
    thread: *const CoroutineThread,
    stack: Stack,
    ctx: Context,
    fun: Cell<Option<Thunk>>,
    /// The coroutine's return value, once available. Guarded by a real
    /// `Mutex` (not a bare `Cell`) because, unlike `fun`/`ctx`/`stack`,
    /// this one is read from arbitrary threads: `wait` called from outside
    /// any coroutine (`main`, a test thread, ...) blocks on `done` until
    /// this is `Some`.
    ret: Mutex<Option<Box<dyn Any + Send>>>,
    /// Signaled once `ret` becomes available, by the trampoline on normal
    /// completion or by the scheduler (`thread::enter`) when it retires a
    /// cancelled coroutine it will never enter. Lets a cross-thread `wait`
    /// block instead of busy-polling.
    done: Condvar,
    /// Set once, by the trampoline, after the coroutine's function returns.
    finished: AtomicBool,
    /// Set by `cancel`. Distinct from `finished`: the scheduler (not the
    /// coroutine's own code) is what enforces that a cancelled coroutine is
    /// never entered again (see `thread::enter`); a coroutine may also poll
    /// [`is_cancelled`] itself to return early, but doesn't have to.
    cancelled: AtomicBool,
    ref_count: AtomicUsize,
    /// Outstanding, not-yet-observed `signal()` calls. See `signal` and
    /// `thread::requeue_or_release` for the count-then-enqueue discipline
    /// this implements.
    signaled: AtomicUsize,
    /// Whether this coroutine currently holds the ready-list's reference.
    /// Guarded by `CoroutineThread::ready`'s lock on every transition so it
    /// can be checked-and-set atomically with the enqueue/dequeue it gates.
    enqueued: AtomicBool,
    name: Option<String>,
}

// `finished`, `cancelled`, `ref_count`, `signaled`, `enqueued`, `ret` and
// `done` are touched from any thread that holds a `Handle` (`ret`/`done`
// carry their own synchronization via `Mutex`/`Condvar`). `fun`, `ctx` and
// `stack` are touched only by the coroutine thread that owns this
// coroutine, whether that's the coroutine itself (running on its own
// stack) or the worker between runs; nothing outside that thread reaches
// through those fields.
unsafe impl Send for CoroutineInner {}
unsafe impl Sync for CoroutineInner {}

impl CoroutineInner {
    fn check_magic(&self) {
        assert_eq!(self.magic, MAGIC, "coroutine object magic corrupted");
        self.stack.check_magic();
    }

    pub(crate) fn thread(&self) -> &CoroutineThread {
        unsafe { &*self.thread }
    }

    pub(crate) fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack.size()
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Make sure a `wait`er never blocks forever on a coroutine the
    /// scheduler has decided never to enter again. Called by
    /// `thread::enter` whenever it skips a finished-or-cancelled
    /// coroutine. A no-op if `ret` is already populated (the normal
    /// completion path via the trampoline already did this).
    pub(crate) fn mark_retired(&self) {
        let mut ret = self.ret.lock().unwrap();
        if ret.is_none() {
            *ret = Some(Box::new(()) as Box<dyn Any + Send>);
        }
        drop(ret);
        self.done.notify_all();
    }

    /// Consume one outstanding signal. Returns the number still pending
    /// afterwards.
    pub(crate) fn dec_signaled(&self) -> usize {
        self.signaled.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn clear_enqueued(&self) {
        self.enqueued.store(false, Ordering::Release);
    }
}

/// A reference-counted handle to a [`Coroutine`]. Cloning increments the
/// reference count; dropping the last handle (with the coroutine not
/// queued) frees the stack and the object.
pub struct Handle(NonNull<CoroutineInner>);

// The pointee's own fields carry the synchronization; the handle is just a
// counted pointer to it.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub(crate) fn inner(&self) -> &CoroutineInner {
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn as_ptr(&self) -> *mut CoroutineInner {
        self.0.as_ptr()
    }

    /// Rebuild a `Handle` from a raw pointer without touching the reference
    /// count. Used internally when the ready-list, which already owns a
    /// reference, needs a `Handle` to operate on a coroutine.
    ///
    /// # Safety
    /// `ptr` must be a live `CoroutineInner` and the caller must account for
    /// the reference this `Handle` represents (typically by forgetting it
    /// rather than letting it `Drop`, since the count was not bumped).
    pub(crate) unsafe fn from_raw_borrowed(ptr: *mut CoroutineInner) -> Handle {
        Handle(NonNull::new_unchecked(ptr))
    }
}

impl Clone for Handle {
    fn clone(&self) -> Handle {
        self.inner().ref_count.fetch_add(1, Ordering::Relaxed);
        Handle(self.0)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe { deref_raw(self.0.as_ptr()) }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("ptr", &self.0.as_ptr())
            .field("name", &self.inner().name)
            .finish()
    }
}

/// Take a reference on a coroutine given only a raw pointer, without
/// constructing a `Handle`. Used by the ready-list to represent the
/// reference it itself holds.
///
/// # Safety
/// `ptr` must be a live `CoroutineInner`.
pub(crate) unsafe fn ref_raw(ptr: *mut CoroutineInner) {
    (*ptr).ref_count.fetch_add(1, Ordering::Relaxed);
}

/// Drop a reference taken with [`ref_raw`] or held by a [`Handle`]. Frees
/// the coroutine (stack included) once the count reaches zero.
///
/// # Safety
/// `ptr` must be a live `CoroutineInner`, and the caller must not use `ptr`
/// again after this call if the count reaches zero.
pub(crate) unsafe fn deref_raw(ptr: *mut CoroutineInner) {
    let inner = &*ptr;
    if inner.ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    // Last reference. A coroutine that is still queued holds its own
    // reference (see `signal`), so reaching zero here means it cannot be
    // sitting in the ready-list; running this check now, rather than
    // trusting the caller, catches a use-after-free class of bug at the
    // point it happens instead of corrupting the heap silently.
    assert!(
        !inner.enqueued.load(Ordering::Acquire),
        "coroutine freed while still enqueued"
    );
    inner.check_magic();
    trace!("coroutine {:?} destroyed", ptr);
    drop(Box::from_raw(ptr));
}

/// Allocate a coroutine on `thread`. The coroutine does not run until
/// [`start`] is called.
///
/// `thread` must be kept alive (its `Arc` not dropped) for as long as this
/// coroutine exists: the coroutine only stores the raw pointer behind the
/// `Arc`, not a cloned `Arc` itself, to keep `CoroutineInner` a single
/// heap-sized allocation.
pub(crate) fn create(thread: &Arc<CoroutineThread>, opts: Options) -> Result<Handle> {
    let stack = Stack::new(opts.resolved_stack_size())?;

    let inner = Box::new(CoroutineInner {
        magic: MAGIC,
        thread: Arc::as_ptr(thread),
        stack,
        ctx: Context::empty(),
        fun: Cell::new(None),
        ret: Mutex::new(None),
        done: Condvar::new(),
        finished: AtomicBool::new(false),
        cancelled: AtomicBool::new(false),
        ref_count: AtomicUsize::new(1),
        signaled: AtomicUsize::new(0),
        enqueued: AtomicBool::new(false),
        name: opts.name,
    });

    let ptr = Box::into_raw(inner);
    unsafe {
        (*ptr).stack.write_backpointer(ptr as *mut ());
    }
    trace!("coroutine {:?} created", ptr);
    Ok(unsafe { Handle(NonNull::new_unchecked(ptr)) })
}

/// Arm `handle` with its body and queue its first run.
///
/// # Panics
/// Panics if `handle` has already been started.
pub(crate) fn start<F>(handle: &Handle, f: F)
where
    F: FnOnce(Handle) -> Box<dyn Any + Send> + Send + 'static,
{
    let inner = handle.inner();
    inner.check_magic();
    assert!(
        inner.fun.replace(Some(Box::new(f))).is_none(),
        "coroutine already started"
    );
    inner.ctx.init(&inner.stack, trampoline);
    trace!("coroutine {:?} started", handle.as_ptr());
    signal(handle);
}

/// Wake `handle`: mark it runnable and, if it is not already queued, queue
/// it on its owning thread. Safe to call from any thread, including one
/// acting as an external event source (see `net::connection`).
///
/// The increment-before-enqueue-check ordering, mirrored by the consumer's
/// decrement-before-dequeue-decision in `thread::requeue_or_release`, is
/// what keeps a signal delivered while the coroutine is already running
/// from being lost: either this call's increment is seen by that decrement
/// (and the coroutine is requeued), or this call's enqueue check runs after
/// that decrement has already cleared `enqueued` (and this call queues it
/// itself).
pub fn signal(handle: &Handle) {
    let inner = handle.inner();
    inner.check_magic();
    inner.signaled.fetch_add(1, Ordering::AcqRel);

    let thread = inner.thread();
    {
        let mut ready = thread.ready.lock();
        if !inner.enqueued.swap(true, Ordering::AcqRel) {
            unsafe { ref_raw(handle.as_ptr()) };
            ready.push_back(handle.as_ptr());
        }
    }
    // Notify on every signal, not just the ones that first-enqueue: the
    // worker only parks once it observes the ready list empty
    // (`thread::worker_loop`), so a signal landing while `handle` is already
    // queued or already executing still has to reach `unpark` or the worker
    // could park with this coroutine's re-arm still unseen.
    thread.notify();
}

/// Cancel `handle`. Sets `cancelled` and wakes the coroutine's thread; the
/// scheduler itself (`thread::enter`) refuses to enter a cancelled
/// coroutine ever again, so the user function does not resume — at most
/// one entry is already in flight if `handle` happened to be running on
/// its worker at the moment of the call, proceeding only to its next
/// `yield_now`/`wait`/return (no preemption; see the crate's non-goals). A
/// coroutine may additionally poll [`is_cancelled`] itself to return early
/// sooner than its next suspension point would, but does not have to: the
/// scheduler's refusal to re-enter holds either way.
pub fn cancel(handle: &Handle) {
    handle.inner().cancelled.store(true, Ordering::Release);
    signal(handle);
}

/// Whether `handle` has been cancelled. A coroutine may check this on its
/// own function to decide whether to return early; the scheduler enforces
/// non-re-entry regardless (see [`cancel`]).
pub fn is_cancelled(handle: &Handle) -> bool {
    handle.inner().is_cancelled()
}

/// Recover a pointer to the `CoroutineInner` currently running on this
/// thread's stack, by masking the address of a local variable down to the
/// stack's base (see `Stack::self_pointer_from_sp`) and reading back the
/// pointer written there at `create` time.
///
/// Returns null when called from a thread that is not currently resuming a
/// coroutine (`stack::entering_size` defaults to 0 there, e.g. `main` or a
/// test thread, or the coroutine thread itself outside of `thread::enter`'s
/// swap): masking with a zero size would otherwise either panic on
/// subtraction overflow in a debug build or produce a bogus, almost
/// certainly unmapped address in release.
fn current_ptr() -> *mut CoroutineInner {
    let size = stack::entering_size();
    if size == 0 {
        return std::ptr::null_mut();
    }
    let marker: u8 = 0;
    let sp = &marker as *const u8 as *mut u8;
    unsafe { Stack::self_pointer_from_sp(sp, size) as *mut CoroutineInner }
}

/// Suspend the calling coroutine, returning control to its scheduler until
/// it is resumed by a later `signal`.
///
/// # Panics
/// Panics if called from outside a running coroutine (i.e. from the
/// scheduler thread itself between coroutines, or from an arbitrary OS
/// thread).
pub fn yield_now() {
    let ptr = current_ptr();
    assert!(!ptr.is_null(), "coroutine_yield called outside a coroutine");
    let inner = unsafe { &*ptr };
    inner.check_magic();
    let worker_ctx = inner.thread().worker_ctx();
    unsafe {
        inner.ctx.swap(worker_ctx, 0);
    }
}

/// Run `target` to completion and return the value `target`'s function
/// returned (or a unit placeholder if `target` was cancelled before its
/// function ever ran).
///
/// Callable two ways:
/// - From inside a coroutine on the same [`CoroutineThread`] as `target`:
///   busy-cooperative, re-signalling itself and [`yield_now`]ing back to the
///   scheduler between polls. The self-signal matters: a plain `yield_now`
///   would let the ready-list drop the waiting coroutine once its own
///   initiating signal is consumed (`thread::requeue_or_release`), and
///   nothing would ever bring it back for another look at `target.ret`.
/// - From any other thread (e.g. `main`, or a test): blocks the calling
///   thread on `target`'s completion signal instead, since `yield_now` is
///   only valid from inside a running coroutine.
pub fn wait(target: &Handle) -> Box<dyn Any + Send> {
    let inner = target.inner();
    let self_ptr = current_ptr();
    if self_ptr.is_null() {
        let mut ret = inner.ret.lock().unwrap();
        while ret.is_none() {
            ret = inner.done.wait(ret).unwrap();
        }
        return ret.take().expect("loop only exits once ret is Some");
    }
    loop {
        if let Some(ret) = inner.ret.lock().unwrap().take() {
            return ret;
        }
        let self_handle = unsafe { Handle::from_raw_borrowed(self_ptr) };
        signal(&self_handle);
        std::mem::forget(self_handle);
        yield_now();
    }
}

/// The entry point every freshly-created coroutine's context is set up to
/// jump into on its first resume (see `Context::init`). Recovers its own
/// `CoroutineInner` via stack-pointer masking, runs the coroutine's
/// function, stores its return value, and parks itself forever.
extern "sysv64" fn trampoline() -> ! {
    let ptr = current_ptr();
    let inner = unsafe { &*ptr };
    inner.check_magic();

    let fun = inner
        .fun
        .take()
        .expect("trampoline entered without a function armed");
    let handle = unsafe { Handle::from_raw_borrowed(ptr) };
    // `handle` above does not own a reference; the caller (`start`, via
    // `signal`) already accounted for the one the ready-list holds, and
    // `enter` on the scheduler side holds its own. The function runs with
    // a *borrowed* handle and gets an owned clone so it can store further
    // handles (e.g. to spawn children) without that borrow complicating
    // things.
    let owned_handle = handle.clone();
    std::mem::forget(handle);

    let ret = fun(owned_handle);

    inner.check_magic();
    *inner.ret.lock().unwrap() = Some(ret);
    inner.finished.store(true, Ordering::Release);
    std::sync::atomic::fence(Ordering::Release);
    inner.done.notify_all();

    let worker_ctx = inner.thread().worker_ctx();
    loop {
        unsafe {
            inner.ctx.swap(worker_ctx, FINISHED);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::ThreadOptions;
    use crate::thread::CoroutineThread;

    #[test]
    fn test_create_and_destroy_without_starting() {
        let thread = CoroutineThread::start(ThreadOptions::default()).unwrap();
        let handle = create(&thread, Options::default()).unwrap();
        drop(handle);
        thread.stop();
    }

    #[test]
    fn test_ping_pong() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let thread = CoroutineThread::start(ThreadOptions::default()).unwrap();
        let rounds = Arc::new(AtomicUsize::new(0));

        let a = create(&thread, Options::default()).unwrap();
        let b = create(&thread, Options::default()).unwrap();

        let b_for_a = b.clone();
        let rounds_a = rounds.clone();
        start(&a, move |_me| {
            for _ in 0..100 {
                rounds_a.fetch_add(1, Ordering::SeqCst);
                signal(&b_for_a);
                yield_now();
            }
            Box::new(())
        });

        let a_for_b = a.clone();
        start(&b, move |_me| {
            for _ in 0..100 {
                yield_now();
                signal(&a_for_b);
            }
            Box::new(())
        });

        std::thread::sleep(std::time::Duration::from_millis(200));
        assert_eq!(rounds.load(Ordering::SeqCst), 100);
        thread.stop();
    }
}
