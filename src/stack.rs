// Copyright 2013 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
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

//! A coroutine's stack: a `STACK_SIZE`-aligned `mmap` region, with a
//! dedicated guard page mapped directly below it (outside the aligned
//! region itself, so it never overlaps the bottom magic word at the
//! stack's own offset 0) and two magic sentinel words used to detect
//! corruption (see module invariants in `coroutine`).

use std::io;
use std::mem::size_of;
use std::ptr;

use crate::error::{CoroutineError, Result};

const WORD: usize = size_of::<usize>();

/// Written at the lowest address of every stack.
pub const STACK_BOTTOM_MAGIC: usize = 0xdead_c0de_dead_c0de;
/// Written at the highest address of every stack.
pub const STACK_TOP_MAGIC: usize = 0xc0de_dead_c0de_dead;

/// The smallest stack this crate will allocate, and the rounding unit for
/// caller-supplied sizes (see `Options::stack_size`).
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// A fixed-size, `size`-aligned stack with a guard page just below the
/// usable region and bottom/top magic words for corruption detection.
///
/// The alignment lets any interior stack pointer recover the stack's base
/// address by masking with `!(size - 1)`, which is how the trampoline (see
/// `coroutine::trampoline`) finds its way back to the owning `Coroutine`
/// without the context switch needing to carry a parameter.
pub struct Stack {
    map: *mut u8,
    map_len: usize,
    size: usize,
    /// The dedicated `PROT_NONE` page immediately below `map`, outside the
    /// `size`-aligned region so it can never cover the bottom magic word.
    guard: *mut u8,
}

unsafe impl Send for Stack {}

impl Stack {
    /// Allocate a new stack. `size` must be a power of two; the caller
    /// (`Options::stack_size`) is responsible for rounding.
    pub fn new(size: usize) -> Result<Stack> {
        debug_assert!(size.is_power_of_two(), "stack size must be a power of two");
        debug_assert!(size >= WORD * 4);

        let page = page_size();

        // Over-allocate so we can carve out a `size`-aligned sub-region with
        // at least one full page of slack ahead of it: that leading page
        // becomes a dedicated guard page, kept entirely outside the
        // `size`-aligned stack region so protecting it can never cover the
        // bottom magic word at the stack's own offset 0.
        let map_len = size * 2 + page;
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(CoroutineError::StackAlloc {
                size,
                source: io::Error::last_os_error(),
            });
        }
        let map = map as *mut u8;

        // Leave room for a full guard page below the aligned region: align
        // up from `map + page`, not `map`, so there is always at least one
        // page of slack to carve the guard out of.
        let aligned = align_up(map as usize + page, size) as *mut u8;
        let guard = unsafe { aligned.sub(page) };
        let front_slack = guard as usize - map as usize;
        let back_slack = map_len - front_slack - page - size;

        unsafe {
            if front_slack > 0 {
                libc::munmap(map as *mut libc::c_void, front_slack);
            }
            if back_slack > 0 {
                libc::munmap(aligned.add(size) as *mut libc::c_void, back_slack);
            }
        }

        let stack = Stack {
            map: aligned,
            map_len: size,
            size,
            guard,
        };

        if !stack.protect_guard_page() {
            let err = io::Error::last_os_error();
            return Err(CoroutineError::StackAlloc { size, source: err });
        }

        unsafe {
            stack.write_magic();
        }

        Ok(stack)
    }

    fn protect_guard_page(&self) -> bool {
        // The guard page sits one page below `map`, entirely outside the
        // `size`-aligned stack region: a sufficiently deep overflow faults
        // here instead of corrupting whatever mapping happens to precede us,
        // and the bottom magic word at `map`'s own offset 0 stays readable.
        let page = page_size();
        unsafe { libc::mprotect(self.guard as *mut libc::c_void, page, libc::PROT_NONE) == 0 }
    }

    unsafe fn write_magic(&self) {
        let base = self.map as *mut usize;
        let top_word = self.map.add(self.size - WORD) as *mut usize;
        ptr::write(base, STACK_BOTTOM_MAGIC);
        ptr::write(top_word, STACK_TOP_MAGIC);
    }

    /// Store the coroutine's self-pointer at `top - 2 words`, which is also
    /// the stack pointer a freshly-created coroutine resumes at.
    pub unsafe fn write_backpointer(&self, co: *mut ()) {
        let slot = self.map.add(self.size - 2 * WORD) as *mut usize;
        ptr::write(slot, co as usize);
    }

    /// The initial stack pointer for a just-created coroutine: `top - 2
    /// words`, the address of the just-written back-pointer slot.
    pub fn initial_sp(&self) -> *mut u8 {
        unsafe { self.map.add(self.size - 2 * WORD) }
    }

    /// Lowest address of the mapping.
    pub fn base(&self) -> *const u8 {
        self.map
    }

    /// One byte past the highest address of the mapping.
    pub fn top(&self) -> *const u8 {
        unsafe { self.map.add(self.size) }
    }

    /// Recover a coroutine self-pointer given any stack pointer that is
    /// currently inside this stack's mapping, by masking down to the base
    /// and reading the back-pointer slot. Used by the trampoline.
    ///
    /// # Safety
    /// `sp` must point somewhere inside a stack of exactly `size` bytes
    /// allocated by `Stack::new`, and that stack's back-pointer must have
    /// been written via `write_backpointer`.
    pub unsafe fn self_pointer_from_sp(sp: *mut u8, size: usize) -> *mut () {
        let base = (sp as usize) & !(size - 1);
        let slot = (base + size - 2 * WORD) as *const usize;
        ptr::read(slot) as *mut ()
    }

    /// Assert both magic words are intact. Fatal (panics) on mismatch: this
    /// indicates stack corruption, not a recoverable error.
    pub fn check_magic(&self) {
        unsafe {
            let base = self.map as *const usize;
            let top_word = self.map.add(self.size - WORD) as *const usize;
            let bottom = ptr::read(base);
            let top = ptr::read(top_word);
            assert_eq!(
                bottom, STACK_BOTTOM_MAGIC,
                "coroutine stack bottom magic corrupted"
            );
            assert_eq!(top, STACK_TOP_MAGIC, "coroutine stack top magic corrupted");
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.guard as *mut libc::c_void, page_size());
            libc::munmap(self.map as *mut libc::c_void, self.map_len);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.map)
            .field("size", &self.size)
            .finish()
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round `size` up to the next power of two, with a floor of
/// [`MIN_STACK_SIZE`].
pub fn round_stack_size(size: usize) -> usize {
    size.max(MIN_STACK_SIZE).next_power_of_two()
}

thread_local! {
    // The size of the stack the worker thread is currently resuming into (or
    // already running on). `self_pointer_from_sp` needs `size` to mask a
    // stack pointer down to its base, but stack sizes are configurable per
    // coroutine (`Options::stack_size`), so the size can't be a compile-time
    // constant; the scheduler records it here immediately before every swap
    // that resumes a coroutine, and any code running on that coroutine's
    // stack (the trampoline, `yield_now`, `wait`) reads it back.
    static ENTERING_SIZE: std::cell::Cell<usize> = std::cell::Cell::new(0);
}

/// Record the stack size of the coroutine about to be resumed. Called by
/// the scheduler immediately before swapping into a coroutine's context.
pub(crate) fn set_entering_size(size: usize) {
    ENTERING_SIZE.with(|c| c.set(size));
}

/// The size recorded by the most recent [`set_entering_size`] call on this
/// thread.
pub(crate) fn entering_size() -> usize {
    ENTERING_SIZE.with(|c| c.get())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stack_alignment_and_magic() {
        let stack = Stack::new(MIN_STACK_SIZE).expect("alloc stack");
        assert_eq!(stack.base() as usize % stack.size(), 0);
        stack.check_magic();
    }

    #[test]
    fn test_round_stack_size() {
        assert_eq!(round_stack_size(1), MIN_STACK_SIZE);
        assert_eq!(round_stack_size(MIN_STACK_SIZE + 1), MIN_STACK_SIZE * 2);
        assert_eq!(round_stack_size(MIN_STACK_SIZE), MIN_STACK_SIZE);
    }

    #[test]
    #[should_panic(expected = "bottom magic")]
    fn test_stack_magic_guard_trips() {
        let stack = Stack::new(MIN_STACK_SIZE).expect("alloc stack");
        unsafe {
            ptr::write(stack.base() as *mut usize, 0);
        }
        stack.check_magic();
    }
}
