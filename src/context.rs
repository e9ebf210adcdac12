// Copyright 2013-2014 The Rust Project Developers. See the COPYRIGHT
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

//! The `ctx_save` / `ctx_restore` context-switch primitive.
//!
//! Both operations are realized as one naked function, `swap_context`: it
//! saves the callee-saved registers of the outgoing side onto its own
//! stack, swaps the stack pointer, and pops the incoming side's registers.
//! This is the textbook `swapcontext` shape, and it is what lets `ctx_save`
//! return zero on the initial call and the resumer's `value` on every
//! subsequent one: the `value` travels in a register across the swap and
//! comes back out as this function's return value.
//!
//! Only x86-64 (System V calling convention) is implemented. A port to
//! another architecture needs its own `swap_context` body, following the
//! same shape as the one below.

use std::cell::Cell;

use crate::stack::Stack;

/// A saved machine context: just enough to resume a suspended computation.
/// Only the stack pointer is tracked explicitly; the callee-saved general
/// purpose registers live on the stack itself, pushed by `swap_context`.
#[derive(Debug)]
pub struct Context {
    sp: Cell<*mut u8>,
}

unsafe impl Send for Context {}

pub type TrampolineFn = extern "sysv64" fn() -> !;

impl Context {
    /// An empty context, to be filled in by the first `swap` that targets
    /// it (used for `CoroutineThread::worker_ctx`, which starts out unused).
    pub fn empty() -> Context {
        Context {
            sp: Cell::new(std::ptr::null_mut()),
        }
    }

    /// Arm an existing context (normally one built with [`Context::empty`])
    /// so that the first `swap_context` targeting it pops a synthetic
    /// all-zero register frame and "returns" into `trampoline` by `ret`,
    /// landing with `rsp == stack.initial_sp()`.
    pub fn init(&self, stack: &Stack, trampoline: TrampolineFn) {
        const FRAME_WORDS: usize = 7; // 6 callee-saved regs + return address
        let word = std::mem::size_of::<usize>();

        unsafe {
            let frame = stack.initial_sp().sub(FRAME_WORDS * word) as *mut usize;
            for i in 0..FRAME_WORDS - 1 {
                std::ptr::write(frame.add(i), 0);
            }
            std::ptr::write(frame.add(FRAME_WORDS - 1), trampoline as usize);

            self.sp.set(frame as *mut u8);
        }
    }

    /// Swap the current execution context for `target`'s, passing `value`
    /// across. Returns when some later swap targets `self` again, yielding
    /// the `value` that swap was given. Returns immediately with `value`
    /// unexamined from the restore side's perspective the very first time
    /// `self` is swapped into, per the `ctx_restore` contract: it never
    /// returns into *this* call, only into whatever is on `target`'s stack.
    ///
    /// # Safety
    /// `target` must be a context belonging to a stack that is still
    /// mapped, and `self` must be the context of the coroutine or worker
    /// thread that is currently executing.
    pub unsafe fn swap(&self, target: &Context, value: usize) -> usize {
        let mut current_sp = self.sp.get();
        let result = swap_context(&mut current_sp, target.sp.get(), value);
        self.sp.set(current_sp);
        result
    }
}

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "sysv64" fn swap_context(current: *mut *mut u8, target: *mut u8, value: usize) -> usize {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov rax, rdx",
        "ret",
    )
}

#[cfg(not(target_arch = "x86_64"))]
unsafe extern "sysv64" fn swap_context(_current: *mut *mut u8, _target: *mut u8, _value: usize) -> usize {
    compile_error!("coroutine: swap_context is only implemented for x86-64");
}

#[cfg(all(test, target_arch = "x86_64"))]
mod test {
    use super::*;
    use crate::stack::Stack;

    extern "sysv64" fn dummy_trampoline() -> ! {
        unreachable!("test does not resume far enough to reach the trampoline body")
    }

    #[test]
    fn test_context_new_places_trampoline_as_return_address() {
        let stack = Stack::new(crate::stack::MIN_STACK_SIZE).unwrap();
        let ctx = Context::empty();
        ctx.init(&stack, dummy_trampoline);
        // The synthetic frame's return-address slot (the 7th word up from
        // the saved sp) must hold the trampoline's address.
        unsafe {
            let frame = ctx.sp.get() as *const usize;
            let retaddr = std::ptr::read(frame.add(6));
            assert_eq!(retaddr, dummy_trampoline as usize);
        }
    }
}
