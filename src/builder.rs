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

//! Builder-style configuration for coroutines and coroutine threads.

use std::any::Any;
use std::sync::Arc;

use crate::coroutine::Handle;
use crate::error::Result;
use crate::options::{Options, ThreadOptions};
use crate::thread::CoroutineThread;

/// Configures and creates a [`Coroutine`](crate::coroutine::Coroutine) on an
/// existing [`CoroutineThread`].
///
/// ```ignore
/// let handle = Builder::new()
///     .name("worker #1".to_string())
///     .stack_size(128 * 1024)
///     .spawn(&thread, move |_me| Box::new(()))?;
/// ```
pub struct Builder {
    opts: Options,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            opts: Default::default(),
        }
    }

    /// Name the coroutine-to-be. Used for identification only in logs and
    /// panic messages.
    pub fn name(mut self, name: String) -> Builder {
        self.opts.name = Some(name);
        self
    }

    /// Set the size of the stack for the new coroutine. Rounded up to a
    /// power of two no smaller than [`crate::stack::MIN_STACK_SIZE`].
    pub fn stack_size(mut self, size: usize) -> Builder {
        self.opts.stack_size = size;
        self
    }

    /// Create and start the coroutine on `thread`.
    pub fn spawn<F>(self, thread: &Arc<CoroutineThread>, f: F) -> Result<Handle>
    where
        F: FnOnce(Handle) -> Box<dyn Any + Send> + Send + 'static,
    {
        let handle = crate::coroutine::create(thread, self.opts)?;
        crate::coroutine::start(&handle, f);
        Ok(handle)
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

/// Configures and starts a [`CoroutineThread`]'s worker.
pub struct ThreadBuilder {
    opts: ThreadOptions,
}

impl ThreadBuilder {
    pub fn new() -> ThreadBuilder {
        ThreadBuilder {
            opts: Default::default(),
        }
    }

    pub fn name(mut self, name: String) -> ThreadBuilder {
        self.opts.name = name;
        self
    }

    /// Best-effort CPU index to pin the worker OS thread to.
    pub fn cpu(mut self, cpu: usize) -> ThreadBuilder {
        self.opts.cpu = Some(cpu);
        self
    }

    pub fn start(self) -> Result<Arc<CoroutineThread>> {
        CoroutineThread::start(self.opts)
    }
}

impl Default for ThreadBuilder {
    fn default() -> ThreadBuilder {
        ThreadBuilder::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let b = Builder::new();
        assert_eq!(b.opts.stack_size, crate::stack::MIN_STACK_SIZE);
        assert!(b.opts.name.is_none());
    }
}
