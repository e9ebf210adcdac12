//! Coroutine and coroutine-thread spawn options.

use crate::stack::{round_stack_size, MIN_STACK_SIZE};

/// Options controlling how a `Coroutine`'s stack is allocated and how it is
/// identified in logs and panic messages.
#[derive(Debug, Clone)]
pub struct Options {
    /// The size of the stack, rounded up to a power of two no smaller than
    /// [`MIN_STACK_SIZE`] (see `Stack::new`, which requires the alignment).
    pub stack_size: usize,

    /// The name of the Coroutine, used for identification only in logs and
    /// panic messages.
    pub name: Option<String>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            stack_size: MIN_STACK_SIZE,
            name: None,
        }
    }
}

impl Options {
    pub(crate) fn resolved_stack_size(&self) -> usize {
        round_stack_size(self.stack_size)
    }
}

/// Options controlling a `CoroutineThread`'s underlying worker OS thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    /// Name of the worker OS thread.
    pub name: String,

    /// Best-effort CPU index to pin the worker to. Unsupported platforms
    /// log a warning and continue unpinned rather than failing.
    pub cpu: Option<usize>,
}
