//! Two coroutines share a cell guarded by a mutex. `Handle` is reference
//! counted (`Handle::clone` / `Drop`), the same way the original demo's
//! `Rc<RefCell<_>>` was reference counted — the difference is that a
//! coroutine body must be `Send` (it might run on a different OS thread
//! than the one that called `spawn`), so the shared cell needs `Arc<Mutex<_>>`
//! rather than `Rc<RefCell<_>>`. Because both coroutines run on the same
//! `CoroutineThread`, only one ever holds the lock at a time, so contention
//! never actually happens in practice.

use std::sync::{Arc, Mutex};

use coroutine::{wait, Builder, ThreadBuilder};

fn main() {
    env_logger::init();
    let thread = ThreadBuilder::new().name("refcount-demo".into()).start().unwrap();
    let cell = Arc::new(Mutex::new(0usize));

    let cell1 = cell.clone();
    let coro1 = Builder::new()
        .spawn(&thread, move |_me| {
            *cell1.lock().unwrap() = 1;
            Box::new(*cell1.lock().unwrap())
        })
        .unwrap();

    let cell2 = cell.clone();
    let coro2 = Builder::new()
        .spawn(&thread, move |_me| {
            *cell2.lock().unwrap() = 2;
            Box::new(*cell2.lock().unwrap())
        })
        .unwrap();

    println!("first: {}", wait(&coro1).downcast::<usize>().unwrap());
    println!("second: {}", wait(&coro2).downcast::<usize>().unwrap());

    // Each `Handle` still alive here (`coro1`, `coro2`) keeps its
    // coroutine's reference count above zero even though both have already
    // finished; dropping them is what finally frees the stacks.
    drop(coro1);
    drop(coro2);
    thread.stop();
}
