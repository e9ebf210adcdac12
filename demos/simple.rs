//! A coroutine that prints, yields back to the scheduler, gets signaled
//! back in, then spawns a nested child coroutine and waits for it to
//! finish.
//!
//! Unlike the stackless `resume()`-in-a-loop style of older coroutine
//! libraries, this crate's worker thread runs asynchronously with respect
//! to `main`: once spawned, a coroutine runs whenever its `CoroutineThread`
//! gets around to it, not lockstep with the caller. `wait` is how `main`
//! gets a deterministic join point back.

use coroutine::{signal, wait, yield_now, Builder, ThreadBuilder};

fn main() {
    env_logger::init();
    let thread = ThreadBuilder::new().name("simple-demo".into()).start().unwrap();
    let child_thread = thread.clone();

    let coro = Builder::new()
        .name("outer".into())
        .spawn(&thread, move |_me| {
            println!("hello from the outer coroutine");

            // Suspend until the main thread signals us again.
            yield_now();

            println!("resumed after a signal");

            let child = Builder::new()
                .name("inner".into())
                .spawn(&child_thread, |_me| {
                    println!("inner coroutine counting...");
                    for i in 0..5 {
                        println!("counting {i}");
                    }
                    Box::new(())
                })
                .unwrap();
            wait(&child);

            println!("outer coroutine done");
            Box::new(())
        })
        .unwrap();

    signal(&coro);
    wait(&coro);
    println!("back in main");
    thread.stop();
}
