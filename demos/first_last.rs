//! The "first value in, last value out" shape the original asymmetric
//! coroutine demo showed: unlike a generator that can carry a fresh value
//! across every individual resume, this scheduler's only payload-carrying
//! primitive is the function's single `arg` (captured by the closure) and
//! its final return value (retrieved with `wait`). There's no per-`signal`
//! payload; `signal` is a pure wakeup edge.

use coroutine::{wait, Builder, ThreadBuilder};

fn main() {
    env_logger::init();
    let thread = ThreadBuilder::new().name("first-last".into()).start().unwrap();

    let initial = 1usize;
    let coro = Builder::new()
        .spawn(&thread, move |_me| {
            println!("initial value: {initial}");
            Box::new(initial + 1)
        })
        .unwrap();

    let last = wait(&coro);
    println!("final value: {}", last.downcast::<usize>().unwrap());
    thread.stop();
}
