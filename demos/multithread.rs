//! One dedicated `CoroutineThread` per CPU, each running a single counting
//! coroutine. This crate has no work-stealing pool (see the scheduler's
//! non-goals): every `CoroutineThread` is fully independent, so running N
//! of them is just N independent schedulers, not N workers sharing a queue.

use coroutine::{wait, Builder, ThreadBuilder};

fn main() {
    env_logger::init();
    let n = num_cpus::get();
    let mut threads = Vec::with_capacity(n);
    let mut handles = Vec::with_capacity(n);

    for i in 0..n {
        let thread = ThreadBuilder::new()
            .name(format!("coroutine-worker-{i}"))
            .start()
            .unwrap();

        let handle = Builder::new()
            .spawn(&thread, move |_me| {
                for count in 0..10 {
                    println!("worker {i}: counting {count}");
                }
                Box::new(())
            })
            .unwrap();

        threads.push(thread);
        handles.push(handle);
    }

    for handle in handles {
        wait(&handle);
    }
    for thread in threads {
        thread.stop();
    }
}
