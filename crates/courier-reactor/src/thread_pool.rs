use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread,
};

use crate::executor::{Executor, Task};

struct PoolState {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed-size worker pool implementing [`Executor`].
///
/// Tasks are run in submission order by whichever worker grabs them first;
/// a multi-worker pool therefore does not preserve completion order.
/// Dropping the pool finishes queued tasks, then joins the workers.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "a thread pool needs at least one worker");

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState { tasks: VecDeque::new(), stop: false }),
            available: Condvar::new(),
        });

        let workers = (0..num_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("courier-worker-{i}"))
                    .spawn(move || worker(&shared))
                    .expect("couldn't spawn a pool worker")
            })
            .collect();

        Self { shared, workers }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        let n = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self::new(n)
    }
}

impl Executor for ThreadPool {
    fn post(&self, task: Task) {
        self.shared.state.lock().expect("pool state poisoned").tasks.push_back(task);
        self.shared.available.notify_one();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.state.lock().expect("pool state poisoned").stop = true;
        self.shared.available.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker(shared: &PoolShared) {
    loop {
        let task = {
            let mut state = shared.state.lock().expect("pool state poisoned");
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                if state.stop {
                    return;
                }
                state = shared.available.wait(state).expect("pool state poisoned");
            }
        };
        task();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn runs_posted_tasks() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn single_worker_preserves_order() {
        let pool = ThreadPool::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..32 {
            let seen = Arc::clone(&seen);
            pool.post(Box::new(move || {
                seen.lock().unwrap().push(i);
            }));
        }

        drop(pool);
        assert_eq!(*seen.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }
}
