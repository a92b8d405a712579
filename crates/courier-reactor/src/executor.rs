use std::time::Duration;

/// A unit of work accepted by an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A delayed unit of work. The returned duration is the next delay;
/// `Duration::ZERO` stops the task.
pub type TimedTask = Box<dyn FnMut() -> Duration + Send + 'static>;

/// Capability to accept a unit of work for later execution, possibly on
/// another thread.
pub trait Executor: Send + Sync {
    fn post(&self, task: Task);
}

/// An [`Executor`] that can also run a task after a delay.
pub trait TimedExecutor: Executor {
    fn post_timed(&self, task: TimedTask, delay: Duration);
}
