mod assert;
mod event_loop;
mod executor;
mod remote;
mod sys;
mod thread_pool;
mod timer;
mod watcher;

pub use event_loop::{EventLoop, LoopHandle, LoopState};
pub use executor::{Executor, Task, TimedExecutor, TimedTask};
pub use remote::{RemoteOwner, RemoteRef};
pub use thread_pool::ThreadPool;
pub use timer::{Timer, TimerState};
pub use watcher::Watcher;
