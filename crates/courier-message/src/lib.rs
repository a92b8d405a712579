use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use courier_net::{KeepAlive, SocketConfig};
use thiserror::Error;

mod multiplexing;
mod publisher;
mod replier;
mod requester;
mod subscriber;

pub use multiplexing::{
    MultiplexingReplier, MultiplexingRequester, MuxPromise, MuxRequesterConfig,
};
pub use publisher::{Publisher, PublisherConfig};
pub use replier::{Promise, Replier, ReplierConfig};
pub use requester::{Requester, RequesterConfig};
pub use subscriber::{Subscriber, SubscriberConfig};

/// Lifecycle of a message-pattern endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Closed,
    Opened,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out waiting for the connection")]
    TimedOut,
}

/// Socket tuning for client-side (connecting) patterns.
fn client_socket_config() -> SocketConfig {
    SocketConfig::default()
        .with_no_delay(true)
        .with_send_timeout(Duration::from_secs(30))
        .with_keep_alive(KeepAlive::new(
            Duration::from_secs(120),
            Duration::from_secs(20),
            3,
        ))
}

/// Server-side template also bounds how long a half-received message may
/// stall.
fn server_socket_config() -> SocketConfig {
    client_socket_config().with_recv_timeout(Duration::from_secs(30))
}

pub(crate) type Signal = Arc<(Mutex<bool>, Condvar)>;

pub(crate) fn new_signal() -> Signal {
    Arc::new((Mutex::new(false), Condvar::new()))
}

pub(crate) fn raise_signal(signal: &Signal) {
    let (flag, condvar) = &**signal;
    *flag.lock().expect("signal poisoned") = true;
    condvar.notify_all();
}

/// Blocks until the signal is raised; zero timeout waits forever.
pub(crate) fn await_signal(signal: &Signal, timeout: Duration) -> Result<(), WaitError> {
    let (flag, condvar) = &**signal;
    let mut raised = flag.lock().expect("signal poisoned");

    if timeout.is_zero() {
        while !*raised {
            raised = condvar.wait(raised).expect("signal poisoned");
        }
        return Ok(());
    }

    let (raised, result) = condvar
        .wait_timeout_while(raised, timeout, |raised| !*raised)
        .expect("signal poisoned");
    if result.timed_out() && !*raised { Err(WaitError::TimedOut) } else { Ok(()) }
}
