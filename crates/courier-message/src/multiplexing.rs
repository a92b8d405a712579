use std::{
    cell::{Cell, RefCell},
    io,
    rc::{Rc, Weak},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use courier_net::Endpoint;
use courier_reactor::{Executor, LoopHandle, RemoteOwner, Timer};
use indexmap::IndexMap;
use tracing::warn;

use crate::{
    EndpointState, WaitError, await_signal,
    replier::{Promise, Replier, ReplierConfig},
    requester::{RequesterConfig, RequesterInner},
};

const REQUEST_ID_SIZE: usize = size_of::<u64>();

/// Process-wide; ids are monotonic and never recycled.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxRequesterConfig {
    /// Bound on in-flight requests; 0 means unbounded. Overflow evicts the
    /// oldest request, cancelling it.
    pub max_pending_requests: usize,
    /// Zero disables the timeout sweep. A pending request survives at most
    /// two sweep ticks, so the worst-case age is twice this.
    pub request_timeout: Duration,
    pub requester: RequesterConfig,
}

impl Default for MuxRequesterConfig {
    fn default() -> Self {
        Self {
            max_pending_requests: 0,
            request_timeout: Duration::ZERO,
            requester: RequesterConfig::default(),
        }
    }
}

impl MuxRequesterConfig {
    pub fn with_max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_requester(mut self, requester: RequesterConfig) -> Self {
        self.requester = requester;
        self
    }
}

/// Per-request reply callback. Runs at most once; if the request is
/// evicted, times out, or the connection closes first, the callback is
/// dropped uninvoked — owners that need a completion guarantee hook that
/// drop (see the RPC client).
pub type ReplyCallback = Box<dyn FnOnce(&[u8]) + Send + 'static>;

struct PendingRequest {
    callback: ReplyCallback,
    executor: Option<Arc<dyn Executor>>,
}

/// Request/reply client allowing many concurrent in-flight calls on one
/// connection: every outbound payload is tagged with a monotonic 64-bit
/// id which the reply echoes back.
pub struct MultiplexingRequester {
    owner: RemoteOwner<MuxRequesterInner>,
}

impl MultiplexingRequester {
    pub fn new(handle: &LoopHandle, remote: Endpoint) -> Self {
        let loop_handle = handle.clone();
        let owner = RemoteOwner::new(handle, move || MuxRequesterInner::new(&loop_handle, remote));
        Self { owner }
    }

    pub fn handle(&self) -> &LoopHandle {
        self.owner.handle()
    }

    pub fn remote_endpoint(&self) -> Endpoint {
        self.owner.with(|inner| inner.core.remote.clone())
    }

    /// Only while closed.
    pub fn configure(&self, config: MuxRequesterConfig) {
        self.owner.with(move |inner| inner.configure(config));
    }

    pub fn state(&self) -> EndpointState {
        self.owner.with(|inner| inner.core.state.get())
    }

    pub fn open(&self) {
        self.owner.with(|inner| inner.open());
    }

    /// Blocks the calling thread (never the loop thread) until the
    /// connection is established; zero timeout waits forever.
    pub fn wait_for_connected(&self, timeout: Duration) -> Result<(), WaitError> {
        assert!(
            !self.owner.handle().is_in_loop_thread(),
            "wait_for_connected would deadlock the loop"
        );

        let signal = crate::new_signal();
        let posted = Arc::clone(&signal);
        self.owner.post(move |inner| inner.core.notify_when_connected(posted));
        await_signal(&signal, timeout)
    }

    /// Sends `message` and registers `callback` for its reply. With an
    /// executor, the callback is posted there with an owned copy of the
    /// reply; otherwise it runs inline on the loop.
    pub fn send(
        &self,
        message: &[u8],
        callback: impl FnOnce(&[u8]) + Send + 'static,
        executor: Option<Arc<dyn Executor>>,
    ) {
        self.send_pieces(&[message], callback, executor);
    }

    /// Scatter variant of [`send`](Self::send).
    pub fn send_pieces(
        &self,
        pieces: &[&[u8]],
        callback: impl FnOnce(&[u8]) + Send + 'static,
        executor: Option<Arc<dyn Executor>>,
    ) {
        if let Some(inner) = self.owner.local() {
            inner.send(pieces, Box::new(callback), executor);
            return;
        }

        let flat: Vec<u8> = pieces.concat();
        self.owner.post(move |inner| inner.send(&[&flat], Box::new(callback), executor));
    }

    pub fn num_pending_requests(&self) -> usize {
        self.owner.with(|inner| inner.requests.borrow().len())
    }

    pub fn close(&self) {
        self.owner.with(|inner| inner.close());
    }
}

impl Drop for MultiplexingRequester {
    fn drop(&mut self) {
        self.close();
    }
}

struct MuxRequesterInner {
    handle: LoopHandle,
    core: Rc<RequesterInner>,
    max_pending_requests: Cell<usize>,
    request_timeout: Cell<Duration>,
    timer: RefCell<Option<Rc<Timer>>>,
    requests: RefCell<IndexMap<u64, PendingRequest>>,
    /// Ids seen pending at the previous sweep tick; still pending at the
    /// next tick means timed out.
    expiring: RefCell<Vec<u64>>,
    weak_self: RefCell<Weak<MuxRequesterInner>>,
}

impl MuxRequesterInner {
    fn new(handle: &LoopHandle, remote: Endpoint) -> Rc<Self> {
        let inner = Rc::new(Self {
            handle: handle.clone(),
            core: RequesterInner::new(handle, remote),
            max_pending_requests: Cell::new(0),
            request_timeout: Cell::new(Duration::ZERO),
            timer: RefCell::new(None),
            requests: RefCell::new(IndexMap::new()),
            expiring: RefCell::new(Vec::new()),
            weak_self: RefCell::new(Weak::new()),
        });
        *inner.weak_self.borrow_mut() = Rc::downgrade(&inner);
        inner
    }

    fn configure(&self, config: MuxRequesterConfig) {
        assert!(self.core.state.get() == EndpointState::Closed);

        self.max_pending_requests.set(config.max_pending_requests);
        self.request_timeout.set(config.request_timeout);
        self.core.configure(config.requester);
    }

    fn open(&self) {
        assert!(self.core.state.get() == EndpointState::Closed);

        let weak = self.weak_self.borrow().clone();
        self.core.set_recv_tap(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_reply(message);
            }
        });

        // A transport close cancels everything in flight; request ids do
        // not survive reconnection.
        let weak = self.weak_self.borrow().clone();
        self.core.set_close_tap(move |_error| {
            if let Some(inner) = weak.upgrade() {
                let mut requests = inner.requests.borrow_mut();
                if !requests.is_empty() {
                    warn!(
                        count = requests.len(),
                        "connection closed; cancelling in-flight requests"
                    );
                    requests.clear();
                }
                drop(requests);
                inner.expiring.borrow_mut().clear();
            }
        });

        self.core.open();

        let timeout = self.request_timeout.get();
        if !timeout.is_zero() {
            let timer = Timer::new(&self.handle);
            let weak = self.weak_self.borrow().clone();
            timer.add_expire_callback(move || {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                inner.on_sweep();
                true
            });
            timer.open();
            timer.set_time(timeout, timeout);
            *self.timer.borrow_mut() = Some(timer);
        }
    }

    fn send(&self, pieces: &[&[u8]], callback: ReplyCallback, executor: Option<Arc<dyn Executor>>) {
        if self.core.state.get() != EndpointState::Opened {
            warn!("request on a closed requester cancelled");
            drop(callback);
            return;
        }

        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        {
            let mut requests = self.requests.borrow_mut();
            let max = self.max_pending_requests.get();
            if max > 0 && requests.len() >= max {
                warn!("too many pending requests; evicting the oldest");
                requests.shift_remove_index(0);
            }
            requests.insert(id, PendingRequest { callback, executor });
        }

        let id_le = id.to_le_bytes();
        let mut wire: Vec<&[u8]> = Vec::with_capacity(1 + pieces.len());
        wire.push(&id_le);
        wire.extend_from_slice(pieces);
        self.core.send(&wire);
    }

    fn close(&self) {
        if self.core.state.get() == EndpointState::Closed {
            return;
        }

        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.reset();
        }
        // Cancels whatever is still in flight.
        self.requests.borrow_mut().clear();
        self.expiring.borrow_mut().clear();

        self.core.close();
    }

    fn on_reply(&self, message: &[u8]) {
        if message.len() < REQUEST_ID_SIZE {
            warn!(len = message.len(), "short multiplexed reply dropped");
            return;
        }

        let id = u64::from_le_bytes(message[..REQUEST_ID_SIZE].try_into().unwrap());
        let pending = self.requests.borrow_mut().shift_remove(&id);
        let Some(pending) = pending else {
            warn!(id, "reply for an unknown request");
            return;
        };

        let payload = &message[REQUEST_ID_SIZE..];
        match pending.executor {
            None => (pending.callback)(payload),
            Some(executor) => {
                let bytes = payload.to_vec();
                let callback = pending.callback;
                executor.post(Box::new(move || callback(&bytes)));
            }
        }
    }

    /// Two-phase sweep: anything snapshotted last tick and still pending
    /// now has waited at least one full timeout interval.
    fn on_sweep(&self) {
        let expired = std::mem::take(&mut *self.expiring.borrow_mut());
        {
            let mut requests = self.requests.borrow_mut();
            for id in expired {
                if requests.shift_remove(&id).is_some() {
                    warn!(id, "request timed out");
                }
            }
        }
        *self.expiring.borrow_mut() = self.requests.borrow().keys().copied().collect();
    }
}

/// Request/reply server side of the multiplexing protocol: strips the
/// 8-byte request id and hands out promises that put it back.
pub struct MultiplexingReplier {
    replier: Replier,
}

/// One-shot reply completion that re-prepends the request id.
pub struct MuxPromise {
    request_id: [u8; REQUEST_ID_SIZE],
    inner: Promise,
}

impl MuxPromise {
    pub fn complete(self, reply: &[u8]) {
        self.inner.complete_pieces(&[&self.request_id, reply]);
    }

    pub fn complete_pieces(self, pieces: &[&[u8]]) {
        let mut wire: Vec<&[u8]> = Vec::with_capacity(1 + pieces.len());
        wire.push(&self.request_id);
        wire.extend_from_slice(pieces);
        self.inner.complete_pieces(&wire);
    }
}

impl MultiplexingReplier {
    pub fn new(handle: &LoopHandle, local: Endpoint) -> Self {
        Self { replier: Replier::new(handle, local) }
    }

    pub fn handle(&self) -> &LoopHandle {
        self.replier.handle()
    }

    /// Only while closed.
    pub fn configure(&self, config: ReplierConfig) {
        self.replier.configure(config);
    }

    pub fn set_recv_callback(
        &self,
        callback: impl Fn(&Endpoint, &[u8], MuxPromise) + Send + Sync + 'static,
    ) {
        self.replier.set_recv_callback(move |remote, message, promise| {
            if message.len() < REQUEST_ID_SIZE {
                warn!(len = message.len(), "short multiplexed request dropped");
                return;
            }
            let mut request_id = [0_u8; REQUEST_ID_SIZE];
            request_id.copy_from_slice(&message[..REQUEST_ID_SIZE]);
            callback(
                remote,
                &message[REQUEST_ID_SIZE..],
                MuxPromise { request_id, inner: promise },
            );
        });
    }

    /// Handlers are posted to `executor` with an owned copy of the request
    /// instead of running inline on the loop.
    pub fn set_recv_executor(&self, executor: Option<Arc<dyn Executor>>) {
        self.replier.set_recv_executor(executor);
    }

    pub fn state(&self) -> EndpointState {
        self.replier.state()
    }

    pub fn open(&self) -> io::Result<()> {
        self.replier.open()
    }

    /// The bound address; with a port-0 bind this carries the port the
    /// kernel picked.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.replier.local_endpoint()
    }

    pub fn close(&self) {
        self.replier.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_process_unique() {
        let a = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let b = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        assert!(b > a);
    }
}
