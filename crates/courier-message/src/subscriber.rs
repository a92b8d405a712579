use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    sync::Arc,
    time::Duration,
};

use courier_net::{Endpoint, FramingConfig, FramingSocket, SocketState};
use courier_reactor::{Executor, LoopHandle, RemoteOwner};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::{EndpointState, client_socket_config};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Zero disables auto-reconnect of dropped publisher connections.
    pub reconnect_interval: Duration,
    pub framing: FramingConfig,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::ZERO,
            framing: FramingConfig::default().with_socket(client_socket_config()),
        }
    }
}

impl SubscriberConfig {
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_framing(mut self, framing: FramingConfig) -> Self {
        self.framing = framing;
        self
    }
}

/// Topic-filtered receive side of publish/subscribe: one connection per
/// publisher, each with its own topic-prefix list. A message is dispatched
/// once, on the first prefix (in registration order) that matches.
pub struct Subscriber {
    owner: RemoteOwner<SubscriberInner>,
}

impl Subscriber {
    pub fn new(handle: &LoopHandle) -> Self {
        let loop_handle = handle.clone();
        let owner = RemoteOwner::new(handle, move || SubscriberInner::new(&loop_handle));
        Self { owner }
    }

    pub fn handle(&self) -> &LoopHandle {
        self.owner.handle()
    }

    /// Only while no subscriptions exist.
    pub fn configure(&self, config: SubscriberConfig) {
        self.owner.with(move |inner| {
            assert!(inner.state.get() == EndpointState::Closed);
            *inner.config.borrow_mut() = config;
        });
    }

    pub fn set_recv_callback(&self, callback: impl Fn(&Endpoint, &[u8]) + Send + Sync + 'static) {
        self.owner.with(move |inner| {
            assert!(inner.state.get() == EndpointState::Closed);
            *inner.recv_callback.borrow_mut() = Some(Arc::new(callback));
        });
    }

    /// Matched messages are posted to `executor` with an owned copy instead
    /// of running inline on the loop.
    pub fn set_recv_executor(&self, executor: Option<Arc<dyn Executor>>) {
        self.owner.with(move |inner| {
            assert!(inner.state.get() == EndpointState::Closed);
            *inner.recv_executor.borrow_mut() = executor;
        });
    }

    pub fn state(&self) -> EndpointState {
        self.owner.with(|inner| inner.state.get())
    }

    /// Connects to `remote` and filters its stream by `topics`.
    /// Subscribing twice to the same endpoint is a programmer error.
    pub fn subscribe(&self, remote: Endpoint, topics: Vec<Vec<u8>>) {
        self.owner.with(move |inner| inner.subscribe(&remote, topics));
    }

    pub fn unsubscribe(&self, remote: Endpoint) {
        self.owner.with(move |inner| inner.unsubscribe(&remote));
    }

    pub fn close(&self) {
        self.owner.with(|inner| inner.close());
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

struct Subscription {
    socket: Rc<FramingSocket>,
    topics: Vec<Vec<u8>>,
}

struct SubscriberInner {
    handle: LoopHandle,
    config: RefCell<SubscriberConfig>,
    state: Cell<EndpointState>,
    subscriptions: RefCell<IndexMap<Endpoint, Subscription>>,
    token: RefCell<Option<Arc<()>>>,
    weak_self: RefCell<Weak<SubscriberInner>>,
    recv_callback: RefCell<Option<Arc<dyn Fn(&Endpoint, &[u8]) + Send + Sync>>>,
    recv_executor: RefCell<Option<Arc<dyn Executor>>>,
}

impl SubscriberInner {
    fn new(handle: &LoopHandle) -> Rc<Self> {
        let inner = Rc::new(Self {
            handle: handle.clone(),
            config: RefCell::new(SubscriberConfig::default()),
            state: Cell::new(EndpointState::Closed),
            subscriptions: RefCell::new(IndexMap::new()),
            token: RefCell::new(None),
            weak_self: RefCell::new(Weak::new()),
            recv_callback: RefCell::new(None),
            recv_executor: RefCell::new(None),
        });
        *inner.weak_self.borrow_mut() = Rc::downgrade(&inner);
        inner
    }

    fn subscribe(&self, remote: &Endpoint, topics: Vec<Vec<u8>>) {
        assert!(
            !self.subscriptions.borrow().contains_key(remote),
            "already subscribed to {remote}"
        );
        debug!(remote = %remote, topics = topics.len(), "subscribing");

        if self.subscriptions.borrow().is_empty() {
            self.state.set(EndpointState::Opened);
            *self.token.borrow_mut() = Some(Arc::new(()));
        }

        let config = self.config.borrow().clone();
        let socket = FramingSocket::new(&self.handle, config.framing);

        let weak = self.weak_self.borrow().clone();
        let remote_for_recv = remote.clone();
        socket.add_recv_callback(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_socket_recv(&remote_for_recv, message);
            }
            true
        });

        if !config.reconnect_interval.is_zero() {
            let weak = self.weak_self.borrow().clone();
            let remote_on_error = remote.clone();
            socket.add_connect_callback(move |error| {
                if error != 0 {
                    if let Some(inner) = weak.upgrade() {
                        inner.schedule_reconnect(&remote_on_error);
                    }
                }
                true
            });

            let weak = self.weak_self.borrow().clone();
            let remote_on_close = remote.clone();
            socket.add_close_callback(move |_error| {
                if let Some(inner) = weak.upgrade() {
                    inner.schedule_reconnect(&remote_on_close);
                }
                true
            });
        }

        self.subscriptions
            .borrow_mut()
            .insert(remote.clone(), Subscription { socket: Rc::clone(&socket), topics });
        socket.open(remote);
    }

    fn unsubscribe(&self, remote: &Endpoint) {
        let removed = self.subscriptions.borrow_mut().shift_remove(remote);
        let Some(subscription) = removed else {
            warn!(remote = %remote, "unsubscribe without a subscription");
            return;
        };
        debug!(remote = %remote, "unsubscribed");

        subscription.socket.reset();
        let socket = subscription.socket;
        self.handle.post_local(move || drop(socket));

        if self.subscriptions.borrow().is_empty() {
            self.state.set(EndpointState::Closed);
            *self.token.borrow_mut() = None;
        }
    }

    fn close(&self) {
        if self.state.get() == EndpointState::Closed {
            return;
        }
        self.state.set(EndpointState::Closed);
        *self.token.borrow_mut() = None;

        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        for (_, subscription) in subscriptions {
            subscription.socket.reset();
            let socket = subscription.socket;
            self.handle.post_local(move || drop(socket));
        }
    }

    fn on_socket_recv(&self, remote: &Endpoint, message: &[u8]) {
        let matched = self
            .subscriptions
            .borrow()
            .get(remote)
            .is_some_and(|s| s.topics.iter().any(|topic| message.starts_with(topic)));
        if !matched {
            return;
        }

        let callback = self.recv_callback.borrow().clone();
        let Some(callback) = callback else {
            return;
        };

        let executor = self.recv_executor.borrow().clone();
        match executor {
            None => callback(remote, message),
            Some(executor) => {
                let Some(token) = self.token.borrow().as_ref().map(Arc::downgrade) else {
                    return;
                };
                let bytes = message.to_vec();
                let remote = remote.clone();
                executor.post(Box::new(move || {
                    if token.upgrade().is_some() {
                        callback(&remote, &bytes);
                    }
                }));
            }
        }
    }

    fn schedule_reconnect(&self, remote: &Endpoint) {
        let Some(token) = self.token.borrow().as_ref().map(Arc::downgrade) else {
            return;
        };
        let weak = self.weak_self.borrow().clone();
        let remote = remote.clone();
        let interval = self.config.borrow().reconnect_interval;

        self.handle.post_timed_local(
            move || {
                if token.upgrade().is_some() {
                    if let Some(inner) = weak.upgrade() {
                        let socket = inner
                            .subscriptions
                            .borrow()
                            .get(&remote)
                            .map(|s| Rc::clone(&s.socket));
                        if let Some(socket) = socket {
                            if socket.state() == SocketState::Closed {
                                debug!(remote = %remote, "reconnecting");
                                socket.open(&remote);
                            }
                        }
                    }
                }
                Duration::ZERO
            },
            interval,
        );
    }
}
