use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, Weak},
};

use courier_message::{EndpointState, MultiplexingReplier, MuxPromise, ReplierConfig};
use courier_net::Endpoint;
use courier_reactor::{Executor, LoopHandle};
use tracing::warn;

use crate::{MAX_METHOD_NAME_LENGTH, STATUS_OK, error::RpcError};

/// A registered method: request payload in, reply payload out.
pub type Method = Arc<dyn Fn(&Endpoint, &[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
struct MethodEntry {
    method: Method,
    executor: Option<Arc<dyn Executor>>,
}

type MethodMap = HashMap<String, MethodEntry>;

/// Named-method call server: parses `name_len:u8 name payload` requests,
/// dispatches to registered handlers, and answers `status:u8 result`.
///
/// Methods are registered while closed. A handler with an executor runs
/// there and completes the reply from that thread; otherwise it runs
/// inline on the loop.
pub struct RpcServer {
    replier: MultiplexingReplier,
    methods: Arc<Mutex<MethodMap>>,
    /// Present while open; gates executor-dispatched handlers so a closed
    /// server stops invoking user code.
    open_token: Arc<Mutex<Option<Arc<()>>>>,
}

impl RpcServer {
    pub fn new(handle: &LoopHandle, local: Endpoint) -> Self {
        let methods: Arc<Mutex<MethodMap>> = Arc::new(Mutex::new(HashMap::new()));
        let open_token: Arc<Mutex<Option<Arc<()>>>> = Arc::new(Mutex::new(None));

        let replier = MultiplexingReplier::new(handle, local);
        let table = Arc::clone(&methods);
        let token_slot = Arc::clone(&open_token);
        replier.set_recv_callback(move |remote, message, promise| {
            dispatch(&table, &token_slot, remote, message, promise);
        });

        Self { replier, methods, open_token }
    }

    pub fn handle(&self) -> &LoopHandle {
        self.replier.handle()
    }

    /// Only while closed.
    pub fn configure(&self, config: ReplierConfig) {
        self.replier.configure(config);
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.lock().expect("method table poisoned").contains_key(name)
    }

    pub fn register_method(
        &self,
        name: impl Into<String>,
        method: impl Fn(&Endpoint, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) {
        self.insert_method(name.into(), Arc::new(method), None);
    }

    /// The handler runs on `executor` and the reply is completed from
    /// there.
    pub fn register_method_with_executor(
        &self,
        name: impl Into<String>,
        method: impl Fn(&Endpoint, &[u8]) -> Vec<u8> + Send + Sync + 'static,
        executor: Arc<dyn Executor>,
    ) {
        self.insert_method(name.into(), Arc::new(method), Some(executor));
    }

    pub fn unregister_method(&self, name: &str) {
        assert!(self.state() == EndpointState::Closed, "method table changed while open");

        self.methods.lock().expect("method table poisoned").remove(name);
    }

    pub fn unregister_all_methods(&self) {
        assert!(self.state() == EndpointState::Closed, "method table changed while open");

        self.methods.lock().expect("method table poisoned").clear();
    }

    pub fn state(&self) -> EndpointState {
        self.replier.state()
    }

    pub fn open(&self) -> io::Result<()> {
        self.replier.open()?;
        *self.open_token.lock().expect("open token poisoned") = Some(Arc::new(()));
        Ok(())
    }

    /// The bound address; with a port-0 bind this carries the port the
    /// kernel picked.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.replier.local_endpoint()
    }

    pub fn close(&self) {
        *self.open_token.lock().expect("open token poisoned") = None;
        self.replier.close();
    }

    fn insert_method(&self, name: String, method: Method, executor: Option<Arc<dyn Executor>>) {
        assert!(self.state() == EndpointState::Closed, "method table changed while open");
        assert!(
            name.len() <= MAX_METHOD_NAME_LENGTH,
            "method name exceeds {MAX_METHOD_NAME_LENGTH} bytes"
        );

        self.methods
            .lock()
            .expect("method table poisoned")
            .insert(name, MethodEntry { method, executor });
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn dispatch(
    table: &Mutex<MethodMap>,
    token_slot: &Mutex<Option<Arc<()>>>,
    remote: &Endpoint,
    message: &[u8],
    promise: MuxPromise,
) {
    let Some((&name_len, rest)) = message.split_first() else {
        warn!("empty rpc request");
        promise.complete(&[RpcError::BadRequest.code()]);
        return;
    };
    let name_len = name_len as usize;
    if rest.len() < name_len {
        warn!("truncated rpc request");
        promise.complete(&[RpcError::BadRequest.code()]);
        return;
    }

    let (name, payload) = rest.split_at(name_len);
    let Ok(name) = std::str::from_utf8(name) else {
        warn!("non-utf8 method name");
        promise.complete(&[RpcError::MethodNotFound.code()]);
        return;
    };

    let entry = table.lock().expect("method table poisoned").get(name).cloned();
    let Some(entry) = entry else {
        warn!(method = name, "method not found");
        promise.complete(&[RpcError::MethodNotFound.code()]);
        return;
    };

    match entry.executor {
        None => {
            let result = (entry.method)(remote, payload);
            promise.complete_pieces(&[&[STATUS_OK], &result]);
        }
        Some(executor) => {
            let token: Option<Weak<()>> = token_slot
                .lock()
                .expect("open token poisoned")
                .as_ref()
                .map(Arc::downgrade);
            let Some(token) = token else {
                // Server already closed; no reply.
                return;
            };

            let method = entry.method;
            let remote = remote.clone();
            let payload = payload.to_vec();
            executor.post(Box::new(move || {
                if token.upgrade().is_none() {
                    return;
                }
                let result = method(&remote, &payload);
                promise.complete_pieces(&[&[STATUS_OK], &result]);
            }));
        }
    }
}
