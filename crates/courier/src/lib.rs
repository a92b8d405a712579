//! In-process messaging and RPC runtime for TCP and Unix-domain
//! transports: a single-threaded reactor, buffered non-blocking sockets,
//! length-prefixed framing, and four message patterns layered on top —
//! publish/subscribe, request/reply, multiplexed request/reply, and
//! named-method RPC.

pub use courier_message as message;
pub use courier_net as net;
pub use courier_reactor as reactor;
pub use courier_rpc as rpc;
pub use tracing;
