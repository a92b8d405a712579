mod client;
mod error;
mod future;
mod server;

pub use client::RpcClient;
pub use error::RpcError;
pub use future::CallFuture;
pub use server::RpcServer;

/// Status byte of a successful reply; error statuses are [`RpcError`]
/// codes.
pub(crate) const STATUS_OK: u8 = 0;

/// A method name travels as a single length byte followed by the name.
pub(crate) const MAX_METHOD_NAME_LENGTH: usize = u8::MAX as usize;
