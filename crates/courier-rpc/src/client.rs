use std::time::Duration;

use courier_message::{EndpointState, MultiplexingRequester, MuxRequesterConfig, WaitError};
use courier_net::Endpoint;
use courier_reactor::LoopHandle;
use tracing::warn;

use crate::{
    MAX_METHOD_NAME_LENGTH, STATUS_OK,
    error::RpcError,
    future::{CallFuture, call_pair},
};

/// Named-method call client atop the multiplexing protocol.
///
/// A request travels as `name_len:u8 name payload`; the reply as
/// `status:u8 result`. Every [`call`](Self::call) returns a future that is
/// guaranteed to terminate — at worst with [`RpcError::Cancelled`].
pub struct RpcClient {
    requester: MultiplexingRequester,
}

impl RpcClient {
    pub fn new(handle: &LoopHandle, remote: Endpoint) -> Self {
        Self { requester: MultiplexingRequester::new(handle, remote) }
    }

    pub fn handle(&self) -> &LoopHandle {
        self.requester.handle()
    }

    pub fn remote_endpoint(&self) -> Endpoint {
        self.requester.remote_endpoint()
    }

    /// Only while closed.
    pub fn configure(&self, config: MuxRequesterConfig) {
        self.requester.configure(config);
    }

    pub fn state(&self) -> EndpointState {
        self.requester.state()
    }

    pub fn open(&self) {
        self.requester.open();
    }

    /// Blocks the calling thread (never the loop thread) until connected;
    /// zero timeout waits forever.
    pub fn wait_for_connected(&self, timeout: Duration) -> Result<(), WaitError> {
        self.requester.wait_for_connected(timeout)
    }

    /// Invokes `method` on the server with `payload`.
    pub fn call(&self, method: &str, payload: &[u8]) -> CallFuture {
        assert!(
            method.len() <= MAX_METHOD_NAME_LENGTH,
            "method name exceeds {MAX_METHOD_NAME_LENGTH} bytes"
        );

        let (future, promise) = call_pair();
        let name_len = [method.len() as u8];

        self.requester.send_pieces(
            &[&name_len, method.as_bytes(), payload],
            move |reply| {
                promise.resolve(parse_reply(reply));
            },
            None,
        );

        future
    }

    pub fn num_pending_requests(&self) -> usize {
        self.requester.num_pending_requests()
    }

    pub fn close(&self) {
        self.requester.close();
    }
}

fn parse_reply(reply: &[u8]) -> Result<Vec<u8>, RpcError> {
    let Some((&status, result)) = reply.split_first() else {
        warn!("empty rpc reply");
        return Err(RpcError::BadReply);
    };

    if status == STATUS_OK {
        return Ok(result.to_vec());
    }
    Err(RpcError::from_code(status).unwrap_or(RpcError::BadReply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_parsing_covers_the_status_space() {
        assert_eq!(parse_reply(b"\x00ok"), Ok(b"ok".to_vec()));
        assert_eq!(parse_reply(b"\x01"), Err(RpcError::MethodNotFound));
        assert_eq!(parse_reply(b"\x02"), Err(RpcError::BadRequest));
        assert_eq!(parse_reply(b"\x04"), Err(RpcError::Cancelled));
        assert_eq!(parse_reply(b""), Err(RpcError::BadReply));
        assert_eq!(parse_reply(b"\x77junk"), Err(RpcError::BadReply));
    }
}
