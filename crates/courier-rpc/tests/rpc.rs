use std::{sync::Arc, time::Duration};

use courier_message::{MultiplexingReplier, MuxRequesterConfig};
use courier_reactor::{EventLoop, ThreadPool};
use courier_rpc::{RpcClient, RpcError, RpcServer};

fn increment_server(handle: &courier_reactor::LoopHandle) -> RpcServer {
    let server = RpcServer::new(handle, "tcp://127.0.0.1:0".parse().unwrap());
    server.register_method("increment", |_remote, payload| {
        match std::str::from_utf8(payload).ok().and_then(|s| s.parse::<i64>().ok()) {
            Some(n) => (n + 1).to_string().into_bytes(),
            // The server chose to encode the error in the payload; the
            // status stays Ok.
            None => b"invalid".to_vec(),
        }
    });
    server.open().unwrap();
    server
}

fn connected_client(server: &RpcServer) -> RpcClient {
    let client = RpcClient::new(server.handle(), server.local_endpoint().unwrap());
    client.open();
    client.wait_for_connected(Duration::from_secs(2)).unwrap();
    client
}

#[test]
fn increment_round_trip() {
    let handle = EventLoop::background();
    let server = increment_server(&handle);
    let client = connected_client(&server);

    assert_eq!(client.call("increment", b"42").wait(), Ok(b"43".to_vec()));
}

#[test]
fn unknown_method_is_reported() {
    let handle = EventLoop::background();
    let server = increment_server(&handle);
    let client = connected_client(&server);

    assert_eq!(client.call("missing", b"x").wait(), Err(RpcError::MethodNotFound));
}

#[test]
fn handler_level_errors_ride_on_ok() {
    let handle = EventLoop::background();
    let server = increment_server(&handle);
    let client = connected_client(&server);

    assert_eq!(client.call("increment", b"abc").wait(), Ok(b"invalid".to_vec()));
}

#[test]
fn concurrent_calls_resolve_independently() {
    let handle = EventLoop::background();
    let server = increment_server(&handle);
    let client = connected_client(&server);

    let futures: Vec<_> =
        (0..100_i64).map(|i| (i, client.call("increment", i.to_string().as_bytes()))).collect();
    for (i, future) in futures {
        assert_eq!(future.wait(), Ok((i + 1).to_string().into_bytes()), "call {i}");
    }
}

#[test]
fn executor_backed_method_replies_from_the_pool() {
    let handle = EventLoop::background();
    let pool: Arc<dyn courier_reactor::Executor> = Arc::new(ThreadPool::new(2));

    let server = RpcServer::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    server.register_method_with_executor(
        "shout",
        |_remote, payload| payload.to_ascii_uppercase(),
        Arc::clone(&pool),
    );
    server.open().unwrap();
    let client = connected_client(&server);

    assert_eq!(client.call("shout", b"quiet").wait(), Ok(b"QUIET".to_vec()));
}

#[test]
fn timed_out_call_resolves_to_cancelled() {
    let handle = EventLoop::background();

    // A multiplexing replier that never answers.
    let replier = MultiplexingReplier::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    replier.set_recv_callback(|_remote, _payload, promise| drop(promise));
    replier.open().unwrap();

    let client = RpcClient::new(&handle, replier.local_endpoint().unwrap());
    client.configure(
        MuxRequesterConfig::default().with_request_timeout(Duration::from_millis(50)),
    );
    client.open();
    client.wait_for_connected(Duration::from_secs(2)).unwrap();

    assert_eq!(client.call("void", b"").wait(), Err(RpcError::Cancelled));
    assert_eq!(client.num_pending_requests(), 0);
}

#[test]
fn closing_the_client_cancels_outstanding_calls() {
    let handle = EventLoop::background();

    let replier = MultiplexingReplier::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    replier.set_recv_callback(|_remote, _payload, promise| drop(promise));
    replier.open().unwrap();

    let client = RpcClient::new(&handle, replier.local_endpoint().unwrap());
    client.open();
    client.wait_for_connected(Duration::from_secs(2)).unwrap();

    let future = client.call("void", b"");
    client.close();
    assert_eq!(future.wait(), Err(RpcError::Cancelled));
}
