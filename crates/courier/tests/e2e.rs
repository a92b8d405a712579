use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use courier::{
    message::{Publisher, Subscriber},
    net::Endpoint,
    reactor::EventLoop,
    rpc::{RpcClient, RpcError, RpcServer},
};

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn rpc_over_a_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint: Endpoint =
        format!("unix://{}", dir.path().join("rpc.sock").display()).parse().unwrap();
    let handle = EventLoop::background();

    let server = RpcServer::new(&handle, endpoint.clone());
    server.register_method("sum", |_remote, payload| {
        let total: u64 = std::str::from_utf8(payload)
            .unwrap()
            .split(',')
            .map(|part| part.parse::<u64>().unwrap())
            .sum();
        total.to_string().into_bytes()
    });
    server.open().unwrap();

    let client = RpcClient::new(&handle, endpoint);
    client.open();
    client.wait_for_connected(Duration::from_secs(2)).unwrap();

    assert_eq!(client.call("sum", b"1,2,3").wait(), Ok(b"6".to_vec()));
    assert_eq!(client.call("product", b"1,2,3").wait(), Err(RpcError::MethodNotFound));
}

#[test]
fn pub_sub_over_a_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint: Endpoint =
        format!("unix://{}", dir.path().join("bus.sock").display()).parse().unwrap();
    let handle = EventLoop::background();

    let publisher = Publisher::new(&handle, endpoint.clone());
    publisher.open().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Subscriber::new(&handle);
    let sink = Arc::clone(&received);
    subscriber.set_recv_callback(move |_remote, message| {
        sink.lock().unwrap().push(message.to_vec());
    });
    subscriber.subscribe(endpoint, vec![b"metrics/".to_vec()]);

    wait_until("the subscriber connection", || publisher.num_connections() == 1);

    publisher.send(b"metrics/cpu 42");
    publisher.send(b"logs/noise");
    publisher.send(b"metrics/mem 7");

    wait_until("the filtered feed", || received.lock().unwrap().len() == 2);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        *received.lock().unwrap(),
        vec![b"metrics/cpu 42".to_vec(), b"metrics/mem 7".to_vec()]
    );
}
