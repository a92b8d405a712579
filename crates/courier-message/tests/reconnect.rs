use std::{
    net::TcpListener,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use courier_message::{Replier, Requester, RequesterConfig};
use courier_reactor::EventLoop;

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// The requester starts before any server exists; once the server shows up,
/// auto-reconnect finds it and traffic flows.
#[test]
fn requester_reconnects_to_a_late_server() {
    // Pick a port that is free right now.
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let endpoint: courier_net::Endpoint = format!("tcp://127.0.0.1:{port}").parse().unwrap();

    let handle = EventLoop::background();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let requester = Requester::new(&handle, endpoint.clone());
    requester.configure(
        RequesterConfig::default().with_reconnect_interval(Duration::from_millis(100)),
    );
    let sink = Arc::clone(&replies);
    requester.set_recv_callback(move |message| {
        sink.lock().unwrap().push(message.to_vec());
    });
    requester.open();

    // No listener yet: the wait must time out without disturbing the
    // retry cycle.
    assert!(requester.wait_for_connected(Duration::from_millis(200)).is_err());

    thread::sleep(Duration::from_millis(300));

    let replier = Replier::new(&handle, endpoint);
    replier.set_recv_callback(|_remote, message, promise| {
        promise.complete(&message.to_ascii_uppercase());
    });
    replier.open().unwrap();

    requester.wait_for_connected(Duration::from_secs(2)).unwrap();

    requester.send(b"finally");
    wait_until("the reply", || !replies.lock().unwrap().is_empty());
    assert_eq!(replies.lock().unwrap()[0], b"FINALLY");
}

/// A server restart cancels nothing at the transport level the requester
/// can see; it simply reconnects and keeps going.
#[test]
fn requester_survives_a_server_restart() {
    let handle = EventLoop::background();

    let replier = Replier::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    replier.set_recv_callback(|_remote, message, promise| promise.complete(message));
    replier.open().unwrap();
    let endpoint = replier.local_endpoint().unwrap();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let requester = Requester::new(&handle, endpoint.clone());
    requester.configure(
        RequesterConfig::default().with_reconnect_interval(Duration::from_millis(50)),
    );
    let sink = Arc::clone(&replies);
    requester.set_recv_callback(move |message| {
        sink.lock().unwrap().push(message.to_vec());
    });
    requester.open();
    requester.wait_for_connected(Duration::from_secs(2)).unwrap();

    requester.send(b"one");
    wait_until("the first reply", || replies.lock().unwrap().len() == 1);

    // Restart the server on the same address.
    replier.close();
    let replier = Replier::new(&handle, endpoint);
    replier.set_recv_callback(|_remote, message, promise| promise.complete(message));
    replier.open().unwrap();

    requester.wait_for_connected(Duration::from_secs(2)).unwrap();
    requester.send(b"two");
    wait_until("the second reply", || replies.lock().unwrap().len() == 2);
    assert_eq!(*replies.lock().unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
}
