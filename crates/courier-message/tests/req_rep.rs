use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use courier_message::{Replier, Requester};
use courier_reactor::{EventLoop, Executor, ThreadPool};

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn uppercase_echo_round_trip() {
    let handle = EventLoop::background();

    let replier = Replier::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    replier.set_recv_callback(|_remote, message, promise| {
        promise.complete(&message.to_ascii_uppercase());
    });
    replier.open().unwrap();
    let endpoint = replier.local_endpoint().unwrap();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let requester = Requester::new(&handle, endpoint);
    let sink = Arc::clone(&replies);
    requester.set_recv_callback(move |message| {
        sink.lock().unwrap().push(message.to_vec());
    });
    requester.open();
    requester.wait_for_connected(Duration::from_secs(2)).unwrap();

    requester.send(b"hello");

    wait_until("the reply", || !replies.lock().unwrap().is_empty());
    assert_eq!(replies.lock().unwrap()[0], b"HELLO");
}

#[test]
fn handler_may_complete_from_a_worker_thread() {
    let handle = EventLoop::background();
    let pool: Arc<dyn Executor> = Arc::new(ThreadPool::new(2));

    let replier = Replier::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    replier.set_recv_executor(Some(Arc::clone(&pool)));
    replier.set_recv_callback(|_remote, message, promise| {
        // Runs on the pool; the promise routes the reply back through the
        // loop.
        let mut reply = message.to_vec();
        reply.reverse();
        promise.complete(&reply);
    });
    replier.open().unwrap();
    let endpoint = replier.local_endpoint().unwrap();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let requester = Requester::new(&handle, endpoint);
    let sink = Arc::clone(&replies);
    requester.set_recv_callback(move |message| {
        sink.lock().unwrap().push(message.to_vec());
    });
    requester.open();
    requester.wait_for_connected(Duration::from_secs(2)).unwrap();

    requester.send(b"abc");

    wait_until("the reply", || !replies.lock().unwrap().is_empty());
    assert_eq!(replies.lock().unwrap()[0], b"cba");
}

#[test]
fn dropped_promise_means_no_reply() {
    let handle = EventLoop::background();

    let replier = Replier::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    let asked = Arc::new(Mutex::new(0_usize));
    let seen = Arc::clone(&asked);
    replier.set_recv_callback(move |_remote, _message, promise| {
        *seen.lock().unwrap() += 1;
        drop(promise);
    });
    replier.open().unwrap();
    let endpoint = replier.local_endpoint().unwrap();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let requester = Requester::new(&handle, endpoint);
    let sink = Arc::clone(&replies);
    requester.set_recv_callback(move |message| {
        sink.lock().unwrap().push(message.to_vec());
    });
    requester.open();
    requester.wait_for_connected(Duration::from_secs(2)).unwrap();

    requester.send(b"anyone there");

    wait_until("the request to arrive", || *asked.lock().unwrap() == 1);
    thread::sleep(Duration::from_millis(100));
    assert!(replies.lock().unwrap().is_empty());
}
