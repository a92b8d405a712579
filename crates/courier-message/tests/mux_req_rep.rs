use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use courier_message::{
    MultiplexingReplier, MultiplexingRequester, MuxRequesterConfig,
};
use courier_reactor::EventLoop;

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn doubling_replier(handle: &courier_reactor::LoopHandle) -> MultiplexingReplier {
    let replier = MultiplexingReplier::new(handle, "tcp://127.0.0.1:0".parse().unwrap());
    replier.set_recv_callback(|_remote, payload, promise| {
        let n: u64 = std::str::from_utf8(payload).unwrap().parse().unwrap();
        promise.complete((n * 2).to_string().as_bytes());
    });
    replier.open().unwrap();
    replier
}

#[test]
fn a_thousand_outstanding_calls_all_resolve() {
    let handle = EventLoop::background();
    let replier = doubling_replier(&handle);
    let endpoint = replier.local_endpoint().unwrap();

    let requester = MultiplexingRequester::new(&handle, endpoint);
    requester.open();
    requester.wait_for_connected(Duration::from_secs(2)).unwrap();

    let replies: Arc<Mutex<HashMap<u64, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    for i in 0..1000_u64 {
        let sink = Arc::clone(&replies);
        requester.send(
            i.to_string().as_bytes(),
            move |reply| {
                sink.lock().unwrap().insert(i, reply.to_vec());
            },
            None,
        );
    }

    wait_until("all replies", || replies.lock().unwrap().len() == 1000);

    let replies = replies.lock().unwrap();
    for i in 0..1000_u64 {
        assert_eq!(replies[&i], (i * 2).to_string().into_bytes(), "call {i}");
    }
    assert_eq!(requester.num_pending_requests(), 0);
}

#[test]
fn unanswered_requests_time_out() {
    let handle = EventLoop::background();

    let replier = MultiplexingReplier::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    replier.set_recv_callback(|_remote, _payload, promise| {
        // Never answer.
        drop(promise);
    });
    replier.open().unwrap();
    let endpoint = replier.local_endpoint().unwrap();

    let requester = MultiplexingRequester::new(&handle, endpoint);
    requester.configure(
        MuxRequesterConfig::default().with_request_timeout(Duration::from_millis(50)),
    );
    requester.open();
    requester.wait_for_connected(Duration::from_secs(2)).unwrap();

    for _ in 0..8 {
        requester.send(b"silence", |_reply| panic!("a reply appeared"), None);
    }
    assert!(requester.num_pending_requests() > 0);

    // The sweep snapshots once per tick, so the worst case is two ticks.
    wait_until("the timeout sweep", || requester.num_pending_requests() == 0);
}

#[test]
fn overflow_evicts_the_oldest_request() {
    let handle = EventLoop::background();

    let replier = MultiplexingReplier::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    replier.set_recv_callback(|_remote, _payload, promise| drop(promise));
    replier.open().unwrap();
    let endpoint = replier.local_endpoint().unwrap();

    let requester = MultiplexingRequester::new(&handle, endpoint);
    requester.configure(MuxRequesterConfig::default().with_max_pending_requests(4));
    requester.open();
    requester.wait_for_connected(Duration::from_secs(2)).unwrap();

    for _ in 0..10 {
        requester.send(b"x", |_reply| {}, None);
    }
    assert_eq!(requester.num_pending_requests(), 4);
}
