use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use courier_message::{Publisher, Subscriber};
use courier_reactor::EventLoop;

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn subscriber_sees_matching_topics_in_order() {
    let handle = EventLoop::background();

    let publisher = Publisher::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    publisher.open().unwrap();
    let endpoint = publisher.local_endpoint().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Subscriber::new(&handle);
    let sink = Arc::clone(&received);
    subscriber.set_recv_callback(move |_remote, message| {
        sink.lock().unwrap().push(message.to_vec());
    });
    subscriber.subscribe(endpoint, vec![b"time".to_vec()]);

    wait_until("the subscriber connection", || publisher.num_connections() == 1);

    publisher.send(b"time: 42");
    publisher.send(b"other");
    publisher.send(b"time: 43");

    wait_until("two matching messages", || received.lock().unwrap().len() == 2);
    thread::sleep(Duration::from_millis(50));

    assert_eq!(
        *received.lock().unwrap(),
        vec![b"time: 42".to_vec(), b"time: 43".to_vec()]
    );
}

#[test]
fn first_matching_prefix_dispatches_exactly_once() {
    let handle = EventLoop::background();

    let publisher = Publisher::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    publisher.open().unwrap();
    let endpoint = publisher.local_endpoint().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Subscriber::new(&handle);
    let sink = Arc::clone(&received);
    subscriber.set_recv_callback(move |_remote, message| {
        sink.lock().unwrap().push(message.to_vec());
    });
    // Overlapping prefixes must not duplicate the dispatch.
    subscriber.subscribe(endpoint, vec![b"tick".to_vec(), b"ti".to_vec()]);

    wait_until("the subscriber connection", || publisher.num_connections() == 1);

    publisher.send(b"tick 1");
    publisher.send(b"quiet");
    publisher.send(b"tide 2");

    wait_until("two matching messages", || received.lock().unwrap().len() >= 2);
    thread::sleep(Duration::from_millis(50));

    assert_eq!(
        *received.lock().unwrap(),
        vec![b"tick 1".to_vec(), b"tide 2".to_vec()]
    );
}

#[test]
fn over_limit_connections_are_discarded() {
    let handle = EventLoop::background();

    let publisher = Publisher::new(&handle, "tcp://127.0.0.1:0".parse().unwrap());
    publisher.configure(courier_message::PublisherConfig::default().with_max_connections(2));
    publisher.open().unwrap();
    let endpoint = publisher.local_endpoint().unwrap();

    let subscribers: Vec<Subscriber> = (0..4)
        .map(|_| {
            let subscriber = Subscriber::new(&handle);
            subscriber.subscribe(endpoint.clone(), vec![Vec::new()]);
            subscriber
        })
        .collect();

    wait_until("the connection cap", || publisher.num_connections() == 2);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(publisher.num_connections(), 2);

    drop(subscribers);
}
