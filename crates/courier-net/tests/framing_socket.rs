use std::{
    io::{Read, Write},
    net::TcpListener,
    rc::Rc,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use courier_net::{Endpoint, FramingConfig, FramingSocket, SocketState};
use courier_reactor::{EventLoop, RemoteOwner};

struct Client {
    socket: Rc<FramingSocket>,
}

fn framed(payload: &[u8]) -> Vec<u8> {
    let mut wire = (payload.len() as u32).to_le_bytes().to_vec();
    wire.extend_from_slice(payload);
    wire
}

fn read_frame(stream: &mut impl Read) -> Option<Vec<u8>> {
    let mut header = [0_u8; 4];
    stream.read_exact(&mut header).ok()?;
    let mut payload = vec![0_u8; u32::from_le_bytes(header) as usize];
    stream.read_exact(&mut payload).ok()?;
    Some(payload)
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn spawn_client(
    config: FramingConfig,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<Mutex<Vec<i32>>>,
) -> (courier_reactor::LoopHandle, RemoteOwner<Client>) {
    let handle = EventLoop::background();

    let loop_handle = handle.clone();
    let owner = RemoteOwner::new(&handle, move || {
        let socket = FramingSocket::new(&loop_handle, config);
        let sink = received;
        socket.add_recv_callback(move |message| {
            sink.lock().unwrap().push(message.to_vec());
            true
        });
        let sink = closed;
        socket.add_close_callback(move |error| {
            sink.lock().unwrap().push(error);
            true
        });
        Rc::new(Client { socket })
    });

    (handle, owner)
}

fn wait_connected(owner: &RemoteOwner<Client>) {
    wait_until("connect", || owner.with(|c| c.socket.state()) == SocketState::Connected);
}

#[test]
fn frames_round_trip_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint: Endpoint = format!("tcp://{}", listener.local_addr().unwrap()).parse().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        for _ in 0..3 {
            let frame = read_frame(&mut stream).expect("peer closed early");
            stream.write_all(&framed(&frame.to_ascii_uppercase())).unwrap();
        }
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Mutex::new(Vec::new()));
    let (_handle, owner) =
        spawn_client(FramingConfig::default(), Arc::clone(&received), Arc::clone(&closed));

    owner.post(move |client| client.socket.open(&endpoint));
    wait_connected(&owner);

    for message in ["one", "two", "three"] {
        let message = message.as_bytes().to_vec();
        owner.post(move |client| {
            client.socket.send(&message).unwrap();
        });
    }

    wait_until("three replies", || received.lock().unwrap().len() == 3);
    assert_eq!(
        *received.lock().unwrap(),
        vec![b"ONE".to_vec(), b"TWO".to_vec(), b"THREE".to_vec()]
    );

    server.join().unwrap();
}

#[test]
fn unix_transport_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.sock");
    let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
    let endpoint: Endpoint = format!("unix://{}", path.display()).parse().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let frame = read_frame(&mut stream).expect("peer closed early");
        stream.write_all(&framed(&frame)).unwrap();
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Mutex::new(Vec::new()));
    let (_handle, owner) =
        spawn_client(FramingConfig::default(), Arc::clone(&received), Arc::clone(&closed));

    owner.post(move |client| client.socket.open(&endpoint));
    wait_connected(&owner);

    owner.post(|client| {
        client.socket.send(b"over unix").unwrap();
    });

    wait_until("echo", || !received.lock().unwrap().is_empty());
    assert_eq!(received.lock().unwrap()[0], b"over unix");

    server.join().unwrap();
}

#[test]
fn oversize_inbound_frame_closes_with_emsgsize() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint: Endpoint = format!("tcp://{}", listener.local_addr().unwrap()).parse().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // One byte past the receiver's limit.
        stream.write_all(&framed(&vec![7_u8; 65])).unwrap();
        // Hold the socket open; the receiver is the one who closes.
        let mut scratch = Vec::new();
        let _ = stream.read_to_end(&mut scratch);
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Mutex::new(Vec::new()));
    let (_handle, owner) = spawn_client(
        FramingConfig::default().with_max_message_length(64),
        Arc::clone(&received),
        Arc::clone(&closed),
    );

    owner.post(move |client| client.socket.open(&endpoint));
    wait_connected(&owner);

    wait_until("close", || !closed.lock().unwrap().is_empty());
    assert_eq!(*closed.lock().unwrap(), vec![libc::EMSGSIZE]);
    assert!(received.lock().unwrap().is_empty());
    assert_eq!(owner.with(|c| c.socket.state()), SocketState::Closed);

    server.join().unwrap();
}

#[test]
fn boundary_length_frame_is_accepted() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint: Endpoint = format!("tcp://{}", listener.local_addr().unwrap()).parse().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(&framed(&vec![7_u8; 64])).unwrap();
        let _ = read_frame(&mut stream);
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Mutex::new(Vec::new()));
    let (_handle, owner) = spawn_client(
        FramingConfig::default().with_max_message_length(64),
        Arc::clone(&received),
        Arc::clone(&closed),
    );

    owner.post(move |client| client.socket.open(&endpoint));
    wait_connected(&owner);

    wait_until("boundary frame", || !received.lock().unwrap().is_empty());
    assert_eq!(received.lock().unwrap()[0], vec![7_u8; 64]);
    assert!(closed.lock().unwrap().is_empty());

    owner.post(|client| {
        client.socket.send(b"done").unwrap();
    });
    server.join().unwrap();
}

#[test]
fn refused_connect_reports_once_and_stays_down() {
    // Grab a port that nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let endpoint: Endpoint = format!("tcp://127.0.0.1:{port}").parse().unwrap();

    let handle = EventLoop::background();
    let connect_errors = Arc::new(Mutex::new(Vec::new()));

    let loop_handle = handle.clone();
    let sink = Arc::clone(&connect_errors);
    let owner = RemoteOwner::new(&handle, move || {
        let socket = FramingSocket::new(&loop_handle, FramingConfig::default());
        socket.add_connect_callback(move |error| {
            sink.lock().unwrap().push(error);
            true
        });
        Rc::new(Client { socket })
    });

    owner.post(move |client| client.socket.open(&endpoint));

    wait_until("connect error", || !connect_errors.lock().unwrap().is_empty());
    thread::sleep(Duration::from_millis(100));

    let errors = connect_errors.lock().unwrap().clone();
    assert_eq!(errors, vec![libc::ECONNREFUSED]);
    assert_eq!(owner.with(|c| c.socket.state()), SocketState::Closed);
}

#[test]
fn auto_reconnect_finds_a_late_listener() {
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let endpoint: Endpoint = format!("tcp://127.0.0.1:{port}").parse().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Mutex::new(Vec::new()));
    let (_handle, owner) =
        spawn_client(FramingConfig::default(), Arc::clone(&received), Arc::clone(&closed));

    let target = endpoint.clone();
    owner.post(move |client| {
        courier_net::enable_auto_reconnect_and_open(
            &client.socket,
            &target,
            Duration::from_millis(50),
        );
    });

    thread::sleep(Duration::from_millis(200));
    assert_ne!(owner.with(|c| c.socket.state()), SocketState::Connected);

    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    wait_connected(&owner);

    owner.post(|client| {
        client.socket.send(b"late but here").unwrap();
    });
    let (mut stream, _) = listener.accept().unwrap();
    assert_eq!(read_frame(&mut stream).unwrap(), b"late but here");
}
