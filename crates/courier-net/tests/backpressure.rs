use std::{
    io::{Read, Write},
    net::TcpListener,
    os::fd::AsRawFd,
    rc::Rc,
    sync::{Arc, Mutex, mpsc},
    thread,
    time::{Duration, Instant},
};

use courier_net::{Endpoint, FramingConfig, FramingSocket, SendError, SocketConfig, SocketState};
use courier_reactor::{EventLoop, RemoteOwner};

const FRAME_SIZE: usize = 20 * 1024;
const SEND_BUFFER_CAP: usize = 64 * 1024;

struct Client {
    socket: Rc<FramingSocket>,
}

fn read_frame(stream: &mut impl Read) -> Option<Vec<u8>> {
    let mut header = [0_u8; 4];
    stream.read_exact(&mut header).ok()?;
    let mut payload = vec![0_u8; u32::from_le_bytes(header) as usize];
    stream.read_exact(&mut payload).ok()?;
    Some(payload)
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn shrink_rcv_buf(listener: &TcpListener) {
    let size: libc::c_int = 4096;
    let rc = unsafe {
        libc::setsockopt(
            listener.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&raw const size).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
}

/// The peer blackholes reads until told how many frames to expect; the
/// producer keeps sending until the bounded send buffer pushes back, then
/// the peer drains and the stream recovers.
#[test]
fn send_buffer_backpressure_surfaces_and_recovers() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    shrink_rcv_buf(&listener);
    let endpoint: Endpoint = format!("tcp://{}", listener.local_addr().unwrap()).parse().unwrap();

    let (expected_tx, expected_rx) = mpsc::channel::<usize>();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        // Blackhole until the producer has hit backpressure.
        let expected = expected_rx.recv().unwrap();
        for _ in 0..expected {
            let frame = read_frame(&mut stream).expect("missing frame");
            assert_eq!(frame.len(), FRAME_SIZE);
        }

        // One more frame after the producer recovers.
        let tail = read_frame(&mut stream).expect("missing tail frame");
        assert_eq!(tail, b"after-drain");
    });

    let handle = EventLoop::background();
    let loop_handle = handle.clone();
    let owner = RemoteOwner::new(&handle, move || {
        let socket = FramingSocket::new(
            &loop_handle,
            FramingConfig::default().with_socket(
                SocketConfig::default()
                    .with_send_buffer_max_capacity(SEND_BUFFER_CAP)
                    .with_snd_buf(4096),
            ),
        );
        Rc::new(Client { socket })
    });

    owner.post(move |client| client.socket.open(&endpoint));
    wait_until("connect", || owner.with(|c| c.socket.state()) == SocketState::Connected);

    // Push 20 KiB frames at a blackholed peer. The kernel absorbs a little;
    // the bounded send buffer must reject a send well before 40 frames.
    let mut accepted = 0;
    let mut rejected = false;
    for _ in 0..40 {
        let payload = vec![9_u8; FRAME_SIZE];
        match owner.with(move |client| client.socket.send(&payload)) {
            Ok(()) => accepted += 1,
            Err(SendError::BufferFull) => {
                rejected = true;
                break;
            }
            Err(other) => panic!("unexpected send error: {other}"),
        }
    }
    assert!(rejected, "bounded send buffer never pushed back");
    assert!(accepted >= 1, "not even one frame was accepted");

    // A rejected send leaves the stream intact.
    assert_eq!(owner.with(|c| c.socket.state()), SocketState::Connected);

    // Let the peer drain everything that was accepted.
    expected_tx.send(accepted).unwrap();

    // The buffer empties and new sends go through again.
    wait_until("drain", || {
        owner.with(|client| client.socket.send(b"after-drain").is_ok())
    });

    server.join().unwrap();
}
