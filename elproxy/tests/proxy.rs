//! End-to-end scenarios over real loopback sockets. Every test gets its
//! own 127/8 addresses so the fixed EchoLink ports never collide across
//! parallel tests.

use elproxy::auth::{expected_response, SYSTEM_ACCESS_DENIED, SYSTEM_BAD_PASSWORD};
use elproxy::config::ProxyConfig;
use elproxy::logging;
use elproxy::net::frame::{Frame, Opcode, HEADER_SIZE};
use elproxy::proxy::{ProxyInstance, ShutdownHandle};
use elproxy::registry::Registry;
use elproxy::{PEER_TCP_PORT, PEER_UDP_DATA_PORT};
use std::io;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::str;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const PASSWORD: &str = "PASSWORD";
const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingRegistry {
    updates: Mutex<Vec<(usize, usize)>>,
}

impl RecordingRegistry {
    fn saw(&self, used: usize, total: usize) -> bool {
        self.updates.lock().unwrap().contains(&(used, total))
    }

    fn saw_total_zero(&self) -> bool {
        self.updates.lock().unwrap().iter().any(|&(_, total)| total == 0)
    }
}

impl Registry for RecordingRegistry {
    fn update(&self, used: usize, total: usize) {
        self.updates.lock().unwrap().push((used, total));
    }
}

struct TestProxy {
    addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestProxy {
    fn launch(config: ProxyConfig, registry: Arc<RecordingRegistry>) -> TestProxy {
        let log = logging::test();
        let mut proxy = ProxyInstance::new(config, &log).unwrap();
        proxy.set_registry(registry);
        proxy.open().unwrap();
        proxy.start().unwrap();

        let addr = proxy.local_addr().unwrap();
        let handle = proxy.shutdown_handle().unwrap();

        let thread = thread::spawn(move || {
            while proxy.process().is_ok() {}
            proxy.close();
        });

        TestProxy {
            addr,
            handle,
            thread: Some(thread),
        }
    }

    fn stop(mut self) {
        self.handle.shutdown();
        self.thread.take().unwrap().join().unwrap();
    }
}

fn config(ext: &str) -> ProxyConfig {
    ProxyConfig {
        password: PASSWORD.to_string(),
        bind_addr: Some("127.0.0.1".to_string()),
        port: 0,
        bind_addr_ext: Some(ext.to_string()),
        ..ProxyConfig::default()
    }
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);

    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn connect(addr: SocketAddr) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream.set_write_timeout(Some(IO_TIMEOUT)).unwrap();

    let mut nonce = [0u8; 8];
    stream.read_exact(&mut nonce).unwrap();

    (stream, str::from_utf8(&nonce).unwrap().to_string())
}

fn authenticate(addr: SocketAddr, callsign: &str) -> TcpStream {
    let (mut stream, nonce) = connect(addr);

    let mut reply = callsign.as_bytes().to_vec();
    reply.push(b'\n');
    reply.extend_from_slice(&expected_response(PASSWORD, &nonce));
    stream.write_all(&reply).unwrap();

    stream
}

fn send_frame(stream: &mut TcpStream, opcode: Opcode, addr: Ipv4Addr, payload: &[u8]) {
    let frame = Frame::new(opcode, addr, payload.to_vec());
    stream.write_all(&frame.to_bytes()).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> Frame {
    let mut bytes = vec![0u8; HEADER_SIZE];
    stream.read_exact(&mut bytes).unwrap();

    let size = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
    bytes.resize(HEADER_SIZE + size, 0);
    stream.read_exact(&mut bytes[HEADER_SIZE..]).unwrap();

    let (frame, consumed) = Frame::decode(&bytes).unwrap().unwrap();
    assert_eq!(consumed, bytes.len());
    frame
}

/// S1: a correct challenge response brings the slot in use and the
/// registration hook observes the occupancy in both directions.
#[test]
fn successful_authorization_claims_slot() {
    let registry = Arc::new(RecordingRegistry::default());
    let proxy = TestProxy::launch(config("127.4.0.1"), registry.clone());

    let client = authenticate(proxy.addr, "W1AW");
    wait_until("slot claimed", || registry.saw(1, 1));

    drop(client);
    wait_until("slot released", || registry.saw(0, 1));

    proxy.stop();
}

/// S2: a wrong digest earns exactly the bad-password SYSTEM frame, then
/// the connection is closed.
#[test]
fn wrong_password_rejected_with_system_frame() {
    let registry = Arc::new(RecordingRegistry::default());
    let proxy = TestProxy::launch(config("127.4.0.2"), registry.clone());

    let (mut stream, _) = connect(proxy.addr);

    let mut reply = b"W1AW\n".to_vec();
    reply.extend_from_slice(&[0u8; 16]);
    stream.write_all(&reply).unwrap();

    let mut frame = [0u8; 10];
    stream.read_exact(&mut frame).unwrap();
    assert_eq!(frame, SYSTEM_BAD_PASSWORD);

    assert_eq!(stream.read(&mut [0u8; 1]).unwrap(), 0);
    assert!(!registry.saw(1, 1));

    proxy.stop();
}

/// S3: a denied callsign with a correct password earns the access-denied
/// SYSTEM frame.
#[test]
fn denied_callsign_rejected_with_system_frame() {
    let registry = Arc::new(RecordingRegistry::default());
    let mut cfg = config("127.4.0.3");
    cfg.calls_allowed = Some("^[A-Z0-9/-]+$".to_string());
    cfg.calls_denied = Some("^BAD1$".to_string());
    let proxy = TestProxy::launch(cfg, registry.clone());

    let mut stream = authenticate(proxy.addr, "BAD1");

    let mut frame = [0u8; 10];
    stream.read_exact(&mut frame).unwrap();
    assert_eq!(frame, SYSTEM_ACCESS_DENIED);

    assert_eq!(stream.read(&mut [0u8; 1]).unwrap(), 0);
    assert!(!registry.saw(1, 1));

    proxy.stop();
}

/// S4: with the single slot taken, the next connection is accepted and
/// immediately closed without a challenge.
#[test]
fn second_client_dropped_while_slot_busy() {
    let registry = Arc::new(RecordingRegistry::default());
    let proxy = TestProxy::launch(config("127.4.0.4"), registry.clone());

    let _first = authenticate(proxy.addr, "W1AW");
    wait_until("slot claimed", || registry.saw(1, 1));

    let mut second = TcpStream::connect(proxy.addr).unwrap();
    second.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    match second.read(&mut [0u8; 8]) {
        Ok(0) => (),
        Ok(count) => panic!("unexpected {} bytes for the second client", count),
        Err(err) => assert_eq!(err.kind(), io::ErrorKind::ConnectionReset),
    }

    proxy.stop();
}

/// S5: TCP_OPEN connects to the addressed peer on port 5200, reports a
/// zero status and relays data both ways until the peer hangs up.
#[test]
fn tcp_relay_roundtrip() {
    let ext: Ipv4Addr = "127.4.0.5".parse().unwrap();
    let registry = Arc::new(RecordingRegistry::default());
    let proxy = TestProxy::launch(config("127.4.0.5"), registry.clone());

    let peer_listener = TcpListener::bind(SocketAddr::from((ext, PEER_TCP_PORT))).unwrap();

    let mut client = authenticate(proxy.addr, "W1AW");
    send_frame(&mut client, Opcode::TcpOpen, ext, &[]);

    let status = read_frame(&mut client);
    assert_eq!(status.opcode, Opcode::TcpStatus);
    assert_eq!(status.addr, ext);
    assert_eq!(status.payload, vec![0, 0, 0, 0]);

    let (mut peer, peer_remote) = peer_listener.accept().unwrap();
    peer.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    assert_eq!(peer_remote.ip(), ext);

    send_frame(&mut client, Opcode::TcpData, ext, b"hello");
    let mut buf = [0u8; 5];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    peer.write_all(b"world").unwrap();
    let data = read_frame(&mut client);
    assert_eq!(data.opcode, Opcode::TcpData);
    assert_eq!(data.addr, ext);
    assert_eq!(data.payload, b"world".to_vec());

    drop(peer);
    let close = read_frame(&mut client);
    assert_eq!(close.opcode, Opcode::TcpClose);
    assert_eq!(close.addr, ext);
    assert!(close.payload.is_empty());

    proxy.stop();
}

/// A TCP_OPEN towards a dead peer reports a nonzero errno status.
#[test]
fn tcp_open_failure_reports_errno() {
    let registry = Arc::new(RecordingRegistry::default());
    let proxy = TestProxy::launch(config("127.4.0.6"), registry.clone());

    let dead: Ipv4Addr = "127.4.2.6".parse().unwrap();

    let mut client = authenticate(proxy.addr, "W1AW");
    send_frame(&mut client, Opcode::TcpOpen, dead, &[]);

    let status = read_frame(&mut client);
    assert_eq!(status.opcode, Opcode::TcpStatus);
    assert_eq!(status.addr, dead);
    assert_ne!(status.payload, vec![0, 0, 0, 0]);

    proxy.stop();
}

/// Datagrams relay in both directions with the peer's address on the
/// frame.
#[test]
fn udp_relay_roundtrip() {
    let ext: Ipv4Addr = "127.4.0.7".parse().unwrap();
    let peer_ip: Ipv4Addr = "127.4.1.7".parse().unwrap();
    let registry = Arc::new(RecordingRegistry::default());
    let proxy = TestProxy::launch(config("127.4.0.7"), registry.clone());

    let peer = UdpSocket::bind(SocketAddr::from((peer_ip, PEER_UDP_DATA_PORT))).unwrap();
    peer.set_read_timeout(Some(IO_TIMEOUT)).unwrap();

    let mut client = authenticate(proxy.addr, "W1AW");
    wait_until("slot claimed", || registry.saw(1, 1));

    send_frame(&mut client, Opcode::UdpData, peer_ip, b"ping");

    let mut buf = [0u8; 16];
    let (count, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..count], b"ping");
    assert_eq!(from, SocketAddr::from((ext, PEER_UDP_DATA_PORT)));

    peer.send_to(b"pong", from).unwrap();

    let frame = read_frame(&mut client);
    assert_eq!(frame.opcode, Opcode::UdpData);
    assert_eq!(frame.addr, peer_ip);
    assert_eq!(frame.payload, b"pong".to_vec());

    proxy.stop();
}

/// An oversize frame is a protocol violation that ends the session.
#[test]
fn oversize_frame_closes_session() {
    let registry = Arc::new(RecordingRegistry::default());
    let proxy = TestProxy::launch(config("127.4.0.8"), registry.clone());

    let mut client = authenticate(proxy.addr, "W1AW");
    wait_until("slot claimed", || registry.saw(1, 1));

    let mut header = vec![0x02u8, 0, 0, 0, 0];
    header.extend_from_slice(&(64 * 1024u32).to_le_bytes());
    client.write_all(&header).unwrap();

    assert_eq!(client.read(&mut [0u8; 1]).unwrap(), 0);
    wait_until("slot released", || registry.saw(0, 1));

    proxy.stop();
}

/// S6: shutdown unblocks the accept loop within bounded time, every
/// worker returns to idle and close completes.
#[test]
fn shutdown_unblocks_accept_and_joins() {
    let registry = Arc::new(RecordingRegistry::default());
    let proxy = TestProxy::launch(config("127.4.0.9"), registry.clone());

    let client = authenticate(proxy.addr, "W1AW");
    wait_until("slot claimed", || registry.saw(1, 1));

    let started = Instant::now();
    proxy.stop();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(registry.saw_total_zero());
    drop(client);
}
