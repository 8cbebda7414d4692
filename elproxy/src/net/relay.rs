use crate::error::{ProtocolError, ProxyError, ProxyResult};
use crate::logging;
use crate::net::buffer::{Buffer, Ingress};
use crate::net::frame::{Frame, Opcode, HEADER_SIZE, MAX_PAYLOAD};
use crate::{PEER_TCP_PORT, PEER_UDP_CTRL_PORT, PEER_UDP_DATA_PORT};
use mio::net::{TcpStream, UdpSocket};
use mio::{PollOpt, Ready, Token};
use socket2::{Domain, Socket, Type};
use std::io;
use std::io::Read;
use std::net;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const CLIENT: Token = Token(0);
const PEER_TCP: Token = Token(1);
const UDP_DATA: Token = Token(2);
const UDP_CTRL: Token = Token(3);

/// Bounds the latency of observing the shutdown and abort flags.
const POLL_TIMEOUT: Duration = Duration::from_millis(250);
/// How long an outbound peer connect may take before it is reported as
/// failed to the client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const CLIENT_READ_BUF: usize = 4 * (HEADER_SIZE + MAX_PAYLOAD);
const CLIENT_WRITE_BUF: usize = 8 * (HEADER_SIZE + MAX_PAYLOAD);
const PEER_WRITE_BUF: usize = 8 * MAX_PAYLOAD;

/// One proxy slot: an external source address with its pair of long-lived
/// UDP sockets and the readiness poll every session of this slot runs on.
/// The peer TCP connection is created on demand by the serving session and
/// never outlives it.
pub struct Slot {
    index: usize,
    source_addr: Ipv4Addr,
    poll: mio::Poll,
    udp_data: UdpSocket,
    udp_ctrl: UdpSocket,
    in_use: AtomicBool,
    abort: AtomicBool,
}

impl Slot {
    /// Bind the slot's UDP pair on the source address and set up the poll.
    pub fn open(index: usize, source_addr: Ipv4Addr) -> ProxyResult<Slot> {
        let poll = mio::Poll::new()?;

        let udp_data = UdpSocket::bind(&SocketAddr::from(SocketAddrV4::new(
            source_addr,
            PEER_UDP_DATA_PORT,
        )))?;
        let udp_ctrl = UdpSocket::bind(&SocketAddr::from(SocketAddrV4::new(
            source_addr,
            PEER_UDP_CTRL_PORT,
        )))?;

        poll.register(&udp_data, UDP_DATA, Ready::readable(), PollOpt::level())?;
        poll.register(&udp_ctrl, UDP_CTRL, Ready::readable(), PollOpt::level())?;

        Ok(Slot {
            index,
            source_addr,
            poll,
            udp_data,
            udp_ctrl,
            in_use: AtomicBool::new(false),
            abort: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn source_addr(&self) -> Ipv4Addr {
        self.source_addr
    }

    /// Observable by the registration hook.
    #[inline]
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Try to claim the slot for a new session.
    #[inline]
    pub fn reserve(&self) -> bool {
        !self.in_use.swap(true, Ordering::SeqCst)
    }

    #[inline]
    pub fn release(&self) {
        self.in_use.store(false, Ordering::SeqCst);
    }

    /// Ask the current session, if any, to terminate.
    #[inline]
    pub fn abort_session(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

/// The peer-facing TCP connection of a serving session.
struct PeerTcp {
    stream: TcpStream,
    addr: Ipv4Addr,
    write: Buffer,
    interest: Ready,
}

/// Relays frames between one authorized client socket and the slot's peer
/// sockets until either side goes away. Runs entirely on the calling
/// worker thread; all client writes funnel through one buffer, keeping
/// frames atomic with respect to each other.
pub struct RelaySession<'a> {
    slot: &'a Slot,
    running: &'a AtomicBool,
    log: logging::Logger,
    client: TcpStream,
    client_read: Buffer,
    client_write: Buffer,
    client_interest: Ready,
    peer: Option<PeerTcp>,
}

impl<'a> RelaySession<'a> {
    /// Take over an authorized client socket and prepare the slot for
    /// relaying. Stale datagrams from the previous session are discarded
    /// before any traffic flows.
    pub fn new(
        slot: &'a Slot,
        client: net::TcpStream,
        running: &'a AtomicBool,
        log: &logging::Logger,
    ) -> ProxyResult<RelaySession<'a>> {
        client.set_nonblocking(true)?;
        let client = TcpStream::from_stream(client)?;

        slot.poll
            .register(&client, CLIENT, Ready::readable(), PollOpt::level())?;
        slot.abort.store(false, Ordering::SeqCst);

        drain_udp(&slot.udp_data);
        drain_udp(&slot.udp_ctrl);

        Ok(RelaySession {
            slot,
            running,
            log: log.new(logging::o!("slot" => slot.index)),
            client,
            client_read: Buffer::new(CLIENT_READ_BUF),
            client_write: Buffer::new(CLIENT_WRITE_BUF),
            client_interest: Ready::readable(),
            peer: None,
        })
    }

    /// Drive the relay until the client disconnects, errs, or shutdown is
    /// requested. The slot is left clean for the next session either way.
    pub fn run(&mut self) -> ProxyResult<()> {
        let mut events = mio::Events::with_capacity(64);

        let result = self.pump(&mut events);
        self.teardown();

        result
    }

    fn pump(&mut self, events: &mut mio::Events) -> ProxyResult<()> {
        loop {
            if !self.running.load(Ordering::SeqCst) || self.slot.abort.load(Ordering::SeqCst) {
                return Err(ProxyError::Shutdown);
            }

            self.slot.poll.poll(events, Some(POLL_TIMEOUT))?;

            for event in events.iter() {
                let readiness = event.readiness();

                match event.token() {
                    CLIENT => {
                        if readiness.is_readable() && self.client_readable()? {
                            logging::debug!(self.log, "client closed connection");
                            return Ok(());
                        }
                        if readiness.is_writable() {
                            self.flush_client()?;
                        }
                    }
                    PEER_TCP => {
                        if readiness.is_readable() {
                            self.peer_readable()?;
                        }
                        if readiness.is_writable() {
                            self.flush_peer()?;
                        }
                    }
                    UDP_DATA => self.udp_readable(Opcode::UdpData)?,
                    UDP_CTRL => self.udp_readable(Opcode::UdpCtrl)?,
                    _ => (),
                }
            }
        }
    }

    /// Ingest client bytes and dispatch every complete frame. Returns true
    /// once the client has closed its end.
    fn client_readable(&mut self) -> ProxyResult<bool> {
        let ingress = self.client_read.ingress(&mut self.client)?;

        loop {
            match Frame::decode(self.client_read.read_slice())? {
                Some((frame, consumed)) => {
                    self.client_read.move_head(consumed);
                    self.dispatch(frame)?;
                }
                None => break,
            }
        }

        match ingress {
            Ingress::Eof => Ok(true),
            _ => Ok(false),
        }
    }

    fn dispatch(&mut self, frame: Frame) -> ProxyResult<()> {
        logging::trace!(self.log, "client frame";
                        "opcode" => ?frame.opcode,
                        "addr" => %frame.addr,
                        "size" => frame.payload.len());

        match frame.opcode {
            Opcode::TcpOpen => self.peer_open(frame.addr),
            Opcode::TcpData => self.peer_write(&frame.payload),
            Opcode::TcpClose => {
                self.peer_close();
                Ok(())
            }
            Opcode::UdpData => self.udp_send(Opcode::UdpData, frame.addr, &frame.payload),
            Opcode::UdpCtrl => self.udp_send(Opcode::UdpCtrl, frame.addr, &frame.payload),
            Opcode::TcpStatus | Opcode::System => {
                Err(ProxyError::Protocol(ProtocolError::UnexpectedOpcode))
            }
        }
    }

    /// Connect to `addr` on the peer data port, replacing any previous
    /// connection, and report the outcome with a TCP_STATUS frame.
    fn peer_open(&mut self, addr: Ipv4Addr) -> ProxyResult<()> {
        self.peer_close();

        match self.peer_connect(addr) {
            Ok(stream) => {
                self.slot
                    .poll
                    .register(&stream, PEER_TCP, Ready::readable(), PollOpt::level())?;
                self.peer = Some(PeerTcp {
                    stream,
                    addr,
                    write: Buffer::new(PEER_WRITE_BUF),
                    interest: Ready::readable(),
                });

                logging::debug!(self.log, "peer connected"; "peer" => %addr);
                self.send_status(addr, 0)
            }
            Err(err) => {
                let errno = err.raw_os_error().unwrap_or(1) as u32;

                logging::debug!(self.log, "peer connect failed";
                                "peer" => %addr,
                                "errno" => errno,
                                "error" => ?err);
                self.send_status(addr, errno)
            }
        }
    }

    /// Open a TCP connection to `addr:5200`, bound to the slot's source
    /// address.
    fn peer_connect(&self, addr: Ipv4Addr) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;

        socket.bind(&SocketAddr::from(SocketAddrV4::new(self.slot.source_addr, 0)).into())?;
        socket.connect_timeout(
            &SocketAddr::from(SocketAddrV4::new(addr, PEER_TCP_PORT)).into(),
            CONNECT_TIMEOUT,
        )?;

        let stream: net::TcpStream = socket.into();
        stream.set_nonblocking(true)?;

        TcpStream::from_stream(stream)
    }

    fn send_status(&mut self, addr: Ipv4Addr, status: u32) -> ProxyResult<()> {
        self.send_client(Frame::new(
            Opcode::TcpStatus,
            addr,
            status.to_be_bytes().to_vec(),
        ))
    }

    /// Forward client TCP_DATA to the peer. A missing or failing peer
    /// connection is reported back with TCP_CLOSE.
    fn peer_write(&mut self, payload: &[u8]) -> ProxyResult<()> {
        let pushed = match &mut self.peer {
            Some(peer) => peer.write.push(payload),
            None => false,
        };

        if !pushed {
            let addr = self
                .peer
                .as_ref()
                .map(|peer| peer.addr)
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            return self.peer_lost(addr);
        }

        self.flush_peer()
    }

    fn flush_peer(&mut self) -> ProxyResult<()> {
        let (result, addr) = match &mut self.peer {
            Some(peer) => (peer.write.egress(&mut peer.stream), peer.addr),
            None => return Ok(()),
        };

        match result {
            Ok(_) => self.update_peer_interest(),
            Err(_) => self.peer_lost(addr),
        }
    }

    /// Drain inbound peer bytes, forwarding them as TCP_DATA frames. EOF
    /// and read errors close the connection and notify the client.
    fn peer_readable(&mut self) -> ProxyResult<()> {
        let mut chunk = [0u8; MAX_PAYLOAD];

        loop {
            let (result, addr) = match &mut self.peer {
                Some(peer) => (peer.stream.read(&mut chunk), peer.addr),
                None => return Ok(()),
            };

            match result {
                Ok(0) => return self.peer_lost(addr),
                Ok(count) => {
                    self.send_client(Frame::new(Opcode::TcpData, addr, chunk[..count].to_vec()))?;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return self.peer_lost(addr),
            }
        }
    }

    /// The peer connection ended or failed: close it and notify the client
    /// with TCP_CLOSE.
    fn peer_lost(&mut self, addr: Ipv4Addr) -> ProxyResult<()> {
        self.peer_close();
        self.send_client(Frame::new(Opcode::TcpClose, addr, Vec::new()))
    }

    /// Close the peer TCP silently.
    fn peer_close(&mut self) {
        if let Some(peer) = self.peer.take() {
            logging::debug!(self.log, "closing peer connection"; "peer" => %peer.addr);
            drop(self.slot.poll.deregister(&peer.stream));
            drop(peer.stream.shutdown(Shutdown::Both));
        }
    }

    /// Send a datagram from the slot's matching UDP socket. Datagram loss
    /// is acceptable; send failures never end the session.
    fn udp_send(&self, opcode: Opcode, addr: Ipv4Addr, payload: &[u8]) -> ProxyResult<()> {
        let (socket, port) = match opcode {
            Opcode::UdpData => (&self.slot.udp_data, PEER_UDP_DATA_PORT),
            _ => (&self.slot.udp_ctrl, PEER_UDP_CTRL_PORT),
        };

        let target = SocketAddr::from(SocketAddrV4::new(addr, port));

        if let Err(err) = socket.send_to(payload, &target) {
            logging::debug!(self.log, "datagram dropped";
                            "peer" => %target,
                            "error" => ?err);
        }

        Ok(())
    }

    /// Drain inbound datagrams, forwarding each as a frame of the matching
    /// opcode with the sender's address.
    fn udp_readable(&mut self, opcode: Opcode) -> ProxyResult<()> {
        let slot = self.slot;
        let socket = match opcode {
            Opcode::UdpData => &slot.udp_data,
            _ => &slot.udp_ctrl,
        };
        let mut chunk = [0u8; MAX_PAYLOAD];

        loop {
            match socket.recv_from(&mut chunk) {
                Ok((count, SocketAddr::V4(from))) => {
                    // A backed up client loses datagrams rather than the
                    // whole session.
                    if self.client_write.free_capacity() < HEADER_SIZE + count {
                        continue;
                    }
                    self.send_client(Frame::new(opcode, *from.ip(), chunk[..count].to_vec()))?;
                }
                Ok(_) => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Asynchronous errors from earlier sends (ICMP
                    // rejections) surface here; consume and move on.
                    logging::trace!(self.log, "datagram receive error"; "error" => ?err);
                    return Ok(());
                }
            }
        }
    }

    /// Queue a frame for the client in one piece and flush what the socket
    /// accepts.
    fn send_client(&mut self, frame: Frame) -> ProxyResult<()> {
        let bytes = frame.to_bytes();

        if !self.client_write.push(&bytes) {
            self.client_write.egress(&mut self.client)?;

            if !self.client_write.push(&bytes) {
                return Err(ProxyError::Transport(io::ErrorKind::TimedOut));
            }
        }

        self.flush_client()
    }

    fn flush_client(&mut self) -> ProxyResult<()> {
        self.client_write.egress(&mut self.client)?;
        self.update_client_interest()
    }

    fn update_client_interest(&mut self) -> ProxyResult<()> {
        let want = match self.client_write.is_empty() {
            true => Ready::readable(),
            false => Ready::readable() | Ready::writable(),
        };

        if want != self.client_interest {
            self.slot
                .poll
                .reregister(&self.client, CLIENT, want, PollOpt::level())?;
            self.client_interest = want;
        }

        Ok(())
    }

    fn update_peer_interest(&mut self) -> ProxyResult<()> {
        let slot = self.slot;

        if let Some(peer) = &mut self.peer {
            let want = match peer.write.is_empty() {
                true => Ready::readable(),
                false => Ready::readable() | Ready::writable(),
            };

            if want != peer.interest {
                slot.poll
                    .reregister(&peer.stream, PEER_TCP, want, PollOpt::level())?;
                peer.interest = want;
            }
        }

        Ok(())
    }

    /// Leave the slot clean for the next session: peer closed, stale
    /// datagrams discarded, client deregistered and shut down.
    fn teardown(&mut self) {
        self.peer_close();

        drop(self.slot.poll.deregister(&self.client));
        drop(self.client.shutdown(Shutdown::Both));

        drain_udp(&self.slot.udp_data);
        drain_udp(&self.slot.udp_ctrl);

        logging::debug!(self.log, "session ended");
    }
}

/// Discard every queued datagram on `socket`.
fn drain_udp(socket: &UdpSocket) -> usize {
    let mut chunk = [0u8; MAX_PAYLOAD];
    let mut count = 0;

    loop {
        match socket.recv_from(&mut chunk) {
            Ok(_) => count += 1,
            Err(_) => return count,
        }
    }
}
