use crate::error::{ProxyError, ProxyResult};
use crate::logging;
use crate::net::worker::Worker;
use crate::pool::SlotPool;
use mio::net::TcpListener;
use mio::{PollOpt, Ready, Token};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const LISTENER: Token = Token(0);
/// Bounds the latency of observing a shutdown while waiting for clients.
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Listens for client connections and binds each to a free worker.
pub struct Acceptor {
    listener: TcpListener,
    poll: mio::Poll,
    events: mio::Events,
    log: logging::Logger,
}

impl Acceptor {
    pub fn open(addr: &SocketAddr, log: &logging::Logger) -> ProxyResult<Acceptor> {
        let listener = TcpListener::bind(addr)?;
        let poll = mio::Poll::new()?;

        poll.register(&listener, LISTENER, Ready::readable(), PollOpt::level())?;

        Ok(Acceptor {
            listener,
            poll,
            events: mio::Events::with_capacity(4),
            log: log.new(logging::o!("component" => "acceptor")),
        })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// One acceptance cycle: wait for a connection, then hand it to the
    /// first non-busy worker within the usable range. A full house closes
    /// the connection and still counts as success.
    pub fn process(
        &mut self,
        pool: &SlotPool,
        workers: &[Worker],
        running: &AtomicBool,
    ) -> ProxyResult<()> {
        let (stream, remote) = self.wait_accept(running)?;

        let usable = pool.usable();

        let mut stream = stream;
        for worker in workers.iter().take(usable) {
            match worker.offer(stream) {
                Ok(()) => {
                    logging::debug!(self.log, "client dispatched"; "remote" => %remote);
                    return Ok(());
                }
                Err(back) => stream = back,
            }
        }

        logging::info!(self.log, "all slots busy, dropping client"; "remote" => %remote);
        drop(stream.shutdown(Shutdown::Both));
        Ok(())
    }

    /// Block until a client connects or shutdown is requested.
    fn wait_accept(
        &mut self,
        running: &AtomicBool,
    ) -> ProxyResult<(std::net::TcpStream, SocketAddr)> {
        loop {
            if !running.load(Ordering::SeqCst) {
                return Err(ProxyError::Shutdown);
            }

            self.poll.poll(&mut self.events, Some(ACCEPT_POLL_TIMEOUT))?;

            if self.events.is_empty() {
                continue;
            }

            match self.listener.accept_std() {
                Ok(pair) => return Ok(pair),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}
