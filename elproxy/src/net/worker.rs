use crate::auth::Authorizer;
use crate::error::{ProxyError, ProxyResult};
use crate::logging;
use crate::net::relay::RelaySession;
use crate::pool::SlotPool;
use crate::registry::Registry;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Socket timeouts covering the authorization exchange; a silent client
/// cannot pin a worker.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// Bounds how long an idle worker sleeps between shutdown checks.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Client handoff cell. `pending` is written by the acceptor and taken by
/// the worker; `engaged` stays up for the whole session so the acceptor
/// keeps seeing the worker as busy.
struct ClientCell {
    pending: Option<TcpStream>,
    engaged: bool,
}

/// One worker per slot, fixed pairing. Owns the thread that authorizes a
/// client and then drives the slot relay until disconnect.
pub struct Worker {
    inner: Arc<WorkerInner>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn new(
        index: usize,
        auth: Arc<Authorizer>,
        pool: Arc<SlotPool>,
        registry: Arc<dyn Registry>,
        running: Arc<AtomicBool>,
        log: &logging::Logger,
    ) -> Worker {
        Worker {
            inner: Arc::new(WorkerInner {
                index,
                cell: Mutex::new(ClientCell {
                    pending: None,
                    engaged: false,
                }),
                wake: Condvar::new(),
                running,
                auth,
                pool,
                registry,
                log: log.new(logging::o!("worker" => index)),
            }),
            thread: None,
        }
    }

    /// Spawn the worker thread; it starts idle, waiting for a handoff.
    pub fn start(&mut self) -> std::io::Result<()> {
        let inner = self.inner.clone();

        let thread = thread::Builder::new()
            .name(format!("elproxy-worker-{}", self.inner.index))
            .spawn(move || inner.run())?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Hand a freshly accepted client to this worker. The stream comes
    /// back when the worker is busy, so the caller can probe the next one.
    pub fn offer(&self, stream: TcpStream) -> Result<(), TcpStream> {
        let mut cell = self.inner.cell.lock().expect("Worker lock poisoned");

        if cell.engaged || cell.pending.is_some() {
            return Err(stream);
        }

        cell.pending = Some(stream);
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            drop(thread.join());
        }
    }
}

struct WorkerInner {
    index: usize,
    cell: Mutex<ClientCell>,
    wake: Condvar,
    running: Arc<AtomicBool>,
    auth: Arc<Authorizer>,
    pool: Arc<SlotPool>,
    registry: Arc<dyn Registry>,
    log: logging::Logger,
}

impl WorkerInner {
    /// IDLE loop: sleep until the acceptor hands over a socket, serve the
    /// session, return to idle. Ends when the proxy shuts down.
    fn run(&self) {
        loop {
            let client = {
                let mut cell = self.cell.lock().expect("Worker lock poisoned");

                loop {
                    if !self.running.load(Ordering::SeqCst) {
                        return;
                    }
                    if cell.pending.is_some() {
                        break;
                    }

                    let (guard, _) = self
                        .wake
                        .wait_timeout(cell, IDLE_WAIT)
                        .expect("Worker lock poisoned");
                    cell = guard;
                }

                let stream = match cell.pending.take() {
                    Some(stream) => stream,
                    None => continue,
                };
                cell.engaged = true;
                stream
            };

            self.session(client);

            let mut cell = self.cell.lock().expect("Worker lock poisoned");
            cell.engaged = false;
        }
    }

    /// AUTHORIZING, then SERVING, then DRAINING for one client. Always
    /// leaves the paired slot released and the socket closed.
    fn session(&self, mut client: TcpStream) {
        let remote = client
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        drop(client.set_nodelay(true));

        if client
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .and_then(|_| client.set_write_timeout(Some(HANDSHAKE_TIMEOUT)))
            .is_err()
        {
            drop(client.shutdown(Shutdown::Both));
            return;
        }

        let callsign = match self.auth.handshake(&mut client) {
            Ok(callsign) => callsign,
            Err(err) => {
                self.log_auth_failure(&err, &remote);
                drop(client.shutdown(Shutdown::Both));
                return;
            }
        };

        // The relay multiplexes with its own poll; the handshake timeouts
        // no longer apply.
        if client
            .set_read_timeout(None)
            .and_then(|_| client.set_write_timeout(None))
            .is_err()
        {
            drop(client.shutdown(Shutdown::Both));
            return;
        }

        match self.serve(client, &callsign) {
            Ok(()) => {
                logging::info!(self.log, "client disconnected";
                               "callsign" => &callsign,
                               "remote" => &remote);
            }
            Err(ProxyError::NoFreeSlot) => {
                logging::info!(self.log, "no usable slot, dropping client";
                               "callsign" => &callsign,
                               "remote" => &remote);
            }
            Err(err) => {
                if err.is_transport() {
                    logging::warn!(self.log, "session lost";
                                   "callsign" => &callsign,
                                   "remote" => &remote,
                                   "reason" => ?err);
                } else {
                    logging::error!(self.log, "session failed";
                                    "callsign" => &callsign,
                                    "remote" => &remote,
                                    "reason" => ?err);
                }
            }
        }
    }

    /// Reserve a slot and relay until the session ends. Dropping `client`
    /// on any exit path closes the socket.
    fn serve(&self, client: TcpStream, callsign: &str) -> ProxyResult<()> {
        let slot = self.pool.reserve().ok_or(ProxyError::NoFreeSlot)?;

        self.pool.update_registration(self.registry.as_ref());
        logging::info!(self.log, "client connected";
                       "callsign" => callsign,
                       "slot" => slot.index());

        let session_log = self.log.new(logging::o!("callsign" => callsign.to_string()));
        let result = RelaySession::new(&slot, client, &self.running, &session_log)
            .and_then(|mut session| session.run());

        slot.release();
        self.pool.update_registration(self.registry.as_ref());

        result
    }

    fn log_auth_failure(&self, err: &ProxyError, remote: &str) {
        match err {
            // Policy denials are logged by the authorizer itself.
            ProxyError::Denied(_) => (),
            err if err.is_transport() => {
                logging::warn!(self.log, "authorization aborted";
                               "remote" => remote,
                               "reason" => ?err);
            }
            err => {
                logging::error!(self.log, "authorization failed";
                                "remote" => remote,
                                "reason" => ?err);
            }
        }
    }
}
