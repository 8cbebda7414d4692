use crate::auth::{Authorizer, CallsignPolicy};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::logging;
use crate::net::acceptor::Acceptor;
use crate::net::relay::Slot;
use crate::net::worker::Worker;
use crate::pool::SlotPool;
use crate::registry::{LogRegistry, Registry};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The top-level proxy handle, driven through the ordered lifecycle
/// new → open → start → process loop → shutdown → close. `Drop` closes a
/// still-running instance as a safety net.
pub struct ProxyInstance {
    config: ProxyConfig,
    log: logging::Logger,
    auth: Arc<Authorizer>,
    registry: Arc<dyn Registry>,
    running: Arc<AtomicBool>,
    pool: Option<Arc<SlotPool>>,
    workers: Vec<Worker>,
    acceptor: Option<Acceptor>,
}

impl ProxyInstance {
    /// Validate the configuration and assemble the static collaborators.
    /// No sockets are touched yet.
    pub fn new(config: ProxyConfig, log: &logging::Logger) -> ProxyResult<ProxyInstance> {
        config.validate()?;

        let policy =
            CallsignPolicy::new(config.calls_allowed.as_deref(), config.calls_denied.as_deref())?;
        let auth = Arc::new(Authorizer::new(config.password.clone(), policy, log));
        let registry: Arc<dyn Registry> = Arc::new(LogRegistry::new(&config.registration, log));

        Ok(ProxyInstance {
            config,
            log: log.new(logging::o!("component" => "proxy")),
            auth,
            registry,
            running: Arc::new(AtomicBool::new(false)),
            pool: None,
            workers: Vec::new(),
            acceptor: None,
        })
    }

    /// Replace the registration collaborator. Must happen before `open`;
    /// the workers capture the hook when they are created.
    pub fn set_registry(&mut self, registry: Arc<dyn Registry>) {
        self.registry = registry;
    }

    /// Allocate one slot and one worker per external address, bind the
    /// slot UDP pairs, and bring up the listener. A failure on any step
    /// unwinds everything acquired so far.
    pub fn open(&mut self) -> ProxyResult<()> {
        if self.pool.is_some() {
            return Err(ProxyError::Config("proxy already open".to_string()));
        }

        let addrs = self.config.external_addrs()?;

        let mut slots = Vec::with_capacity(addrs.len());
        for (index, addr) in addrs.iter().enumerate() {
            slots.push(Arc::new(Slot::open(index, *addr)?));
        }
        let pool = Arc::new(SlotPool::new(slots));

        let mut workers = Vec::with_capacity(pool.num_slots());
        for index in 0..pool.num_slots() {
            workers.push(Worker::new(
                index,
                self.auth.clone(),
                pool.clone(),
                self.registry.clone(),
                self.running.clone(),
                &self.log,
            ));
        }

        let bind_ip: IpAddr = match &self.config.bind_addr {
            Some(addr) => addr.parse()?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let acceptor = Acceptor::open(&SocketAddr::new(bind_ip, self.config.port), &self.log)?;

        logging::info!(self.log, "proxy open";
                       "slots" => pool.num_slots(),
                       "listen" => %acceptor.local_addr()?);

        self.pool = Some(pool);
        self.workers = workers;
        self.acceptor = Some(acceptor);
        Ok(())
    }

    /// Spawn the worker threads, mark every slot usable and start the
    /// registration collaborator.
    pub fn start(&mut self) -> ProxyResult<()> {
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| ProxyError::Config("start before open".to_string()))?;

        self.running.store(true, Ordering::SeqCst);

        for worker in &mut self.workers {
            worker.start()?;
        }

        pool.set_usable(pool.num_slots());
        self.registry.start();
        pool.update_registration(self.registry.as_ref());

        logging::info!(self.log, "proxy started"; "usable" => pool.usable());
        Ok(())
    }

    /// Drive one acceptance cycle. Intended to be called in a loop by the
    /// host; `Err(Shutdown)` is the orderly termination signal.
    pub fn process(&mut self) -> ProxyResult<()> {
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| ProxyError::Config("process before open".to_string()))?;
        let acceptor = self
            .acceptor
            .as_mut()
            .ok_or_else(|| ProxyError::Config("process before open".to_string()))?;

        acceptor.process(&pool, &self.workers, &self.running)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        match &self.acceptor {
            Some(acceptor) => acceptor.local_addr(),
            None => Err(ProxyError::Config("proxy not open".to_string())),
        }
    }

    pub fn pool(&self) -> Option<&SlotPool> {
        self.pool.as_deref()
    }

    /// Handle for requesting an orderly shutdown from another thread, e.g.
    /// a signal handler.
    pub fn shutdown_handle(&self) -> ProxyResult<ShutdownHandle> {
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| ProxyError::Config("no shutdown handle before open".to_string()))?;

        Ok(ShutdownHandle {
            running: self.running.clone(),
            pool,
            registry: self.registry.clone(),
            log: self.log.clone(),
        })
    }

    /// Stop accepting clients: zero the usable count, update registration
    /// and unblock a pending accept. Never propagates errors.
    pub fn shutdown(&mut self) {
        ShutdownHandle {
            running: self.running.clone(),
            pool: match self.pool.clone() {
                Some(pool) => pool,
                None => {
                    self.running.store(false, Ordering::SeqCst);
                    return;
                }
            },
            registry: self.registry.clone(),
            log: self.log.clone(),
        }
        .shutdown();
    }

    /// Force every slot to terminate its current session.
    pub fn drop_sessions(&self) {
        if let Some(pool) = &self.pool {
            for slot in pool.slots() {
                slot.abort_session();
            }
        }
    }

    /// Stop registration, shut down, abort live sessions, join every
    /// worker and release the sockets.
    pub fn close(&mut self) {
        if self.pool.is_none() && self.workers.is_empty() && self.acceptor.is_none() {
            return;
        }

        self.registry.stop();
        self.shutdown();
        self.drop_sessions();

        for worker in &mut self.workers {
            worker.join();
        }
        self.workers.clear();

        self.acceptor = None;
        self.pool = None;

        logging::info!(self.log, "proxy closed");
    }
}

impl Drop for ProxyInstance {
    fn drop(&mut self) {
        self.close();
    }
}

/// Requests an orderly shutdown of a running proxy. All blocked threads
/// observe the request within a bounded time.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    pool: Arc<SlotPool>,
    registry: Arc<dyn Registry>,
    log: logging::Logger,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        logging::info!(self.log, "shutdown requested");

        self.running.store(false, Ordering::SeqCst);
        self.pool.set_usable(0);
        self.pool.update_registration(self.registry.as_ref());
    }
}
