// src/server.rs
//! Reactor loop and the [`Server`] facade.
//!
//! One reactor thread owns the multiplexer and does every socket read and
//! write. Workers only run [`Connection::process`](crate::conn::Connection::process)
//! and report back over a pipe; the reactor then re-arms the connection or
//! starts writing its response.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::conn::{Outcome, WriteProgress};
use crate::error::{SonataError, SonataResult};
use crate::identity::IdentityStore;
use crate::metrics::ServerMetrics;
use crate::poller::{EventKind, Events, Interest, Poller};
use crate::pool::{Rejected, WorkerPool};
use crate::response::BUSY_RESPONSE;
use crate::services::Services;
use crate::slab::{ConnId, ConnectionSlab};
use crate::syscalls;

pub const LISTENER_TOKEN: u64 = u64::MAX;
pub const COMPLETION_TOKEN: u64 = u64::MAX - 1;

/// Wait timeout while rejected submissions are waiting for a retry.
const RETRY_POLL_MS: i32 = 5;

struct OwnedFd(RawFd);

impl Drop for OwnedFd {
    fn drop(&mut self) {
        syscalls::close(self.0);
    }
}

/// State shared between the reactor and the workers.
struct Shared {
    slab: ConnectionSlab,
    services: Services,
    metrics: Arc<ServerMetrics>,
    completion_tx: RawFd,
}

impl Shared {
    /// Worker entry point.
    fn process(&self, id: ConnId) {
        let _report = Completion {
            tx: self.completion_tx,
            id,
        };
        if let Some(mut conn) = self.slab.lock(id) {
            if conn.is_open() && conn.process(&self.services) != Outcome::Incomplete {
                self.metrics.inc_req();
            }
        }
    }
}

/// Hands `id` back to the reactor when dropped, including while unwinding
/// out of a panicking worker.
struct Completion {
    tx: RawFd,
    id: ConnId,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Err(e) = syscalls::send_token(self.tx, self.id as u64) {
            tracing::error!(conn = self.id, error = %e, "failed to report processed connection");
        }
    }
}

pub struct Server {
    config: Config,
    listener: OwnedFd,
    local_addr: SocketAddr,
    services: Services,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<ServerMetrics>,
}

impl Server {
    /// Validate `config` and bind the listening socket.
    pub fn bind(config: Config, identity: Arc<dyn IdentityStore>) -> SonataResult<Self> {
        config.validate()?;
        let addr_str = config.server_addr();
        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|e| SonataError::Config(format!("invalid listen address {}: {}", addr_str, e)))?;

        let listener = OwnedFd(syscalls::create_listen_socket(&addr)?);
        let local_addr = syscalls::local_addr(listener.0)?;
        let services = Services::from_config(&config, identity);

        Ok(Self {
            config,
            listener,
            local_addr,
            services,
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(ServerMetrics::new()),
        })
    }

    /// Replace the services built from the config.
    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Setting the flag makes [`Server::serve`] return within one poll
    /// timeout.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Run the reactor on the calling thread until shutdown is requested.
    pub fn serve(self) -> SonataResult<()> {
        let Server {
            config,
            listener,
            local_addr,
            services,
            shutdown,
            metrics,
        } = self;

        let (rx, tx) = syscalls::create_pipe()?;
        let completion_rx = OwnedFd(rx);
        let completion_tx = OwnedFd(tx);

        let shared = Arc::new(Shared {
            slab: ConnectionSlab::new(config.max_connections),
            services,
            metrics: metrics.clone(),
            completion_tx: completion_tx.0,
        });

        let poller = Poller::new()?;
        poller.register(listener.0, LISTENER_TOKEN, Interest::Read, false)?;
        poller.register(completion_rx.0, COMPLETION_TOKEN, Interest::Read, false)?;

        let worker_shared = shared.clone();
        let pool = WorkerPool::new(config.workers, config.max_queue, move |id: ConnId| {
            worker_shared.process(id)
        })?;

        let reporter = spawn_reporter(config.metrics_interval_secs, metrics, shutdown.clone());

        tracing::info!(
            addr = %local_addr,
            workers = config.workers,
            max_connections = config.max_connections,
            doc_root = %shared.services.doc_root().display(),
            "sonata listening"
        );

        let mut reactor = Reactor {
            poller,
            shared,
            pool,
            listen_fd: listener.0,
            completion_rx: completion_rx.0,
            deferred: Vec::new(),
        };
        let result = reactor.run(&shutdown, config.max_events, config.poll_timeout_ms);
        reactor.teardown();

        shutdown.store(true, Ordering::Release);
        if let Some(handle) = reporter {
            let _ = handle.join();
        }
        // The pipe outlives the workers: both ends close only after teardown.
        drop(reactor);
        drop(completion_tx);
        drop(completion_rx);
        drop(listener);

        tracing::info!("sonata shut down");
        result
    }
}

struct Reactor {
    poller: Poller,
    shared: Arc<Shared>,
    pool: WorkerPool<ConnId>,
    listen_fd: RawFd,
    completion_rx: RawFd,
    /// Connections whose submission was rejected by a full queue.
    deferred: Vec<ConnId>,
}

impl Reactor {
    fn run(&mut self, shutdown: &AtomicBool, max_events: usize, poll_timeout_ms: i32) -> SonataResult<()> {
        let mut events = Events::with_capacity(max_events);

        while !shutdown.load(Ordering::Acquire) {
            self.retry_deferred();
            let timeout = if self.deferred.is_empty() {
                poll_timeout_ms
            } else {
                RETRY_POLL_MS
            };

            if let Err(e) = self.poller.wait(&mut events, timeout) {
                tracing::error!(error = %e, "multiplexer wait failed");
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token {
                    LISTENER_TOKEN => self.accept_all(),
                    COMPLETION_TOKEN => self.drain_completions(),
                    token => {
                        let id = token as ConnId;
                        match event.kind {
                            EventKind::Hangup => self.close(id),
                            EventKind::Readable => self.on_readable(id),
                            EventKind::Writable => self.on_writable(id),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, fd: RawFd, peer: Option<SocketAddr>) {
        let id = match self.shared.slab.allocate() {
            Ok(id) => id,
            Err(_) => {
                self.shared.metrics.inc_busy();
                tracing::warn!(?peer, "connection table full, refusing client");
                let _ = syscalls::write_nonblocking(fd, BUSY_RESPONSE);
                syscalls::close(fd);
                return;
            }
        };

        if let Some(mut conn) = self.shared.slab.lock(id) {
            conn.init(fd, peer);
            conn.set_armed(Some(Interest::Read));
        }
        self.shared.metrics.inc_conn();

        if let Err(e) = self.poller.register(fd, id as u64, Interest::Read, true) {
            tracing::warn!(conn = id, error = %e, "failed to register connection");
            self.close(id);
            return;
        }
        tracing::debug!(conn = id, ?peer, "accepted");
    }

    fn on_readable(&mut self, id: ConnId) {
        let result = match self.shared.slab.lock(id) {
            Some(mut conn) if conn.is_open() => {
                conn.set_armed(None);
                conn.read()
            }
            _ => return,
        };
        match result {
            Ok(_) => self.dispatch(id),
            Err(e) => {
                tracing::debug!(conn = id, error = %e, "read failed");
                self.close(id);
            }
        }
    }

    fn dispatch(&mut self, id: ConnId) {
        if let Err(Rejected(id)) = self.pool.submit(id) {
            self.shared.metrics.inc_rejected();
            tracing::debug!(conn = id, "worker queue full, deferring");
            self.deferred.push(id);
        }
    }

    fn retry_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let mut waiting = std::mem::take(&mut self.deferred).into_iter();
        while let Some(id) = waiting.next() {
            if let Err(Rejected(id)) = self.pool.submit(id) {
                self.deferred.push(id);
                self.deferred.extend(waiting);
                return;
            }
        }
    }

    fn drain_completions(&mut self) {
        loop {
            match syscalls::recv_token(self.completion_rx) {
                Ok(Some(token)) => self.on_processed(token as ConnId),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "completion pipe read failed");
                    break;
                }
            }
        }
    }

    /// A worker finished with `id`: wait for more input, or start the
    /// response. Write interest is armed only if bytes remain.
    fn on_processed(&mut self, id: ConnId) {
        let outcome = match self.shared.slab.lock(id) {
            Some(conn) if conn.is_open() => conn.outcome(),
            _ => return,
        };
        if outcome == Outcome::Incomplete {
            self.rearm(id, Interest::Read);
        } else {
            self.on_writable(id);
        }
    }

    fn on_writable(&mut self, id: ConnId) {
        let result = match self.shared.slab.lock(id) {
            Some(mut conn) if conn.is_open() => {
                conn.set_armed(None);
                conn.write()
            }
            _ => return,
        };
        match result {
            Ok(WriteProgress::Pending { written }) => {
                self.shared.metrics.add_bytes(written);
                self.rearm(id, Interest::Write);
            }
            Ok(WriteProgress::Complete { written, keep_alive }) => {
                self.shared.metrics.add_bytes(written);
                if keep_alive {
                    self.rearm(id, Interest::Read);
                } else {
                    self.close(id);
                }
            }
            Err(e) => {
                tracing::debug!(conn = id, error = %e, "write failed");
                self.close(id);
            }
        }
    }

    fn rearm(&mut self, id: ConnId, interest: Interest) {
        let fd = match self.shared.slab.lock(id) {
            Some(mut conn) if conn.is_open() => {
                debug_assert_eq!(conn.armed(), None, "re-armed while still armed");
                conn.set_armed(Some(interest));
                conn.fd()
            }
            _ => return,
        };
        if let Err(e) = self.poller.modify(fd, id as u64, interest) {
            tracing::warn!(conn = id, ?interest, error = %e, "failed to re-arm connection");
            self.close(id);
        }
    }

    fn close(&mut self, id: ConnId) {
        let fd = match self.shared.slab.lock(id) {
            Some(mut conn) => conn.detach(),
            None => return,
        };
        let Some(fd) = fd else {
            return;
        };
        let _ = self.poller.unregister(fd);
        syscalls::close(fd);
        self.shared.slab.release(id);
        self.shared.metrics.dec_conn();
        tracing::debug!(conn = id, "closed");
    }

    /// Stop the workers, then close every connection still open.
    fn teardown(&mut self) {
        self.pool.shutdown();
        self.deferred.clear();
        for id in 0..self.shared.slab.capacity() {
            self.close(id);
        }
    }
}

fn spawn_reporter(
    interval_secs: u64,
    metrics: Arc<ServerMetrics>,
    shutdown: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    let period = Duration::from_secs(interval_secs);
    thread::Builder::new()
        .name("sonata-metrics".to_string())
        .spawn(move || {
            let mut last = Instant::now();
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(100));
                if last.elapsed() < period {
                    continue;
                }
                last = Instant::now();
                let snap = metrics.snapshot();
                tracing::info!(
                    active = snap.active_conns,
                    requests = snap.req_count,
                    bytes_sent = snap.bytes_sent,
                    rejected = snap.rejected_tasks,
                    busy = snap.busy_accepts,
                    "metrics"
                );
            }
        })
        .map_err(|e| tracing::warn!(error = %e, "failed to start metrics reporter"))
        .ok()
}
