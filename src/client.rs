// Load-generating client: a fixed-size pool of outbound connections.
//
// Each connection sends a pseudo-random total of 32-1024 zero bytes and is
// then recycled: closed and immediately replaced, so the live count stays at
// the configured target. Payload sizes are drawn serially from one MT19937
// generator owned by the pool, so a given (seed, connections) pair always
// produces the same sequence of totals.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use rand_mt::Mt;

use crate::cli::Endpoint;
use crate::error::{Result, TrafgenError};
use crate::reactor::{Event, Interest, Reactor, Wait};
use crate::sock::{self, SendOutcome};

const PAYLOAD_MIN: usize = 32;
const PAYLOAD_MAX: usize = 1024;

/// Largest chunk handed to a single send call.
const CHUNK: usize = 1024;

/// Cumulative connection failures tolerated once the pool has been
/// established; exceeding this shuts the pool down.
const MAX_TOTAL_FAILURES: u32 = 10;

const WAIT_TIMEOUT_MS: i32 = 500;

static ZERO_CHUNK: [u8; CHUNK] = [0u8; CHUNK];

struct Conn {
    fd: OwnedFd,
    total_bytes: usize,
    bytes_sent: usize,
    connecting: bool,
}

/// Shared observability counters, cheap to clone out of the pool.
#[derive(Clone, Default)]
pub struct PoolStats {
    live: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
}

impl PoolStats {
    /// Connections currently open (connecting or sending).
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Connections that finished their whole payload and were recycled.
    pub fn completed_recycles(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

enum Action {
    Nothing,
    Recycle { failed: bool },
    Complete,
}

pub struct ConnPool {
    endpoint: Endpoint,
    target: usize,
    // Declared before the reactor: drop order closes connection fds first,
    // the epoll fd last.
    conns: HashMap<RawFd, Conn>,
    reactor: Reactor,
    rng: Mt,
    failures: u32,
    established_once: bool,
    stats: PoolStats,
    events: Vec<Event>,
    last_reported_count: usize,
}

impl ConnPool {
    pub fn new(endpoint: Endpoint, connections: usize, seed: u32) -> Result<ConnPool> {
        let mut pool = ConnPool {
            endpoint,
            target: connections,
            conns: HashMap::new(),
            reactor: Reactor::new()?,
            rng: Mt::new(seed),
            failures: 0,
            established_once: false,
            stats: PoolStats::default(),
            events: Vec::new(),
            last_reported_count: 0,
        };
        for _ in 0..connections {
            pool.start_connection()?;
        }
        log::info!(
            "client pool: {} connections to {} (seed {})",
            pool.conns.len(),
            endpoint,
            seed
        );
        Ok(pool)
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.clone()
    }

    /// Run until `shutdown` is set or a pool-wide failure occurs.
    ///
    /// Connections are unwatched and closed on every exit path, fatal ones
    /// included, before the reactor itself goes away.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let result = self.drive(shutdown);
        self.teardown();
        result
    }

    fn drive(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            self.refill()?;
            self.turn()?;
            self.report_count_change();
        }
        Ok(())
    }

    /// Log the live count when it moves; quiet while it holds steady.
    fn report_count_change(&mut self) {
        let count = self.conns.len();
        if count != self.last_reported_count {
            log::info!("active connections: {count}/{}", self.target);
            self.last_reported_count = count;
        }
    }

    fn turn(&mut self) -> Result<()> {
        let mut events = std::mem::take(&mut self.events);
        let wait = self.reactor.wait(&mut events, WAIT_TIMEOUT_MS);
        let res = match wait {
            Ok(Wait::Interrupted) => Ok(()),
            Ok(Wait::Ready(_)) => {
                let mut out = Ok(());
                for ev in &events {
                    if let Err(e) = self.on_event(ev.fd, ev.interest) {
                        out = Err(e);
                        break;
                    }
                }
                out
            }
            Err(e) => Err(e),
        };
        self.events = events;
        res
    }

    /// Top the pool back up to the configured target, one attempt per
    /// missing slot.
    fn refill(&mut self) -> Result<()> {
        for _ in self.conns.len()..self.target {
            self.start_connection()?;
        }
        Ok(())
    }

    /// Open one outbound connection and register it with the reactor.
    ///
    /// The payload total is drawn here, so the draw order is exactly the
    /// connection start order.
    fn start_connection(&mut self) -> Result<()> {
        let fd = match sock::connect_start(self.endpoint) {
            Ok(fd) => fd,
            Err(e) if is_refused(&e) => return self.on_refused(),
            Err(e) => return Err(e),
        };

        let total_bytes = draw_total(&mut self.rng);
        let raw = fd.as_raw_fd();
        if let Err(e) = self.reactor.watch(
            raw,
            Interest::WRITABLE | Interest::PEER_HANGUP | Interest::ERROR | Interest::READ_HANGUP,
        ) {
            // fd is dropped (closed) here; it never joins the map.
            return Err(e);
        }

        log::debug!("connection started fd={raw}, will send {total_bytes} bytes");
        self.conns.insert(
            raw,
            Conn {
                fd,
                total_bytes,
                bytes_sent: 0,
                connecting: true,
            },
        );
        self.stats.live.store(self.conns.len(), Ordering::Relaxed);
        Ok(())
    }

    fn on_event(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let action = match self.classify(fd, interest)? {
            Some(action) => action,
            None => return Ok(()),
        };
        match action {
            Action::Nothing => Ok(()),
            Action::Complete => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                self.recycle(fd, false)
            }
            Action::Recycle { failed } => self.recycle(fd, failed),
        }
    }

    /// Decide what to do with a ready connection. Split from the mutation so
    /// the connection map is borrowed once.
    fn classify(&mut self, fd: RawFd, interest: Interest) -> Result<Option<Action>> {
        let conn = match self.conns.get_mut(&fd) {
            Some(conn) => conn,
            None => return Ok(None),
        };

        let errored = interest.contains(Interest::ERROR)
            || interest.contains(Interest::PEER_HANGUP)
            || interest.contains(Interest::READ_HANGUP);

        if conn.connecting {
            // First readiness after connect: the socket error tells whether
            // the handshake succeeded.
            let err = sock::socket_error(fd)?;
            if err != 0 {
                if err == libc::ECONNREFUSED {
                    if !self.established_once {
                        return Err(TrafgenError::Fatal(format!(
                            "server unavailable: {}",
                            self.endpoint
                        )));
                    }
                    log::warn!("connection refused in steady state (fd={fd})");
                } else {
                    log::warn!(
                        "connect failed (fd={fd}): {}",
                        std::io::Error::from_raw_os_error(err)
                    );
                }
                return Ok(Some(Action::Recycle { failed: true }));
            }
            if errored {
                // Hung up before the handshake settled.
                return Ok(Some(Action::Recycle { failed: true }));
            }
            conn.connecting = false;
            self.established_once = true;
            log::debug!("connection established fd={fd}");
        } else if errored {
            // Peer-side termination after establishment: silent recycle.
            log::debug!("connection dropped by peer fd={fd}");
            return Ok(Some(Action::Recycle { failed: false }));
        }

        if !interest.contains(Interest::WRITABLE) {
            return Ok(Some(Action::Nothing));
        }

        // Send until the budget is spent or the socket buffer fills.
        while conn.bytes_sent < conn.total_bytes {
            let to_send = CHUNK.min(conn.total_bytes - conn.bytes_sent);
            match sock::send_nonblock(fd, &ZERO_CHUNK[..to_send]) {
                Ok(SendOutcome::Sent(n)) => conn.bytes_sent += n,
                Ok(SendOutcome::WouldBlock) => return Ok(Some(Action::Nothing)),
                Ok(SendOutcome::Broken) => {
                    log::debug!("connection broken during send fd={fd}");
                    return Ok(Some(Action::Recycle { failed: false }));
                }
                Err(e) => {
                    log::warn!("send failed (fd={fd}): {e}");
                    return Ok(Some(Action::Recycle { failed: true }));
                }
            }
        }

        log::debug!(
            "payload complete fd={fd} ({}/{} bytes)",
            conn.bytes_sent,
            conn.total_bytes
        );
        Ok(Some(Action::Complete))
    }

    /// Close a finished or failed connection and immediately start a
    /// replacement. The failure count is taken before the entry is removed.
    fn recycle(&mut self, fd: RawFd, failed: bool) -> Result<()> {
        if failed {
            self.failures += 1;
        }
        if let Some(conn) = self.conns.remove(&fd) {
            if let Err(e) = self.reactor.unwatch(conn.fd.as_raw_fd()) {
                log::warn!("unwatch fd={fd}: {e}");
            }
            // conn drops here, closing the descriptor after the unwatch.
        }
        self.stats.live.store(self.conns.len(), Ordering::Relaxed);

        if failed && self.failures >= MAX_TOTAL_FAILURES {
            return Err(TrafgenError::Fatal(format!(
                "{MAX_TOTAL_FAILURES} connection failures, giving up"
            )));
        }
        self.start_connection()
    }

    fn on_refused(&mut self) -> Result<()> {
        if !self.established_once {
            return Err(TrafgenError::Fatal(format!(
                "server unavailable: {}",
                self.endpoint
            )));
        }
        self.failures += 1;
        if self.failures >= MAX_TOTAL_FAILURES {
            return Err(TrafgenError::Fatal(format!(
                "{MAX_TOTAL_FAILURES} connection failures, giving up"
            )));
        }
        Ok(())
    }

    fn teardown(&mut self) {
        log::info!("closing {} connections", self.conns.len());
        for (_, conn) in self.conns.drain() {
            let raw = conn.fd.as_raw_fd();
            if let Err(e) = self.reactor.unwatch(raw) {
                log::warn!("unwatch fd={raw}: {e}");
            }
        }
        self.stats.live.store(0, Ordering::Relaxed);
    }
}

fn draw_total(rng: &mut Mt) -> usize {
    rng.gen_range(PAYLOAD_MIN..=PAYLOAD_MAX)
}

fn is_refused(err: &TrafgenError) -> bool {
    match err {
        TrafgenError::Socket(io) => io.raw_os_error() == Some(libc::ECONNREFUSED),
        _ => false,
    }
}

/// The payload totals a pool with this seed would draw, in order.
#[cfg(test)]
pub(crate) fn payload_lengths(seed: u32, count: usize) -> Vec<usize> {
    let mut rng = Mt::new(seed);
    (0..count).map(|_| draw_total(&mut rng)).collect()
}
