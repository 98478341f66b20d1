// Drain server: accept every connection, read and discard everything.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cli::Endpoint;
use crate::error::Result;
use crate::reactor::{Event, Interest, Reactor, Wait};
use crate::sock::{self, Accepted, Listener, RecvOutcome};

/// Receive scratch buffer size for the drain loop.
const DRAIN_BUF: usize = 4096;

/// Poll granularity of the main loop; bounds shutdown latency.
const WAIT_TIMEOUT_MS: i32 = 500;

/// Shared observability counters, cheap to clone out of the server.
#[derive(Clone, Default)]
pub struct ServerStats {
    active: Arc<AtomicUsize>,
    accepted_total: Arc<AtomicU64>,
}

impl ServerStats {
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn accepted_total(&self) -> u64 {
        self.accepted_total.load(Ordering::Relaxed)
    }
}

pub struct DrainServer {
    // Declared before the reactor: drop order closes client and listener
    // fds first, the epoll fd last.
    clients: HashMap<RawFd, OwnedFd>,
    listener: Listener,
    reactor: Reactor,
    stats: ServerStats,
    events: Vec<Event>,
}

impl DrainServer {
    pub fn new(endpoint: Endpoint) -> Result<DrainServer> {
        let listener = Listener::bind(endpoint)?;
        let reactor = Reactor::new()?;
        reactor.watch(listener.as_raw_fd(), Interest::READABLE)?;
        log::info!("listening on {}:{}", endpoint.host, listener.local_port());

        Ok(DrainServer {
            clients: HashMap::new(),
            listener,
            reactor,
            stats: ServerStats::default(),
            events: Vec::new(),
        })
    }

    /// Actual bound port; differs from the requested one when binding port 0.
    pub fn local_port(&self) -> u16 {
        self.listener.local_port()
    }

    /// Counters handle for observers (tests, stats output).
    pub fn stats(&self) -> ServerStats {
        self.stats.clone()
    }

    /// Run until `shutdown` is set, then close every connection and the
    /// listener. Teardown also runs when the loop dies on a reactor
    /// failure, so watched descriptors are unwatched and closed before the
    /// reactor itself goes away.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let result = self.drive(shutdown);
        self.teardown();
        result
    }

    fn drive(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            self.turn()?;
        }
        Ok(())
    }

    /// One wait-and-dispatch cycle.
    fn turn(&mut self) -> Result<()> {
        let mut events = std::mem::take(&mut self.events);
        match self.reactor.wait(&mut events, WAIT_TIMEOUT_MS)? {
            Wait::Interrupted => {
                self.events = events;
                return Ok(());
            }
            Wait::Ready(_) => {}
        }

        let listener_fd = self.listener.as_raw_fd();
        for ev in &events {
            if ev.fd == listener_fd {
                self.accept_pending()?;
            } else {
                self.handle_client(ev.fd, ev.interest)?;
            }
        }
        self.events = events;
        Ok(())
    }

    /// Drain the accept queue. Several clients may have arrived between two
    /// waits; level-triggered readiness only clears once the queue is empty.
    fn accept_pending(&mut self) -> Result<()> {
        loop {
            match sock::accept_next(&self.listener) {
                Ok(Accepted::Conn { fd, peer }) => {
                    let raw = fd.as_raw_fd();
                    if let Err(e) = self
                        .reactor
                        .watch(raw, Interest::READABLE | Interest::READ_HANGUP)
                    {
                        // fd is dropped (closed) here; it never joins the map.
                        log::warn!("failed to watch accepted fd={raw}: {e}");
                        continue;
                    }
                    log::debug!("accepted {peer} (fd={raw})");
                    self.clients.insert(raw, fd);
                    self.stats.active.store(self.clients.len(), Ordering::Relaxed);
                    self.stats.accepted_total.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Accepted::WouldBlock) => return Ok(()),
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    return Ok(());
                }
            }
        }
    }

    fn handle_client(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if !self.clients.contains_key(&fd) {
            return Ok(());
        }

        if interest.contains(Interest::READ_HANGUP)
            || interest.contains(Interest::PEER_HANGUP)
            || interest.contains(Interest::ERROR)
        {
            self.close_client(fd);
            return Ok(());
        }

        if interest.contains(Interest::READABLE) {
            self.drain_client(fd);
        }
        Ok(())
    }

    /// Read and discard until the buffer is empty or the peer is gone.
    fn drain_client(&mut self, fd: RawFd) {
        let mut buf = [0u8; DRAIN_BUF];
        loop {
            match sock::recv_nonblock(fd, &mut buf) {
                Ok(RecvOutcome::Data(_)) => continue,
                Ok(RecvOutcome::WouldBlock) => return,
                Ok(RecvOutcome::Eof) => {
                    log::debug!("client closed (fd={fd})");
                    self.close_client(fd);
                    return;
                }
                Err(e) => {
                    log::warn!("recv failed (fd={fd}): {e}");
                    self.close_client(fd);
                    return;
                }
            }
        }
    }

    fn close_client(&mut self, fd: RawFd) {
        if let Err(e) = self.reactor.unwatch(fd) {
            log::warn!("unwatch fd={fd}: {e}");
        }
        // Dropping the OwnedFd closes the descriptor, after the unwatch.
        self.clients.remove(&fd);
        self.stats.active.store(self.clients.len(), Ordering::Relaxed);
    }

    fn teardown(&mut self) {
        log::info!("shutting down, closing {} connections", self.clients.len());
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            self.close_client(fd);
        }
        if let Err(e) = self.reactor.unwatch(self.listener.as_raw_fd()) {
            log::warn!("unwatch listener: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{Ipv4Addr, TcpStream};
    use std::time::{Duration, Instant};

    fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn spawn_server() -> (u16, ServerStats, Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let mut server = DrainServer::new(Endpoint {
            host: Ipv4Addr::LOCALHOST,
            port: 0,
        })
        .unwrap();
        let port = server.local_port();
        let stats = server.stats();
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            server.run(&stop2).unwrap();
        });
        (port, stats, stop, handle)
    }

    // Accepted connection shows up in the active count, disappears on EOF.
    #[test]
    fn accept_then_eof_closes() {
        let (port, stats, stop, handle) = spawn_server();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(&[0u8; 2048]).unwrap();
        assert!(wait_until(2000, || stats.active_connections() == 1));

        drop(client);
        assert!(wait_until(2000, || stats.active_connections() == 0));
        assert_eq!(stats.accepted_total(), 1);

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    // Several clients arriving together are all accepted in one readiness
    // burst.
    #[test]
    fn accepts_burst_of_clients() {
        let (port, stats, stop, handle) = spawn_server();

        let clients: Vec<TcpStream> = (0..8)
            .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
            .collect();
        assert!(wait_until(2000, || stats.active_connections() == 8));

        drop(clients);
        assert!(wait_until(2000, || stats.active_connections() == 0));

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    // Shutdown with live connections closes them all and returns.
    #[test]
    fn shutdown_closes_live_connections() {
        let (port, stats, stop, handle) = spawn_server();

        let _c1 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let _c2 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_until(2000, || stats.active_connections() == 2));

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        assert_eq!(stats.active_connections(), 0);
    }
}
