//! The host owns the socket and the connection registry, and drives the
//! cooperative scheduler. An external console thread reaches the
//! registry only through the mutex-guarded table.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::Config;
use crate::connection::{Connection, State};
use crate::link::{Delivery, LogDelivery, Outbound, UdpOutbound};
use crate::scheduler::{PollStatus, Pollable, UnitQueue};

/// Datagrams drained per socket-reader tick, so one busy peer cannot
/// starve the other scheduled units.
const DATAGRAMS_PER_TICK: usize = 64;
/// Dead connections are purged from the registry this often.
const SWEEP_INTERVAL_TICKS: u64 = 2;
/// Sleep when a whole tick did no work, so the loop does not spin.
const IDLE_TICK: Duration = Duration::from_millis(1);
const RECV_BUF: usize = 2048;
/// Peers must live in the dynamic/private port range.
const PORT_MIN: u16 = 49152;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("host already registered")]
    AlreadyRegistered,
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn lock_conn(conn: &Arc<Mutex<Connection>>) -> MutexGuard<'_, Connection> {
    // A poisoned connection still has consistent protocol state; the
    // loop must keep running.
    conn.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mutex-guarded connection registry, shared between the scheduler
/// thread and the external command source.
#[derive(Default)]
pub struct ConnectionTable {
    inner: Mutex<Vec<Arc<Mutex<Connection>>>>,
}

impl ConnectionTable {
    fn guard(&self) -> MutexGuard<'_, Vec<Arc<Mutex<Connection>>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, peer: SocketAddr) -> Option<Arc<Mutex<Connection>>> {
        self.guard()
            .iter()
            .find(|c| lock_conn(c).peer() == peer)
            .cloned()
    }

    pub fn insert(&self, conn: Arc<Mutex<Connection>>) {
        self.guard().push(conn);
    }

    pub fn all(&self) -> Vec<Arc<Mutex<Connection>>> {
        self.guard().clone()
    }

    pub fn snapshot(&self) -> Vec<(SocketAddr, State)> {
        self.guard()
            .iter()
            .map(|c| {
                let c = lock_conn(c);
                (c.peer(), c.state())
            })
            .collect()
    }

    pub fn sweep_dead(&self) {
        self.guard().retain(|c| lock_conn(c).state() != State::Dead);
    }

    pub fn clear(&self) {
        self.guard().clear();
    }
}

/// A connection as a scheduler unit.
struct ConnectionUnit(Arc<Mutex<Connection>>);

impl Pollable for ConnectionUnit {
    fn poll(&mut self) -> PollStatus {
        lock_conn(&self.0).poll()
    }
}

/// The scheduler unit that drains the socket: validate nothing here,
/// just route raw bytes to the owning connection, creating it lazily.
struct SocketReader {
    socket: Arc<UdpSocket>,
    me: SocketAddr,
    table: Arc<ConnectionTable>,
    units: Arc<UnitQueue>,
    out: Arc<dyn Outbound>,
    delivery: Arc<dyn Delivery>,
    cfg: Arc<Mutex<Config>>,
}

impl Pollable for SocketReader {
    fn poll(&mut self) -> PollStatus {
        let mut buf = [0u8; RECV_BUF];
        let mut work = false;
        for _ in 0..DATAGRAMS_PER_TICK {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if from == self.me {
                        tracing::debug!(%from, "ignoring spoofed datagram");
                        continue;
                    }
                    let conn = match self.table.get(from) {
                        Some(c) => c,
                        None => {
                            tracing::debug!(peer = %from, "new inbound connection");
                            let cfg = self.cfg.lock().unwrap_or_else(|e| e.into_inner()).clone();
                            let conn = Arc::new(Mutex::new(Connection::new(
                                from,
                                self.out.clone(),
                                self.delivery.clone(),
                                &cfg,
                            )));
                            self.table.insert(conn.clone());
                            self.units.push(Box::new(ConnectionUnit(conn.clone())));
                            conn
                        }
                    };
                    lock_conn(&conn).ingest(&buf[..n]);
                    work = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(%e, "socket read failed");
                    break;
                }
            }
        }
        if work {
            PollStatus::Running
        } else {
            PollStatus::Sleeping
        }
    }
}

struct HostLink {
    socket: Arc<UdpSocket>,
    out: Arc<dyn Outbound>,
}

/// One endpoint: bound socket, registry, scheduler. Operations are
/// callable from another thread while `run` ticks.
pub struct Host {
    me: Mutex<SocketAddr>,
    cfg: Arc<Mutex<Config>>,
    link: Mutex<Option<HostLink>>,
    table: Arc<ConnectionTable>,
    units: Arc<UnitQueue>,
    running: AtomicBool,
    ticks: AtomicU64,
    delivery: Arc<dyn Delivery>,
}

impl Host {
    pub fn new(addr: SocketAddr, cfg: Config) -> Host {
        Host::with_delivery(addr, cfg, Arc::new(LogDelivery))
    }

    pub fn with_delivery(addr: SocketAddr, cfg: Config, delivery: Arc<dyn Delivery>) -> Host {
        Host {
            me: Mutex::new(addr),
            cfg: Arc::new(Mutex::new(cfg)),
            link: Mutex::new(None),
            table: Arc::new(ConnectionTable::default()),
            units: Arc::new(UnitQueue::new()),
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            delivery,
        }
    }

    /// Bind the non-blocking socket and put the socket reader on the
    /// schedule. The bound address may differ from the configured one
    /// (port 0 picks an ephemeral port).
    pub fn register(&self) -> Result<(), HostError> {
        let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        if link.is_some() {
            return Err(HostError::AlreadyRegistered);
        }
        let addr = *self.lock_me();
        let socket = UdpSocket::bind(addr).map_err(|source| HostError::Bind { addr, source })?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        if local != addr {
            tracing::warn!(configured = %addr, bound = %local, "bound to a different address");
        }
        *self.lock_me() = local;

        let socket = Arc::new(socket);
        let out: Arc<dyn Outbound> = Arc::new(UdpOutbound::new(socket.clone()));
        self.table.clear();
        self.units.clear();
        self.units.push(Box::new(SocketReader {
            socket: socket.clone(),
            me: local,
            table: self.table.clone(),
            units: self.units.clone(),
            out: out.clone(),
            delivery: self.delivery.clone(),
            cfg: self.cfg.clone(),
        }));
        *link = Some(HostLink { socket, out });
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(%local, "host registered");
        Ok(())
    }

    /// Close the socket and halt the loop.
    pub fn unregister(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        tracing::info!("host unregistered");
    }

    /// Drive the scheduler until `stop` or `unregister`.
    pub fn run(&self) {
        let mut units: Vec<Box<dyn Pollable>> = Vec::new();
        while self.running.load(Ordering::SeqCst) {
            self.tick(&mut units);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn tick(&self, units: &mut Vec<Box<dyn Pollable>>) {
        units.extend(self.units.drain());
        let mut any_running = false;
        units.retain_mut(|unit| match unit.poll() {
            PollStatus::Finished => false,
            PollStatus::Running => {
                any_running = true;
                true
            }
            PollStatus::Sleeping => true,
        });
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks % SWEEP_INTERVAL_TICKS == 0 {
            self.table.sweep_dead();
        }
        if !any_running {
            std::thread::sleep(IDLE_TICK);
        }
    }

    /// Open (or re-use) a connection to a peer and start the handshake.
    pub fn connect(&self, ip: IpAddr, port: u16) {
        let peer = SocketAddr::new(ip, port);
        if self.table.get(peer).is_some() {
            tracing::warn!(%peer, "connection already exists");
            return;
        }
        let Some(out) = self.out() else {
            tracing::warn!("host not registered, cannot connect");
            return;
        };
        let cfg = self.lock_cfg().clone();
        let conn = Arc::new(Mutex::new(Connection::new(
            peer,
            out,
            self.delivery.clone(),
            &cfg,
        )));
        self.table.insert(conn.clone());
        self.units.push(Box::new(ConnectionUnit(conn.clone())));
        lock_conn(&conn).connect();
    }

    pub fn disconnect(&self, ip: IpAddr, port: u16) {
        let peer = SocketAddr::new(ip, port);
        match self.table.get(peer) {
            Some(conn) => lock_conn(&conn).disconnect(),
            None => tracing::warn!(%peer, "connection does not exist"),
        }
    }

    pub fn disconnect_all(&self) {
        for conn in self.table.all() {
            lock_conn(&conn).disconnect();
        }
        tracing::info!("disconnected from all peers");
    }

    pub fn send_file(&self, ip: IpAddr, port: u16, data: &[u8], name: &str, ext: &str) {
        let peer = SocketAddr::new(ip, port);
        match self.table.get(peer) {
            Some(conn) => lock_conn(&conn).send_file(data, name, ext),
            None => tracing::warn!(%peer, "connection does not exist"),
        }
    }

    pub fn send_msg(&self, ip: IpAddr, port: u16, data: &[u8]) {
        let peer = SocketAddr::new(ip, port);
        match self.table.get(peer) {
            Some(conn) => lock_conn(&conn).send_msg(data),
            None => tracing::warn!(%peer, "connection does not exist"),
        }
    }

    pub fn list_connections(&self) -> Vec<(SocketAddr, State)> {
        self.table.snapshot()
    }

    /// Reject our own address (spoof) and ports outside the dynamic
    /// range.
    pub fn validate_addr(&self, ip: IpAddr, port: u16) -> bool {
        let addr = SocketAddr::new(ip, port);
        if addr == *self.lock_me() {
            return false;
        }
        port >= PORT_MIN
    }

    pub fn local_addr(&self) -> SocketAddr {
        *self.lock_me()
    }

    pub fn fragment_size(&self) -> usize {
        self.lock_cfg().fragment_size
    }

    /// Applies to connections created from now on.
    pub fn set_fragment_size(&self, size: usize) {
        self.lock_cfg().fragment_size = size;
    }

    fn out(&self) -> Option<Arc<dyn Outbound>> {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|l| l.out.clone())
    }

    fn lock_me(&self) -> MutexGuard<'_, SocketAddr> {
        self.me.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_cfg(&self) -> MutexGuard<'_, Config> {
        self.cfg.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::CollectDelivery;
    use std::time::Instant;

    fn mk_host(cfg: Config) -> (Host, Arc<CollectDelivery>) {
        let delivery = Arc::new(CollectDelivery::default());
        let host = Host::with_delivery("127.0.0.1:0".parse().unwrap(), cfg, delivery.clone());
        host.register().expect("bind loopback");
        (host, delivery)
    }

    fn tick_both(
        a: &Host,
        ua: &mut Vec<Box<dyn Pollable>>,
        b: &Host,
        ub: &mut Vec<Box<dyn Pollable>>,
    ) {
        a.tick(ua);
        b.tick(ub);
    }

    fn both_connected(a: &Host, b: &Host) -> bool {
        let ok = |list: Vec<(SocketAddr, State)>| {
            list.iter().any(|(_, s)| *s == State::Connected)
        };
        ok(a.list_connections()) && ok(b.list_connections())
    }

    #[test]
    fn validate_addr_rejects_self_and_low_ports() {
        let (host, _) = mk_host(Config::default());
        let me = host.local_addr();
        assert!(!host.validate_addr(me.ip(), me.port()));
        assert!(!host.validate_addr("127.0.0.1".parse().unwrap(), 8080));
        assert!(host.validate_addr("127.0.0.1".parse().unwrap(), 50000));
        host.unregister();
    }

    #[test]
    fn two_hosts_reach_connected() {
        let (a, _) = mk_host(Config::default());
        let (b, _) = mk_host(Config::default());
        let b_addr = b.local_addr();
        a.connect(b_addr.ip(), b_addr.port());

        let (mut ua, mut ub) = (Vec::new(), Vec::new());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !both_connected(&a, &b) {
            assert!(Instant::now() < deadline, "handshake did not complete");
            tick_both(&a, &mut ua, &b, &mut ub);
        }
        a.unregister();
        b.unregister();
    }

    #[test]
    fn duplicate_connect_is_a_noop() {
        let (a, _) = mk_host(Config::default());
        let peer: SocketAddr = "127.0.0.1:50505".parse().unwrap();
        a.connect(peer.ip(), peer.port());
        a.connect(peer.ip(), peer.port());
        assert_eq!(a.list_connections().len(), 1);
        a.unregister();
    }

    #[test]
    fn ten_kilobyte_message_arrives_intact() {
        let (a, _) = mk_host(Config::default());
        let (b, delivery_b) = mk_host(Config::default());
        let b_addr = b.local_addr();
        a.connect(b_addr.ip(), b_addr.port());

        let (mut ua, mut ub) = (Vec::new(), Vec::new());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !both_connected(&a, &b) {
            assert!(Instant::now() < deadline, "handshake did not complete");
            tick_both(&a, &mut ua, &b, &mut ub);
        }

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        a.send_msg(b_addr.ip(), b_addr.port(), &payload);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let msgs = delivery_b.msgs.lock().unwrap();
                if let Some((from, bytes)) = msgs.first() {
                    assert_eq!(*from, a.local_addr());
                    assert_eq!(*bytes, payload);
                    break;
                }
            }
            assert!(Instant::now() < deadline, "message did not arrive");
            tick_both(&a, &mut ua, &b, &mut ub);
        }
        a.unregister();
        b.unregister();
    }

    #[test]
    fn file_transfer_delivers_name_ext_and_bytes() {
        let (a, _) = mk_host(Config::default());
        let (b, delivery_b) = mk_host(Config::default());
        let b_addr = b.local_addr();
        a.connect(b_addr.ip(), b_addr.port());

        let (mut ua, mut ub) = (Vec::new(), Vec::new());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !both_connected(&a, &b) {
            assert!(Instant::now() < deadline, "handshake did not complete");
            tick_both(&a, &mut ua, &b, &mut ub);
        }

        a.send_file(b_addr.ip(), b_addr.port(), b"hello file", "notes", "txt");
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let files = delivery_b.files.lock().unwrap();
                if let Some((_, name, ext, bytes)) = files.first() {
                    assert_eq!(name, "notes");
                    assert_eq!(ext, "txt");
                    assert_eq!(*bytes, b"hello file".to_vec());
                    break;
                }
            }
            assert!(Instant::now() < deadline, "file did not arrive");
            tick_both(&a, &mut ua, &b, &mut ub);
        }
        a.unregister();
        b.unregister();
    }

    #[test]
    fn silent_peer_is_purged_from_registry() {
        let mut cfg = Config::default();
        cfg.keepalive_ms = 50;
        let (a, _) = mk_host(cfg);
        // A peer that exists but never answers.
        let mute = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mute_addr = mute.local_addr().unwrap();
        a.connect(mute_addr.ip(), mute_addr.port());
        assert_eq!(a.list_connections().len(), 1);

        let mut ua = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !a.list_connections().is_empty() {
            assert!(Instant::now() < deadline, "dead connection not purged");
            a.tick(&mut ua);
        }
        a.unregister();
    }

    #[test]
    fn run_halts_on_stop() {
        let (host, _) = mk_host(Config::default());
        let host = Arc::new(host);
        let runner = host.clone();
        let handle = std::thread::spawn(move || runner.run());
        std::thread::sleep(Duration::from_millis(20));
        host.stop();
        handle.join().expect("run thread exits cleanly");
        host.unregister();
    }

    #[test]
    fn operations_without_registration_are_logged_noops() {
        let host = Host::new("127.0.0.1:0".parse().unwrap(), Config::default());
        host.connect("127.0.0.1".parse().unwrap(), 50000);
        host.send_msg("127.0.0.1".parse().unwrap(), 50000, b"nope");
        assert!(host.list_connections().is_empty());
    }

    #[test]
    fn fragment_size_is_a_live_property() {
        let host = Host::new("127.0.0.1:0".parse().unwrap(), Config::default());
        assert_eq!(host.fragment_size(), 1468);
        host.set_fragment_size(512);
        assert_eq!(host.fragment_size(), 512);
    }
}
