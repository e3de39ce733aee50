//! Per-peer state machine: handshake, keep-alive, teardown, and the
//! routing of inbound packets to the transfers the connection owns.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{Config, Timing};
use crate::link::{Delivery, Outbound};
use crate::packet::{self, Flags, Packet};
use crate::receiver::Receiver;
use crate::scheduler::{PollStatus, Pollable};
use crate::sender::{Sender, TransferKind};

/// Connection lifecycle. `Dead` is terminal; the host's sweep removes
/// dead connections from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Connected,
    Dead,
}

/// One file or message exchange, either direction. The connection owns
/// its transfers and polls them each tick.
pub trait Transfer: Pollable {
    fn receive(&mut self, packet: Packet);
    fn kill(&mut self);
}

pub struct Connection {
    peer: SocketAddr,
    state: State,
    /// True when this side sent the first SYN; only the initiator
    /// drives the handshake resend timer.
    initiated: bool,
    /// Validated inbound packets awaiting processing, arrival order.
    pending: VecDeque<Packet>,
    transfers: HashMap<u8, Box<dyn Transfer>>,
    out: Arc<dyn Outbound>,
    delivery: Arc<dyn Delivery>,
    fragment_size: usize,
    window_size: usize,
    max_transfers: usize,
    timing: Timing,
    last_recv: Instant,
    last_send: Instant,
    last_handshake: Instant,
}

impl Connection {
    pub fn new(
        peer: SocketAddr,
        out: Arc<dyn Outbound>,
        delivery: Arc<dyn Delivery>,
        cfg: &Config,
    ) -> Connection {
        let now = Instant::now();
        Connection {
            peer,
            state: State::Idle,
            initiated: false,
            pending: VecDeque::new(),
            transfers: HashMap::new(),
            out,
            delivery,
            fragment_size: cfg.fragment_size,
            window_size: cfg.window_size,
            max_transfers: cfg.max_transfers,
            timing: cfg.timing(),
            last_recv: now,
            last_send: now,
            last_handshake: now,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    /// Validate a raw datagram and append it to the pending queue.
    pub fn ingest(&mut self, data: &[u8]) {
        if !packet::is_valid(data) {
            tracing::warn!(peer = %self.peer, "invalid packet");
            return;
        }
        match packet::deconstruct(data) {
            Ok(p) => {
                self.pending.push_back(p);
                self.last_recv = Instant::now();
            }
            Err(e) => tracing::warn!(peer = %self.peer, %e, "failed to deconstruct packet"),
        }
    }

    /// Initiate the handshake.
    pub fn connect(&mut self) {
        self.initiated = true;
        self.state = State::Connecting;
        self.send(b"", Flags::SYN, 0);
        self.last_handshake = Instant::now();
        tracing::info!(peer = %self.peer, "connecting");
    }

    /// Tear the connection down: kill transfers, tell the peer, die.
    pub fn disconnect(&mut self) {
        self.kill_transfers();
        self.send(b"", Flags::FIN, 0);
        self.state = State::Dead;
        tracing::info!(peer = %self.peer, "disconnected");
    }

    /// Start an outbound file transfer, if a transfer slot is free.
    pub fn send_file(&mut self, data: &[u8], name: &str, ext: &str) {
        let kind = TransferKind::File {
            name: name.to_string(),
            ext: ext.trim_start_matches('.').to_string(),
        };
        self.start_sender(data, kind);
    }

    /// Start an outbound message transfer, if a transfer slot is free.
    pub fn send_msg(&mut self, data: &[u8]) {
        self.start_sender(data, TransferKind::Msg);
    }

    fn start_sender(&mut self, data: &[u8], kind: TransferKind) {
        if self.state != State::Connected {
            tracing::warn!(peer = %self.peer, "not connected, dropping transfer request");
            return;
        }
        let Some(id) = self.free_transfer_id() else {
            tracing::warn!(peer = %self.peer, "transfer slots exhausted, dropping request");
            return;
        };
        let mut sender = Sender::new(
            id,
            self.peer,
            kind,
            self.out.clone(),
            self.fragment_size,
            self.window_size,
            self.timing,
        );
        if let Err(e) = sender.prepare(data, Flags::SR) {
            tracing::warn!(peer = %self.peer, %e, "cannot fragment payload, dropping request");
            return;
        }
        self.transfers.insert(id, Box::new(sender));
    }

    fn free_transfer_id(&self) -> Option<u8> {
        if self.transfers.len() >= self.max_transfers {
            return None;
        }
        (0..self.max_transfers as u8).find(|id| !self.transfers.contains_key(id))
    }

    fn kill_transfers(&mut self) {
        for transfer in self.transfers.values_mut() {
            transfer.kill();
        }
        self.transfers.clear();
    }

    fn send(&mut self, payload: &[u8], flags: Flags, seq: u8) {
        match packet::construct(payload, flags, 0, seq) {
            Ok(bytes) => {
                self.out.send_to(&bytes, self.peer);
                self.last_send = Instant::now();
            }
            Err(e) => tracing::warn!(peer = %self.peer, %e, "dropping packet"),
        }
    }

    fn process_pending(&mut self) -> bool {
        let mut work = false;
        while let Some(p) = self.pending.pop_front() {
            work = true;
            self.dispatch(p);
            if self.state == State::Dead {
                self.pending.clear();
                break;
            }
        }
        work
    }

    fn dispatch(&mut self, p: Packet) {
        if p.flags == Flags::SYN {
            self.on_syn(&p);
        } else if p.flags == (Flags::SYN | Flags::ACK) {
            self.on_syn_ack(&p);
        } else if p.flags == (Flags::SYN | Flags::SACK) {
            self.on_syn_sack(&p);
        } else if p.flags == Flags::SACK && self.state == State::Connecting {
            self.on_syn_sack(&p);
        } else if self.state == State::Connected {
            self.dispatch_connected(p);
        } else {
            // Not connected and not a handshake packet: hostile or
            // hopelessly out of sync, cut the peer loose.
            tracing::warn!(peer = %self.peer, flags = %p.flags, "unexpected packet while not connected");
            self.disconnect();
        }
    }

    fn on_syn(&mut self, p: &Packet) {
        if self.state == State::Connected {
            tracing::warn!(peer = %self.peer, "SYN while connected, dropping");
            return;
        }
        if !p.is_fresh(self.timing.ttl) {
            tracing::warn!(peer = %self.peer, "stale SYN, dropping");
            return;
        }
        // Simultaneous open lands here too: both peers answer SYN|ACK.
        self.send(b"", Flags::SYN | Flags::ACK, 0);
        self.state = State::Connecting;
        tracing::info!(peer = %self.peer, "received SYN");
    }

    fn on_syn_ack(&mut self, p: &Packet) {
        if self.state != State::Connecting && self.state != State::Connected {
            tracing::warn!(peer = %self.peer, "unexpected SYN|ACK, disconnecting");
            self.disconnect();
            return;
        }
        if !p.is_fresh(self.timing.ttl) {
            tracing::warn!(peer = %self.peer, "stale SYN|ACK, dropping");
            return;
        }
        self.send(b"", Flags::SYN | Flags::SACK, 0);
        if self.state == State::Connecting {
            self.state = State::Connected;
            tracing::info!(peer = %self.peer, "connected");
        }
    }

    fn on_syn_sack(&mut self, p: &Packet) {
        match self.state {
            State::Connecting => {
                if !p.is_fresh(self.timing.ttl) {
                    tracing::warn!(peer = %self.peer, "stale SYN|SACK, dropping");
                    return;
                }
                self.state = State::Connected;
                tracing::info!(peer = %self.peer, "connected");
            }
            // Keep-alive refresh only; last_recv already moved forward.
            State::Connected => {}
            _ => {
                tracing::warn!(peer = %self.peer, "unexpected SYN|SACK, disconnecting");
                self.disconnect();
            }
        }
    }

    fn dispatch_connected(&mut self, p: Packet) {
        if p.flags == Flags::FILE {
            self.on_transfer_init(p);
        } else if p.flags == Flags::MSG {
            self.on_transfer_init(p);
        } else if p.flags.contains(Flags::SR) {
            // Data fragment; the header field says which transfer.
            match self.transfers.get_mut(&p.transfer_id) {
                Some(t) => t.receive(p),
                None => {
                    tracing::warn!(peer = %self.peer, id = p.transfer_id, "fragment for unknown transfer")
                }
            }
        } else if p.flags == Flags::FIN && p.payload.is_empty() {
            // The peer tore the connection down.
            tracing::info!(peer = %self.peer, "peer disconnected");
            self.kill_transfers();
            self.state = State::Dead;
        } else if p.flags == Flags::SACK && p.payload.is_empty() {
            // Bare SACK while connected: liveness refresh, nothing more.
            tracing::debug!(peer = %self.peer, "keep-alive refresh");
        } else if p.flags == Flags::ACK || p.flags == Flags::SACK || p.flags == Flags::FIN {
            self.on_transfer_control(p);
        } else {
            tracing::warn!(peer = %self.peer, flags = %p.flags, "unhandled packet, dropping");
        }
    }

    /// FILE/MSG init: payload carries the sender's transfer id; register
    /// a receiver under it and let the receiver answer.
    fn on_transfer_init(&mut self, p: Packet) {
        let Some(id) = parse_init_id(&p.payload) else {
            tracing::warn!(peer = %self.peer, "malformed transfer init, dropping");
            return;
        };
        if !self.transfers.contains_key(&id) {
            if self.transfers.len() >= self.max_transfers {
                tracing::warn!(peer = %self.peer, id, "transfer slots exhausted, refusing transfer");
                return;
            }
            let receiver = Receiver::new(
                id,
                self.peer,
                self.out.clone(),
                self.delivery.clone(),
                self.timing,
            );
            self.transfers.insert(id, Box::new(receiver));
        }
        // Duplicate inits land on the existing receiver, which simply
        // SACKs again.
        if let Some(t) = self.transfers.get_mut(&id) {
            t.receive(p);
        }
    }

    /// ACK/SACK/FIN with a decimal transfer id as payload.
    fn on_transfer_control(&mut self, p: Packet) {
        let Some(id) = parse_decimal_id(&p.payload) else {
            tracing::warn!(peer = %self.peer, flags = %p.flags, "control packet without transfer id, dropping");
            return;
        };
        match self.transfers.get_mut(&id) {
            Some(t) => t.receive(p),
            None => tracing::warn!(peer = %self.peer, id, "control packet for unknown transfer"),
        }
    }
}

fn parse_decimal_id(payload: &[u8]) -> Option<u8> {
    std::str::from_utf8(payload).ok()?.parse().ok()
}

/// `"<name><ext>:<id>"` for files, `"<id>"` for messages.
fn parse_init_id(payload: &[u8]) -> Option<u8> {
    let text = std::str::from_utf8(payload).ok()?;
    let id = match text.rsplit_once(':') {
        Some((_, id)) => id,
        None => text,
    };
    id.parse().ok()
}

impl Pollable for Connection {
    fn poll(&mut self) -> PollStatus {
        if self.state == State::Dead {
            return PollStatus::Finished;
        }
        if self.last_recv.elapsed() > self.timing.keepalive {
            tracing::warn!(peer = %self.peer, "peer silent beyond keep-alive, connection dead");
            self.kill_transfers();
            self.state = State::Dead;
            return PollStatus::Finished;
        }

        let mut work = self.process_pending();
        if self.state == State::Dead {
            return PollStatus::Finished;
        }

        // Initiator re-sends SYN until the handshake answers come back.
        if self.state == State::Connecting
            && self.initiated
            && self.last_handshake.elapsed() >= self.timing.conn_resend
        {
            self.send(b"", Flags::SYN, 0);
            self.last_handshake = Instant::now();
            work = true;
        }

        // Heartbeat: nothing sent or received for a while, prod the peer.
        if self.state == State::Connected
            && self.last_send.elapsed() >= self.timing.resend
            && self.last_recv.elapsed() >= self.timing.resend
        {
            self.send(b"", Flags::SYN | Flags::SACK, 0);
            work = true;
        }

        let mut finished: Vec<u8> = Vec::new();
        for (id, transfer) in self.transfers.iter_mut() {
            match transfer.poll() {
                PollStatus::Finished => finished.push(*id),
                PollStatus::Running => work = true,
                PollStatus::Sleeping => {}
            }
        }
        for id in finished {
            self.transfers.remove(&id);
        }

        if work {
            PollStatus::Running
        } else {
            PollStatus::Sleeping
        }
    }
}
