//! Outbound half of a transfer: fragment the payload, keep a bounded
//! window in flight, retransmit on TTL expiry, tear down with FIN.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Timing;
use crate::connection::Transfer;
use crate::link::Outbound;
use crate::packet::{self, Flags, Packet, PacketError};
use crate::scheduler::{PollStatus, Pollable};

/// FIN is re-sent this many times before the sender finishes anyway.
const FIN_ATTEMPTS: u8 = 2;

/// What is being transferred; decides the init packet the peer sees.
#[derive(Debug, Clone)]
pub enum TransferKind {
    /// `ext` without the dot, empty when the file has none.
    File { name: String, ext: String },
    Msg,
}

pub struct Sender {
    id: u8,
    peer: SocketAddr,
    out: Arc<dyn Outbound>,
    kind: TransferKind,
    fragment_size: usize,
    window_size: usize,
    timing: Timing,
    /// Rolling counter; the next fragment prepared gets this number.
    seq: u8,
    /// Set by the peer's SACK; no data moves before it.
    started: bool,
    init_sent: Option<Instant>,
    pending: VecDeque<Packet>,
    in_flight: Vec<Packet>,
    /// Sequence numbers acknowledged since the last tick.
    acks: HashSet<u8>,
    last_activity: Instant,
    fin_attempts: u8,
    fin_sent: Option<Instant>,
    alive: bool,
}

impl Sender {
    pub fn new(
        id: u8,
        peer: SocketAddr,
        kind: TransferKind,
        out: Arc<dyn Outbound>,
        fragment_size: usize,
        window_size: usize,
        timing: Timing,
    ) -> Sender {
        Sender {
            id,
            peer,
            out,
            kind,
            fragment_size,
            window_size,
            timing,
            seq: 0,
            started: false,
            init_sent: None,
            pending: VecDeque::new(),
            in_flight: Vec::new(),
            acks: HashSet::new(),
            last_activity: Instant::now(),
            fin_attempts: FIN_ATTEMPTS,
            fin_sent: None,
            alive: true,
        }
    }

    /// Fragment `data` and queue every piece for windowed delivery.
    pub fn prepare(&mut self, data: &[u8], flags: Flags) -> Result<(), PacketError> {
        let fragments = packet::fragment(data, self.seq, self.fragment_size, flags, self.id)?;
        tracing::debug!(id = self.id, peer = %self.peer, count = fragments.len(), "prepared fragments");
        self.pending.extend(fragments);
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn send_init(&mut self) {
        let (payload, flags) = match &self.kind {
            TransferKind::File { name, ext } if ext.is_empty() => {
                (format!("{name}:{}", self.id), Flags::FILE)
            }
            TransferKind::File { name, ext } => (format!("{name}.{ext}:{}", self.id), Flags::FILE),
            TransferKind::Msg => (format!("{}", self.id), Flags::MSG),
        };
        self.transmit_raw(payload.as_bytes(), flags, 0);
        self.init_sent = Some(Instant::now());
    }

    fn transmit_raw(&self, payload: &[u8], flags: Flags, seq: u8) {
        match packet::construct(payload, flags, self.id, seq) {
            Ok(bytes) => self.out.send_to(&bytes, self.peer),
            Err(e) => tracing::warn!(id = self.id, peer = %self.peer, %e, "dropping packet"),
        }
    }

    fn silent_too_long(&self) -> bool {
        self.last_activity.elapsed() > self.timing.keepalive
    }
}

impl Transfer for Sender {
    fn receive(&mut self, packet: Packet) {
        if packet.flags == Flags::ACK {
            self.acks.insert(packet.seq);
            self.last_activity = Instant::now();
        } else if packet.flags == Flags::SACK {
            if !self.started {
                tracing::debug!(id = self.id, peer = %self.peer, "peer accepted transfer");
            }
            self.started = true;
            self.last_activity = Instant::now();
        } else if packet.flags == Flags::FIN {
            tracing::info!(id = self.id, peer = %self.peer, "transfer finished by peer");
            self.alive = false;
        } else {
            tracing::debug!(id = self.id, flags = %packet.flags, "unexpected packet for sender");
        }
    }

    fn kill(&mut self) {
        self.alive = false;
    }
}

impl Pollable for Sender {
    fn poll(&mut self) -> PollStatus {
        if !self.alive {
            return PollStatus::Finished;
        }
        if self.silent_too_long() {
            tracing::warn!(id = self.id, peer = %self.peer, "transfer timed out");
            self.alive = false;
            return PollStatus::Finished;
        }

        // Start gate: re-send the init until the peer SACKs it.
        if !self.started {
            let due = match self.init_sent {
                None => true,
                Some(at) => at.elapsed() >= self.timing.resend,
            };
            if due {
                self.send_init();
            }
            return PollStatus::Sleeping;
        }

        let mut work = false;

        if !self.acks.is_empty() {
            let acks = std::mem::take(&mut self.acks);
            self.in_flight.retain(|p| !acks.contains(&p.seq));
        }

        // Retransmit in-flight fragments whose TTL ran out.
        let ttl = self.timing.ttl;
        let peer = self.peer;
        let out = &self.out;
        for fragment in &mut self.in_flight {
            if fragment.is_fresh(ttl) {
                continue;
            }
            fragment.refresh_stamp();
            match fragment.encode() {
                Ok(bytes) => out.send_to(&bytes, peer),
                Err(e) => tracing::warn!(id = fragment.transfer_id, %e, "dropping fragment"),
            }
            work = true;
        }

        // Fill the rest of the window from the pending list.
        while self.in_flight.len() < self.window_size {
            let Some(fragment) = self.pending.pop_front() else {
                break;
            };
            match fragment.encode() {
                Ok(bytes) => self.out.send_to(&bytes, self.peer),
                Err(e) => tracing::warn!(id = self.id, %e, "dropping fragment"),
            }
            self.seq = fragment.seq.wrapping_add(1);
            self.in_flight.push(fragment);
            work = true;
        }

        if self.pending.is_empty() && self.in_flight.is_empty() {
            let due = match self.fin_sent {
                None => true,
                Some(at) => at.elapsed() >= self.timing.resend,
            };
            if due {
                if self.fin_attempts == 0 {
                    // Best-effort teardown: stop waiting for the reply.
                    self.alive = false;
                    return PollStatus::Finished;
                }
                self.transmit_raw(format!("{}", self.id).as_bytes(), Flags::FIN, self.seq);
                self.fin_attempts -= 1;
                self.fin_sent = Some(Instant::now());
                work = true;
            }
        }

        if work {
            PollStatus::Running
        } else {
            PollStatus::Sleeping
        }
    }
}
