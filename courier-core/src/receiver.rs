//! Inbound half of a transfer: accept the init, buffer and deduplicate
//! fragments, acknowledge in batches, reassemble and deliver on FIN.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Timing;
use crate::connection::Transfer;
use crate::link::{Delivery, Outbound};
use crate::packet::{self, Flags, Packet, SeqUnwinder};
use crate::scheduler::{PollStatus, Pollable};

pub struct Receiver {
    id: u8,
    peer: SocketAddr,
    out: Arc<dyn Outbound>,
    delivery: Arc<dyn Delivery>,
    timing: Timing,
    /// File name/extension from the FILE init; both None for messages.
    name: Option<String>,
    ext: Option<String>,
    /// Fragments in arrival order, handed to the codec at FIN time.
    fragments: Vec<Packet>,
    unwinder: SeqUnwinder,
    seen: HashSet<i64>,
    /// Sequence numbers to acknowledge on the next tick.
    pending_acks: Vec<u8>,
    last_activity: Instant,
    alive: bool,
}

impl Receiver {
    pub fn new(
        id: u8,
        peer: SocketAddr,
        out: Arc<dyn Outbound>,
        delivery: Arc<dyn Delivery>,
        timing: Timing,
    ) -> Receiver {
        Receiver {
            id,
            peer,
            out,
            delivery,
            timing,
            name: None,
            ext: None,
            fragments: Vec::new(),
            unwinder: SeqUnwinder::default(),
            seen: HashSet::new(),
            pending_acks: Vec::new(),
            last_activity: Instant::now(),
            alive: true,
        }
    }

    pub fn fragments_received(&self) -> usize {
        self.fragments.len()
    }

    fn send_control(&self, flags: Flags, seq: u8) {
        match packet::construct(format!("{}", self.id).as_bytes(), flags, self.id, seq) {
            Ok(bytes) => self.out.send_to(&bytes, self.peer),
            Err(e) => tracing::warn!(id = self.id, peer = %self.peer, %e, "dropping control packet"),
        }
    }

    /// SACK opens the sender's start gate.
    fn accept(&mut self) {
        self.send_control(Flags::SACK, 0);
        self.last_activity = Instant::now();
    }

    fn on_file_init(&mut self, packet: &Packet) {
        let text = String::from_utf8_lossy(&packet.payload);
        let name_ext = match text.rsplit_once(':') {
            Some((name_ext, _)) => name_ext,
            None => {
                tracing::warn!(peer = %self.peer, "malformed file init payload");
                return;
            }
        };
        let (name, ext) = match name_ext.split_once('.') {
            Some((n, e)) => (n.to_string(), e.to_string()),
            None => (name_ext.to_string(), String::new()),
        };
        tracing::info!(id = self.id, peer = %self.peer, name, ext, "incoming file transfer");
        self.name = Some(name);
        self.ext = Some(ext);
        self.accept();
    }

    fn on_data(&mut self, packet: Packet) {
        let index = self.unwinder.index(packet.seq);
        if self.seen.insert(index) {
            self.pending_acks.push(packet.seq);
            self.fragments.push(packet);
            self.last_activity = Instant::now();
        } else {
            // Retransmitted duplicate: its ACK was lost, answer again.
            self.send_control(Flags::ACK, packet.seq);
        }
    }

    fn on_fin(&mut self) {
        match packet::reassemble(&self.fragments) {
            Ok(data) => {
                tracing::info!(
                    id = self.id,
                    peer = %self.peer,
                    fragments = self.fragments.len(),
                    len = data.len(),
                    "transfer complete"
                );
                match (&self.name, &self.ext) {
                    (Some(name), Some(ext)) => {
                        self.delivery.deliver_file(self.peer, name, ext, data)
                    }
                    _ => self.delivery.deliver_msg(self.peer, data),
                }
            }
            Err(e) => {
                // No partial data ever reaches the collaborator.
                tracing::warn!(id = self.id, peer = %self.peer, %e, "reassembly failed, dropping transfer");
            }
        }
        self.send_control(Flags::FIN, 0);
        self.alive = false;
    }
}

impl Transfer for Receiver {
    fn receive(&mut self, packet: Packet) {
        if packet.flags == Flags::FILE {
            self.on_file_init(&packet);
        } else if packet.flags == Flags::MSG {
            self.accept();
        } else if packet.flags.contains(Flags::SR) {
            self.on_data(packet);
        } else if packet.flags == Flags::FIN {
            self.on_fin();
        } else {
            tracing::debug!(id = self.id, flags = %packet.flags, "unexpected packet for receiver");
        }
    }

    fn kill(&mut self) {
        self.alive = false;
    }
}

impl Pollable for Receiver {
    fn poll(&mut self) -> PollStatus {
        if !self.alive {
            return PollStatus::Finished;
        }
        if self.last_activity.elapsed() > self.timing.keepalive {
            tracing::warn!(id = self.id, peer = %self.peer, "transfer timed out");
            self.alive = false;
            return PollStatus::Finished;
        }

        if self.pending_acks.is_empty() {
            return PollStatus::Sleeping;
        }
        for seq in std::mem::take(&mut self.pending_acks) {
            self.send_control(Flags::ACK, seq);
        }
        PollStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::{CollectDelivery, CollectOutbound};
    use std::time::Duration;

    const ID: u8 = 5;

    fn peer() -> SocketAddr {
        "127.0.0.1:50001".parse().unwrap()
    }

    fn receiver(
        out: Arc<CollectOutbound>,
        delivery: Arc<CollectDelivery>,
        keepalive: Duration,
    ) -> Receiver {
        let timing = Timing {
            keepalive,
            ..Timing::default()
        };
        Receiver::new(ID, peer(), out, delivery, timing)
    }

    fn data(seq: u8, payload: &[u8]) -> Packet {
        Packet::new(payload.to_vec(), Flags::SR, ID, seq)
    }

    fn fin() -> Packet {
        Packet::new(format!("{ID}").into_bytes(), Flags::FIN, ID, 0)
    }

    fn sent_frames(out: &CollectOutbound) -> Vec<Packet> {
        out.take()
            .into_iter()
            .map(|(bytes, _)| packet::deconstruct(&bytes).unwrap())
            .collect()
    }

    #[test]
    fn file_init_parses_name_and_sacks() {
        let out = Arc::new(CollectOutbound::default());
        let delivery = Arc::new(CollectDelivery::default());
        let mut rx = receiver(out.clone(), delivery, Duration::from_secs(10));
        rx.receive(Packet::new(b"notes.txt:5".to_vec(), Flags::FILE, ID, 0));

        let frames = sent_frames(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].flags, Flags::SACK);
        assert_eq!(rx.name.as_deref(), Some("notes"));
        assert_eq!(rx.ext.as_deref(), Some("txt"));
    }

    #[test]
    fn duplicate_fragment_is_reacked_not_rebuffered() {
        let out = Arc::new(CollectOutbound::default());
        let delivery = Arc::new(CollectDelivery::default());
        let mut rx = receiver(out.clone(), delivery, Duration::from_secs(10));
        rx.receive(Packet::new(format!("{ID}").into_bytes(), Flags::MSG, ID, 0));
        out.take();

        rx.receive(data(0, b"one"));
        assert_eq!(rx.fragments_received(), 1);
        assert!(sent_frames(&out).is_empty(), "fresh fragments batch-ack on the tick");

        rx.receive(data(0, b"one"));
        assert_eq!(rx.fragments_received(), 1);
        let frames = sent_frames(&out);
        assert_eq!(frames.len(), 1, "duplicate gets an immediate ACK");
        assert_eq!(frames[0].flags, Flags::ACK);
        assert_eq!(frames[0].seq, 0);
    }

    #[test]
    fn acks_are_batched_per_tick() {
        let out = Arc::new(CollectOutbound::default());
        let delivery = Arc::new(CollectDelivery::default());
        let mut rx = receiver(out.clone(), delivery, Duration::from_secs(10));

        rx.receive(data(0, b"a"));
        rx.receive(data(1, b"b"));
        rx.receive(data(2, b"c"));
        assert_eq!(rx.poll(), PollStatus::Running);

        let frames = sent_frames(&out);
        let seqs: Vec<u8> = frames.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(frames.iter().all(|p| p.flags == Flags::ACK));

        assert_eq!(rx.poll(), PollStatus::Sleeping);
    }

    #[test]
    fn fin_delivers_reassembled_message() {
        let out = Arc::new(CollectOutbound::default());
        let delivery = Arc::new(CollectDelivery::default());
        let mut rx = receiver(out.clone(), delivery.clone(), Duration::from_secs(10));
        rx.receive(Packet::new(format!("{ID}").into_bytes(), Flags::MSG, ID, 0));

        rx.receive(data(0, b"hello "));
        rx.receive(data(1, b"world"));
        out.take();
        rx.receive(fin());

        let msgs = delivery.msgs.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].1, b"hello world".to_vec());
        drop(msgs);

        let frames = sent_frames(&out);
        assert_eq!(frames.last().unwrap().flags, Flags::FIN);
        assert_eq!(rx.poll(), PollStatus::Finished);
    }

    #[test]
    fn fin_delivers_file_with_name() {
        let out = Arc::new(CollectOutbound::default());
        let delivery = Arc::new(CollectDelivery::default());
        let mut rx = receiver(out, delivery.clone(), Duration::from_secs(10));
        rx.receive(Packet::new(b"photo.png:5".to_vec(), Flags::FILE, ID, 0));
        rx.receive(data(0, b"\x89PNG"));
        rx.receive(fin());

        let files = delivery.files.lock().unwrap();
        assert_eq!(files.len(), 1);
        let (_, name, ext, bytes) = &files[0];
        assert_eq!(name, "photo");
        assert_eq!(ext, "png");
        assert_eq!(bytes, &b"\x89PNG".to_vec());
    }

    #[test]
    fn gap_at_fin_drops_transfer_without_delivery() {
        let out = Arc::new(CollectOutbound::default());
        let delivery = Arc::new(CollectDelivery::default());
        let mut rx = receiver(out, delivery.clone(), Duration::from_secs(10));
        rx.receive(Packet::new(format!("{ID}").into_bytes(), Flags::MSG, ID, 0));

        rx.receive(data(0, b"a"));
        rx.receive(data(2, b"c")); // seq 1 never arrives
        rx.receive(fin());

        assert!(delivery.msgs.lock().unwrap().is_empty());
        assert_eq!(rx.poll(), PollStatus::Finished);
    }

    #[test]
    fn silence_kills_without_partial_delivery() {
        let out = Arc::new(CollectOutbound::default());
        let delivery = Arc::new(CollectDelivery::default());
        let mut rx = receiver(out, delivery.clone(), Duration::from_millis(5));
        rx.receive(data(0, b"a"));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(rx.poll(), PollStatus::Finished);
        assert!(delivery.msgs.lock().unwrap().is_empty());
    }
}
