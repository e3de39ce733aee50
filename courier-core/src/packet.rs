//! Wire frame: `flags:1 | transfer_id:1 | crc16:2 (BE) | seq:1 | payload`.
//! Fragmentation and reassembly of transfer payloads live here too.

use std::time::{Duration, Instant};

use crc::{Crc, CRC_16_MODBUS};

/// Fixed header size on the wire.
pub const HEADER_LEN: usize = 5;

/// Largest payload a single packet may carry. One fragment plus header
/// stays near the host MTU.
pub const MAX_PAYLOAD: usize = 1468;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Single-byte capability bitmask. The transfer id is NOT packed into
/// this byte; it travels in its own header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(pub u8);

impl Flags {
    pub const SYN: Flags = Flags(0b0000_0001);
    pub const ACK: Flags = Flags(0b0000_0010);
    /// "Super ACK": completes the handshake, or starts a transfer.
    pub const SACK: Flags = Flags(0b0000_0100);
    /// Message transfer init.
    pub const MSG: Flags = Flags(0b0000_1000);
    /// File transfer init.
    pub const FILE: Flags = Flags(0b0001_0000);
    /// Data fragment of an active transfer; the header's transfer_id
    /// field says which one.
    pub const SR: Flags = Flags(0b0010_0000);
    /// Window multiplier. Reserved, never set.
    pub const WM: Flags = Flags(0b0100_0000);
    pub const FIN: Flags = Flags(0b1000_0000);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010b}", self.0)
    }
}

/// One decoded datagram. `stamp` is the creation time on the sending
/// side and the receipt time on the receiving side.
#[derive(Debug, Clone)]
pub struct Packet {
    pub flags: Flags,
    pub transfer_id: u8,
    pub seq: u8,
    pub payload: Vec<u8>,
    stamp: Instant,
}

/// Error constructing, parsing, or reassembling packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("payload of {len} bytes exceeds the {max}-byte fragment budget")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("datagram of {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    TooShort { len: usize },
    #[error("fragment size must be between 1 and {MAX_PAYLOAD}")]
    BadFragmentSize,
    #[error("no fragments to reassemble")]
    Empty,
    #[error("missing fragment at sequence number {seq}")]
    MissingFragment { seq: u8 },
    #[error("duplicate fragment at sequence number {seq}")]
    DuplicateFragment { seq: u8 },
}

impl Packet {
    pub fn new(payload: Vec<u8>, flags: Flags, transfer_id: u8, seq: u8) -> Packet {
        Packet {
            flags,
            transfer_id,
            seq,
            payload,
            stamp: Instant::now(),
        }
    }

    /// Reset the stamp, giving a retransmitted fragment a fresh TTL.
    pub fn refresh_stamp(&mut self) {
        self.stamp = Instant::now();
    }

    /// True while the packet's age is within `ttl`. Stale handshake
    /// retransmissions are rejected with this.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.stamp.elapsed() <= ttl
    }

    /// Serialize into one wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        construct(&self.payload, self.flags, self.transfer_id, self.seq)
    }
}

/// Build a wire frame from parts. Fails if the payload exceeds the
/// fragment budget.
pub fn construct(
    payload: &[u8],
    flags: Flags,
    transfer_id: u8,
    seq: u8,
) -> Result<Vec<u8>, PacketError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(PacketError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let crc16 = CRC16.checksum(payload);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(flags.bits());
    out.push(transfer_id);
    out.extend_from_slice(&crc16.to_be_bytes());
    out.push(seq);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Parse a wire frame. The checksum is not verified here; callers gate
/// on [`is_valid`] first.
pub fn deconstruct(data: &[u8]) -> Result<Packet, PacketError> {
    if data.len() < HEADER_LEN {
        return Err(PacketError::TooShort { len: data.len() });
    }
    Ok(Packet::new(
        data[HEADER_LEN..].to_vec(),
        Flags(data[0]),
        data[1],
        data[4],
    ))
}

/// Recompute the CRC over the payload and compare against the header.
/// A single flipped bit in payload or checksum fails the comparison.
pub fn is_valid(data: &[u8]) -> bool {
    if data.len() < HEADER_LEN {
        tracing::debug!(len = data.len(), "datagram shorter than header");
        return false;
    }
    let stored = u16::from_be_bytes([data[2], data[3]]);
    let computed = CRC16.checksum(&data[HEADER_LEN..]);
    if stored != computed {
        tracing::debug!(stored, computed, "checksum mismatch");
        return false;
    }
    true
}

/// Split `data` into `ceil(len / fragment_size)` packets with sequence
/// numbers `(start_seq + i) % 256`.
pub fn fragment(
    data: &[u8],
    start_seq: u8,
    fragment_size: usize,
    flags: Flags,
    transfer_id: u8,
) -> Result<Vec<Packet>, PacketError> {
    if fragment_size == 0 || fragment_size > MAX_PAYLOAD {
        return Err(PacketError::BadFragmentSize);
    }
    let mut packets = Vec::with_capacity(data.len().div_ceil(fragment_size));
    for (i, piece) in data.chunks(fragment_size).enumerate() {
        let seq = start_seq.wrapping_add(i as u8);
        packets.push(Packet::new(piece.to_vec(), flags, transfer_id, seq));
    }
    Ok(packets)
}

/// Maps wrapping 8-bit sequence numbers onto a monotone index so runs
/// longer than 256 fragments stay ordered. Reordering is assumed to
/// span less than half a cycle (the window is far smaller than 128).
#[derive(Debug, Default)]
pub(crate) struct SeqUnwinder {
    anchor: Option<u8>,
    max_ext: i64,
}

impl SeqUnwinder {
    pub(crate) fn index(&mut self, seq: u8) -> i64 {
        let anchor = match self.anchor {
            Some(a) => a,
            None => {
                self.anchor = Some(seq);
                self.max_ext = 0;
                return 0;
            }
        };
        let off = i64::from(seq.wrapping_sub(anchor));
        let mut delta = off - self.max_ext.rem_euclid(256);
        if delta > 128 {
            delta -= 256;
        } else if delta < -128 {
            delta += 256;
        }
        let ext = self.max_ext + delta;
        if ext > self.max_ext {
            self.max_ext = ext;
        }
        ext
    }
}

/// Reassemble fragments into the original byte stream.
///
/// `packets` must be in arrival order. Sequence numbers are unwrapped
/// onto a monotone index (arrival order breaks ties), then the run must
/// be contiguous from the first fragment's sequence number; any gap or
/// duplicate index fails the whole reassembly.
pub fn reassemble(packets: &[Packet]) -> Result<Vec<u8>, PacketError> {
    if packets.is_empty() {
        return Err(PacketError::Empty);
    }

    let mut unwinder = SeqUnwinder::default();
    let mut indexed: Vec<(i64, usize)> = packets
        .iter()
        .enumerate()
        .map(|(i, p)| (unwinder.index(p.seq), i))
        .collect();
    indexed.sort_by_key(|&(ext, _)| ext);

    let first = indexed[0].0;
    for (pos, &(ext, i)) in indexed.iter().enumerate() {
        let expected = first + pos as i64;
        if ext < expected {
            return Err(PacketError::DuplicateFragment {
                seq: packets[i].seq,
            });
        }
        if ext > expected {
            let prev = packets[indexed[pos - 1].1].seq;
            return Err(PacketError::MissingFragment {
                seq: prev.wrapping_add(1),
            });
        }
    }

    let total: usize = packets.iter().map(|p| p.payload.len()).sum();
    let mut out = Vec::with_capacity(total);
    for &(_, i) in &indexed {
        out.extend_from_slice(&packets[i].payload);
    }
    Ok(out)
}
