//! Courier protocol reference implementation.
//! Reliable transport over UDP datagrams: CRC-checked binary frames,
//! per-peer handshake/keep-alive/teardown, and windowed fragmenting
//! transfers for files and messages, driven by one cooperative
//! scheduler on one socket.

pub mod config;
pub mod connection;
pub mod host;
pub mod link;
pub mod packet;
pub mod receiver;
pub mod scheduler;
pub mod sender;

pub use config::{Config, Timing};
pub use connection::{Connection, State, Transfer};
pub use host::{Host, HostError};
pub use link::{Delivery, LogDelivery, Outbound, UdpOutbound};
pub use packet::{Flags, Packet, PacketError};
pub use receiver::Receiver;
pub use scheduler::{PollStatus, Pollable};
pub use sender::{Sender, TransferKind};
