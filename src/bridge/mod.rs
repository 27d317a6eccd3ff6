//! # TCP Bridge
//!
//! Exposes the internal bus to external TCP peers.
//!
//! A connection starts with a one-line version handshake and then carries
//! length-prefixed JSON frames. SEND and PUBLISH frames for addresses on the
//! inbound allow-list are dispatched on the bus; REGISTER (outbound
//! allow-list) subscribes the peer so commands for that address are
//! forwarded to it. Rejected frames are answered with ERROR and, past the
//! configured limit, close the connection; peers closed repeatedly are
//! refused at accept time. PING/PONG heartbeats detect dead peers.
//!
//! ```text
//! peer ──TCP──▶ BridgeServer ─ accept loop
//!                  └─ connection task
//!                       ├─ reader task ─▶ Session ─▶ Dispatcher
//!                       └─ writer task ◀─ replies, PINGs, forwarded frames
//! ```

pub mod allow_list;
pub mod client;
mod connection;
pub mod frame;
pub mod handshake;
pub mod peers;
pub mod server;

pub use allow_list::AllowList;
pub use client::{BridgeClient, ClientOptions};
pub use frame::{read_frame, write_frame, Frame, FrameError, FrameType};
pub use peers::PeerRegistry;
pub use server::{BridgeServer, BridgeStats, ConnectionInfo};
