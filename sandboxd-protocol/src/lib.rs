//! sandboxd-protocol: PTY streaming protocol and wire records
//!
//! A single connection carries two frame kinds: binary frames hold the raw
//! PTY byte stream in both directions, text frames hold JSON
//! [`ControlMessage`]s. The crate also defines the records emitted on the
//! process-log and watch event streams, and the client-side reconnect
//! machinery.

pub mod client;
pub mod codec;
pub mod frame;
pub mod reconnect;
pub mod records;

// Re-export main types at crate root
pub use client::{AttachOptions, ClientEvent, Connector, ReconnectingClient, TcpConnector};
pub use codec::{CodecError, FrameCodec};
pub use frame::{ControlMessage, Frame};
pub use reconnect::{ConnectionState, ReconnectPolicy};
pub use records::{FileEventType, LogRecord, LogRecordKind, WatchEvent};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;
