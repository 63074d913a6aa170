//! Wire-level types shared by the PeerDrop signaling server and peer agents.
//!
//! - [`protocol`]: the JSON envelope exchanged with the hub and its payloads
//! - [`frame`]: the binary frame layout used on direct data channels
//! - [`types`]: peer, file and transfer descriptors

pub mod constants;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod types;

pub use error::{FrameError, ProtocolError};
pub use frame::Frame;
pub use protocol::{Envelope, MessageType};
pub use types::{FileDescriptor, PeerInfo, PeerRecord};
