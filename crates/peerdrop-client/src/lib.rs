//! PeerDrop peer agent.
//!
//! - [`signaling`]: the link to the hub, with reconnect and send queueing
//! - [`rtc`]: per-peer WebRTC sessions and their data channels
//! - [`transfer`]: the offer/accept/deliver handshake on either path
//! - [`agent`]: all of the above wired together behind one handle

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod reconnect;
pub mod rtc;
pub mod signaling;
pub mod sink;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentEvent};
pub use config::ClientConfig;
