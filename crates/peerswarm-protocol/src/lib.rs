//! peerswarm protocol - identity keys and signaling messages
//!
//! Defines the fixed-length keys that name topics, peers and sessions, the
//! signal messages relayed through rendezvous servers, and the JSON-RPC 2.0
//! envelope those servers speak.

pub mod constants;
pub mod error;
pub mod identity;
pub mod messages;

pub use constants::*;
pub use error::*;
pub use identity::*;
pub use messages::*;
