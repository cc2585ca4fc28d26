//! # portgate
//!
//! A reverse TCP port-forwarding tunnel. A publicly reachable **server**
//! exposes TCP ports on behalf of a **client** sitting behind NAT or a
//! firewall; external connections to those ports are relayed to targets
//! that only the client's network can reach.
//!
//! ## Architecture
//!
//! ```text
//! external client --TCP--> server:outer_port
//!                               │ allocate slot id
//!                               │ NEWSOCKET(port, id) on the control conn
//!                               ↓
//! client: dial server (side-channel), send NEWCONN(port, id)
//! client: dial the mapped inner target
//! server: splice external <-> side-channel   [AES-CTR]
//! client: splice side-channel <-> inner      [AES-CTR]
//! ```
//!
//! The long-lived control connection carries a plaintext, single-byte
//! tagged protocol: authentication, heartbeats, and new-connection
//! notifications. Each relayed connection gets its own short-lived
//! side-channel, encrypted between server and client.
//!
//! ## Security
//!
//! **The data plane offers confidentiality only, not integrity.** Payload
//! traffic is AES-128-CTR with a static key and IV derived from the shared
//! secret by MD5, and every side-channel in a session restarts the same
//! keystream. An active attacker can flip bits undetected and correlate
//! keystreams across connections. The wire format is kept bit-for-bit so
//! that existing peers interoperate; do not rely on it for anything beyond
//! hiding payload bytes from a passive observer. See [`crypto`] for
//! details.

pub mod client;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod server;
pub mod supervisor;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),
}
