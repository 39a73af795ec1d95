//! chat-relay: a multi-client TCP chat relay
//!
//! Clients connect, announce a display name with `__CONNECT__<name>`, and
//! every line they send afterwards is relayed to all other participants as
//! `<name> : <text>`.
//!
//! Components:
//! - `framing`: one transport read is one message, bounded by the buffer
//! - `session`: per-connection receive loop and name state machine
//! - `registry`: live membership with copy-on-read snapshots
//! - `broadcast`: fan-out that evicts recipients whose write fails
//! - `server`: acceptor spawning one task per connection
//! - `client`: console client speaking the same wire format
//!
//! Configuration via CLI arguments or TOML file.

pub mod broadcast;
pub mod client;
pub mod config;
pub mod framing;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
