//! Per-connection session lifecycle.
//!
//! ```text
//! Connecting --first message--------------> Named
//! Connecting --EOF / read error-----------> Closed
//! Named      --EOF / read error / evicted--> Closed
//! ```
//!
//! A session is split in two:
//! - `Session` owns the read side and runs the receive loop
//! - `Peer` is the registry-visible half other sessions deliver through

use crate::broadcast::Broadcaster;
use crate::framing::{FrameReader, FrameWriter};
use crate::message::{self, Inbound, UNKNOWN_NAME};
use crate::registry::Registry;
use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncRead;
use tracing::{debug, info, trace};

/// Opaque connection handle, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, no message received yet.
    Connecting,
    /// Display name fixed; every further message is chat.
    Named,
    /// Torn down and released.
    Closed,
}

/// Outbound half of a session, shared with the registry.
pub struct Peer {
    id: SessionId,
    name: OnceLock<String>,
    writer: Arc<FrameWriter>,
}

impl Peer {
    pub fn new(id: SessionId, writer: Arc<FrameWriter>) -> Self {
        Self {
            id,
            name: OnceLock::new(),
            writer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Display name, or `None` while the session is still connecting.
    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    /// Fix the display name. Only the first call has any effect.
    fn set_name(&self, name: &str) -> bool {
        self.name.set(name.to_owned()).is_ok()
    }

    /// Write one message to this session's connection.
    pub async fn deliver(&self, message: &[u8]) -> io::Result<()> {
        self.writer.write(message).await
    }

    /// Release the connection and stop the owning session's receive loop.
    ///
    /// Idempotent; returns `true` only for the call that closed it.
    pub async fn close(&self) -> bool {
        self.writer.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    async fn closed(&self) {
        self.writer.closed().await
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Shared state every session needs.
#[derive(Clone)]
pub struct SessionContext {
    broadcaster: Broadcaster,
    announce_departures: bool,
}

impl SessionContext {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            broadcaster: Broadcaster::new(registry),
            announce_departures: false,
        }
    }

    /// Broadcast `"<name> disconnected."` when a named session closes.
    pub fn with_departure_notices(mut self, enabled: bool) -> Self {
        self.announce_departures = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.broadcaster.registry()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }
}

/// Receive side of one connection.
pub struct Session<R> {
    peer: Arc<Peer>,
    reader: FrameReader<R>,
    state: SessionState,
    context: SessionContext,
}

impl<R: AsyncRead + Unpin> Session<R> {
    /// Create a session for an accepted connection.
    ///
    /// The caller is responsible for adding `peer` to the registry.
    pub fn new(peer: Arc<Peer>, reader: FrameReader<R>, context: SessionContext) -> Self {
        Self {
            peer,
            reader,
            state: SessionState::Connecting,
            context,
        }
    }

    pub fn id(&self) -> SessionId {
        self.peer.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Run the receive loop until the connection ends, then tear down.
    pub async fn run(mut self) {
        debug!(session = %self.id(), "Session started");

        loop {
            let read = tokio::select! {
                read = self.reader.read() => read,
                _ = self.peer.closed() => {
                    debug!(session = %self.id(), "Session evicted");
                    break;
                }
            };

            match read {
                Ok(Some(frame)) => self.handle_message(&frame).await,
                Ok(None) => {
                    trace!(session = %self.id(), "Connection closed by client");
                    break;
                }
                Err(e) => {
                    debug!(session = %self.id(), error = %e, "Read failed");
                    break;
                }
            }
        }

        self.close().await;
    }

    /// Process one received message according to the session state.
    ///
    /// Chat payloads are forwarded byte for byte; only the display name is
    /// decoded, lossily.
    pub async fn handle_message(&mut self, frame: &[u8]) {
        match self.state {
            SessionState::Connecting => match Inbound::parse(frame) {
                Inbound::Announce(name) => {
                    let name = String::from_utf8_lossy(name);
                    self.assign_name(&name);
                    info!(session = %self.id(), "{name} connected.");
                    let notice = message::connect_notice(&name);
                    self.context.broadcaster.deliver(self.id(), &notice).await;
                }
                Inbound::Chat(text) => {
                    self.assign_name(UNKNOWN_NAME);
                    self.broadcast_chat(text).await;
                }
            },
            SessionState::Named => self.broadcast_chat(frame).await,
            SessionState::Closed => {}
        }
    }

    /// Tear the session down: leave the registry and release the connection.
    ///
    /// Safe to call more than once; only the first call has side effects.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_named = self.state == SessionState::Named;
        self.state = SessionState::Closed;

        self.context.registry().remove(self.id());
        self.peer.close().await;

        let name = self.peer.name().unwrap_or(UNKNOWN_NAME);
        if was_named {
            info!(session = %self.id(), "{name} disconnected.");
            if self.context.announce_departures {
                let notice = message::disconnect_notice(name);
                self.context.broadcaster.deliver(self.id(), &notice).await;
            }
        } else {
            debug!(session = %self.id(), "Client left before announcing");
        }
    }

    fn assign_name(&mut self, name: &str) {
        self.peer.set_name(name);
        self.state = SessionState::Named;
    }

    async fn broadcast_chat(&self, text: &[u8]) {
        let name = self.peer.name().unwrap_or(UNKNOWN_NAME);
        debug!(
            session = %self.id(),
            "Message from {name}: {}",
            String::from_utf8_lossy(text)
        );
        let line = message::chat_line(name, text);
        self.context.broadcaster.deliver(self.id(), &line).await;
    }
}
