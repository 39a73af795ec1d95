//! TCP acceptor for relay connections.
//!
//! Binds the listening socket, accepts clients forever, and spawns one
//! session task per connection. A failed accept is logged and skipped; only
//! failing to set up the listener is fatal.

use crate::config::Config;
use crate::framing::{FrameReader, FrameWriter};
use crate::registry::Registry;
use crate::session::{Peer, Session, SessionContext, SessionId};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Listen backlog for the relay socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept, e.g. while out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    context: SessionContext,
    connection_limit: Arc<Semaphore>,
    next_id: u64,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr = resolve(&config.listen)?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(address = %listener.local_addr()?, "Server listening");

        let context = SessionContext::new(Registry::new())
            .with_departure_notices(config.announce_departures);

        Ok(Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            listener,
            context,
            next_id: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.context.registry()
    }

    /// Accept connections until the process exits.
    pub async fn run(mut self) -> io::Result<()> {
        loop {
            // Wait for a connection slot
            let permit = Arc::clone(&self.connection_limit)
                .acquire_owned()
                .await
                .map_err(io::Error::other)?;

            let Some((stream, addr)) = accepted(self.listener.accept().await).await else {
                continue;
            };

            let id = self.allocate_id();
            debug!(peer = %addr, session = %id, "New connection");

            let session = self.open_session(id, stream);
            tokio::spawn(async move {
                session.run().await;
                drop(permit);
            });
        }
    }

    fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId::new(self.next_id)
    }

    /// Register a freshly accepted connection and build its session.
    fn open_session(&self, id: SessionId, stream: TcpStream) -> Session<OwnedReadHalf> {
        let (read_half, write_half) = stream.into_split();

        let peer = Arc::new(Peer::new(id, Arc::new(FrameWriter::new(write_half))));
        self.context.registry().add(Arc::clone(&peer));

        let reader = FrameReader::with_capacity(read_half, self.config.buffer_size);
        Session::new(peer, reader, self.context.clone())
    }
}

/// Unwrap an accept result. Errors are logged and delay the next attempt.
async fn accepted<T>(result: io::Result<T>) -> Option<T> {
    match result {
        Ok(accepted) => Some(accepted),
        Err(e) => {
            error!(error = %e, "Failed to accept connection");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for '{listen}'"),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
