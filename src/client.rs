//! Console client for the relay.
//!
//! Two loops share one connection:
//! - the send loop reads lines from the console and writes them verbatim
//! - the receive loop prints every relayed message, then re-prompts
//!
//! The server adds the `<name> : ` prefix, so the client never does.

use crate::config::ClientArgs;
use crate::framing::{FrameReader, FrameWriter};
use crate::message;
use std::io;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const NAME_PROMPT: &str = "Enter your chat name: ";
pub const MESSAGE_PROMPT: &str = "Send your message: ";

/// Console output shared by the send and receive loops.
///
/// Each `print` is written and flushed as a unit, so a relayed message never
/// lands in the middle of a prompt.
pub struct Console<O> {
    output: Arc<Mutex<O>>,
}

impl<O> Clone for Console<O> {
    fn clone(&self) -> Self {
        Self {
            output: Arc::clone(&self.output),
        }
    }
}

impl<O: AsyncWrite + Unpin> Console<O> {
    pub fn new(output: O) -> Self {
        Self {
            output: Arc::new(Mutex::new(output)),
        }
    }

    pub async fn print(&self, text: &str) -> io::Result<()> {
        let mut output = self.output.lock().await;
        output.write_all(text.as_bytes()).await?;
        output.flush().await
    }
}

/// Typed input that ends the send loop. The line itself is still sent.
pub fn is_quit(line: &str) -> bool {
    matches!(line, "quit" | "exit")
}

/// Prompt until a non-empty name is entered.
///
/// Leading whitespace is skipped. Returns `None` if the input ends first.
pub async fn prompt_name<I, O>(
    lines: &mut Lines<I>,
    console: &Console<O>,
) -> io::Result<Option<String>>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        console.print(NAME_PROMPT).await?;
        match lines.next_line().await? {
            None => return Ok(None),
            Some(line) => {
                let name = line.trim_start();
                if !name.is_empty() {
                    return Ok(Some(name.to_string()));
                }
            }
        }
    }
}

/// Read console lines and send each one until `quit`/`exit` or end of input.
pub async fn send_messages<I, O>(
    lines: &mut Lines<I>,
    writer: &FrameWriter,
    console: &Console<O>,
) -> io::Result<()>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        console.print(MESSAGE_PROMPT).await?;

        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        if line.is_empty() {
            continue;
        }

        if let Err(e) = writer.write(line.as_bytes()).await {
            console.print("\nError sending message.\n").await?;
            return Err(e);
        }

        if is_quit(&line) {
            console.print("\nStopping the application.\n").await?;
            return Ok(());
        }
    }
}

/// Print relayed messages until the server closes the connection.
pub async fn receive_messages<R, O>(
    reader: &mut FrameReader<R>,
    console: &Console<O>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        match reader.read().await {
            Ok(Some(frame)) => {
                let text = String::from_utf8_lossy(&frame);
                console.print(&format!("\n{text}\n{MESSAGE_PROMPT}")).await?;
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Read from server failed");
                break;
            }
        }
    }

    console.print("\nDisconnected from server.\n").await
}

/// Connect to the relay and run the console session on stdin/stdout.
pub async fn run(args: ClientArgs) -> io::Result<()> {
    let console = Console::new(tokio::io::stdout());
    console.print("Client started\n").await?;

    let stream = TcpStream::connect(&args.server).await.map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("Unable to connect to server {}: {e}", args.server),
        )
    })?;
    info!(server = %args.server, "Connected");
    console.print("Successfully connected to server\n").await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let name = match args.name {
        Some(name) if !name.trim().is_empty() => name,
        _ => match prompt_name(&mut lines, &console).await? {
            Some(name) => name,
            None => return Ok(()),
        },
    };

    let (read_half, write_half) = stream.into_split();
    let writer = FrameWriter::new(write_half);
    writer.write(&message::announcement(&name)).await?;

    let receiver = {
        let console = console.clone();
        let mut reader = FrameReader::new(read_half);
        tokio::spawn(async move { receive_messages(&mut reader, &console).await })
    };

    let sent = send_messages(&mut lines, &writer, &console).await;

    // The server closes its side once ours is shut down, ending the receiver.
    writer.close().await;
    receiver.await.map_err(io::Error::other)??;

    sent
}
