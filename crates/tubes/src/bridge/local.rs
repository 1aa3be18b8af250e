//! Tasks that own the local sockets. They talk to the manager only through
//! [`LocalEvent`]s and per-connection commands.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use futures_util::StreamExt;
use lanlink_primitives::socket::{AddressKind, SocketAddress};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::spawn;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tracing::{debug, warn};

use crate::bridge::{ConnId, ListenerId};

#[derive(Debug)]
pub(crate) enum LocalEvent {
    Accepted {
        listener: ListenerId,
        stream: LocalStream,
        source_port: Option<u16>,
    },
    Dialed {
        conn: ConnId,
        result: io::Result<LocalStream>,
    },
    Read {
        conn: ConnId,
        data: Bytes,
    },
    Flushed {
        conn: ConnId,
    },
    Closed {
        conn: ConnId,
    },
}

#[derive(Debug)]
pub(crate) enum LocalStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

impl LocalStream {
    fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            Self::Unix(stream) => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
            Self::Tcp(stream) => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum BoundListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Binds a fresh listening socket of `kind`. Unix sockets get a random name
/// under `socket_dir`; IP sockets bind an ephemeral loopback port.
pub(crate) fn bind(
    kind: AddressKind,
    socket_dir: &Utf8Path,
) -> io::Result<(BoundListener, SocketAddress)> {
    match kind {
        AddressKind::Unix => {
            let path = socket_path(socket_dir);
            let listener = UnixListener::bind(&path)?;

            Ok((BoundListener::Unix(listener), SocketAddress::Unix(path)))
        }
        AddressKind::Ipv4 | AddressKind::Ipv6 => {
            let addr = if kind == AddressKind::Ipv4 {
                "127.0.0.1:0"
            } else {
                "[::1]:0"
            };

            let listener = std::net::TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(listener)?;
            let local = listener.local_addr()?;

            Ok((BoundListener::Tcp(listener), SocketAddress::Inet(local)))
        }
    }
}

fn socket_path(socket_dir: &Utf8Path) -> Utf8PathBuf {
    socket_dir.join(format!("tube-{}", hex::encode(rand::random::<[u8; 8]>())))
}

pub(crate) fn spawn_accept_loop(
    id: ListenerId,
    listener: BoundListener,
    events: mpsc::UnboundedSender<LocalEvent>,
) -> AbortHandle {
    spawn(async move {
        match listener {
            BoundListener::Unix(listener) => {
                let mut incoming = UnixListenerStream::new(listener);

                while let Some(accepted) = incoming.next().await {
                    match accepted {
                        Ok(stream) => {
                            let event = LocalEvent::Accepted {
                                listener: id,
                                stream: LocalStream::Unix(stream),
                                source_port: None,
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, %id, "Failed to accept local connection"),
                    }
                }
            }
            BoundListener::Tcp(listener) => {
                let mut incoming = TcpListenerStream::new(listener);

                while let Some(accepted) = incoming.next().await {
                    match accepted {
                        Ok(stream) => {
                            let source_port = stream.peer_addr().ok().map(|addr| addr.port());
                            let event = LocalEvent::Accepted {
                                listener: id,
                                stream: LocalStream::Tcp(stream),
                                source_port,
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, %id, "Failed to accept local connection"),
                    }
                }
            }
        }
    })
    .abort_handle()
}

pub(crate) fn spawn_dial(
    conn: ConnId,
    address: SocketAddress,
    events: mpsc::UnboundedSender<LocalEvent>,
) {
    drop(spawn(async move {
        let result = match address {
            SocketAddress::Unix(path) => UnixStream::connect(path).await.map(LocalStream::Unix),
            SocketAddress::Inet(addr) => TcpStream::connect(addr).await.map(LocalStream::Tcp),
        };

        let _ignored = events.send(LocalEvent::Dialed { conn, result });
    }));
}

#[derive(Debug)]
enum ConnCommand {
    Write(Bytes),
    Shutdown,
}

/// Both halves of one local connection.
///
/// The reader performs one read per granted credit, so a peer that stops
/// draining stops the local application from being read.
#[derive(Debug)]
pub(crate) struct Pump {
    commands: mpsc::UnboundedSender<ConnCommand>,
    credit: Arc<Notify>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl Pump {
    pub fn spawn(
        conn: ConnId,
        stream: LocalStream,
        chunk_size: usize,
        events: mpsc::UnboundedSender<LocalEvent>,
    ) -> Self {
        let (reader, writer) = stream.into_split();

        Self::spawn_halves(conn, reader, writer, chunk_size, events)
    }

    fn spawn_halves<R, W>(
        conn: ConnId,
        reader: R,
        writer: W,
        chunk_size: usize,
        events: mpsc::UnboundedSender<LocalEvent>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let credit = Arc::new(Notify::new());
        let (commands, command_receiver) = mpsc::unbounded_channel();

        let reader = spawn(read_loop(
            conn,
            reader,
            Arc::clone(&credit),
            chunk_size,
            events.clone(),
        ))
        .abort_handle();
        let writer = spawn(write_loop(conn, writer, command_receiver, events)).abort_handle();

        Self {
            commands,
            credit,
            reader,
            writer,
        }
    }

    /// Allows exactly one more read. Extra grants before the read coalesce.
    pub fn grant(&self) {
        self.credit.notify_one();
    }

    pub fn write(&self, data: Bytes) -> bool {
        self.commands.send(ConnCommand::Write(data)).is_ok()
    }

    /// Stops reading and closes the socket once queued writes are done.
    pub fn finish(&self) {
        self.reader.abort();
        let _ignored = self.commands.send(ConnCommand::Shutdown);
    }

    /// Closes the socket now, discarding queued writes.
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    conn: ConnId,
    mut reader: R,
    credit: Arc<Notify>,
    chunk_size: usize,
    events: mpsc::UnboundedSender<LocalEvent>,
) {
    loop {
        credit.notified().await;

        let mut buf = BytesMut::with_capacity(chunk_size);

        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let event = LocalEvent::Read {
                    conn,
                    data: buf.freeze(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!(%err, %conn, "Local read failed");
                break;
            }
        }
    }

    let _ignored = events.send(LocalEvent::Closed { conn });
}

async fn write_loop<W: AsyncWrite + Unpin>(
    conn: ConnId,
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<ConnCommand>,
    events: mpsc::UnboundedSender<LocalEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            ConnCommand::Write(data) => {
                if let Err(err) = writer.write_all(&data).await {
                    debug!(%err, %conn, "Local write failed");
                    let _ignored = events.send(LocalEvent::Closed { conn });
                    return;
                }

                let _ignored = events.send(LocalEvent::Flushed { conn });
            }
            ConnCommand::Shutdown => break,
        }
    }

    let _ignored = writer.shutdown().await;
}

#[cfg(test)]
#[path = "../tests/pump.rs"]
mod tests;
