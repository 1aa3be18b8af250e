#![allow(dead_code, reason = "Each test binary uses a different subset")]

use core::time::Duration;
use std::sync::{Arc, Once};

use camino::Utf8PathBuf;
use lanlink_tubes::loopback::LoopbackNetwork;
use lanlink_tubes::primitives::handle::{Container, Handle, HandleRepository, HandleSet};
use lanlink_tubes::tubes_primitives::client::TubesClient;
use lanlink_tubes::tubes_primitives::config::TubesConfig;
use lanlink_tubes::tubes_primitives::events::TubesEvent;
use lanlink_tubes::tubes_primitives::session::Session;
use lanlink_tubes::primitives::dbus;
use tempdir::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// A tubes manager attached to a loopback network.
pub struct Participant {
    pub name: String,
    pub client: TubesClient,
    pub events: mpsc::UnboundedReceiver<TubesEvent>,
    pub handles: Arc<HandleSet>,
    pub dir: TempDir,
}

impl Participant {
    pub fn join(network: &LoopbackNetwork, name: &str) -> Self {
        init_logging();

        let peer = network.connect(name);
        let dir = TempDir::new(name).unwrap();
        let socket_dir = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();

        let (client, events) = lanlink_tubes::start(
            TubesConfig::new(socket_dir),
            peer.session as Arc<dyn Session>,
            Arc::clone(&peer.handles) as Arc<dyn HandleRepository>,
            peer.events,
        );

        Self {
            name: name.to_owned(),
            client,
            events,
            handles: peer.handles,
            dir,
        }
    }

    pub fn handle(&self, name: &str) -> Handle {
        self.handles.ensure(name)
    }

    pub fn contact(&self, name: &str) -> Container {
        Container::contact(self.handle(name))
    }

    pub fn room(&self, name: &str) -> Container {
        Container::room(self.handle(name))
    }

    pub fn path(&self, file: &str) -> Utf8PathBuf {
        Utf8PathBuf::try_from(self.dir.path().join(file)).unwrap()
    }

    /// Waits for the first event matching `select`, skipping the rest.
    pub async fn wait_for<T>(&mut self, mut select: impl FnMut(&TubesEvent) -> Option<T>) -> T {
        let name = self.name.clone();

        timeout(TIMEOUT, async {
            loop {
                let event = self.events.recv().await.expect("manager stopped");
                if let Some(found) = select(&event) {
                    return found;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{name} timed out waiting for an event"))
    }
}

/// A little-endian D-Bus signal with no header fields and a body of
/// `body_len` copies of `fill`.
pub fn dbus_message(serial: u32, fill: u8, body_len: u32) -> Vec<u8> {
    let mut message = vec![b'l', 4, 0, 1];
    message.extend_from_slice(&body_len.to_le_bytes());
    message.extend_from_slice(&serial.to_le_bytes());
    message.extend_from_slice(&0_u32.to_le_bytes());
    message.resize(message.len() + body_len as usize, fill);
    message
}

/// Reads exactly one D-Bus message off `reader`.
pub async fn read_dbus_message(reader: &mut (impl AsyncRead + Unpin)) -> Vec<u8> {
    let mut message = vec![0; 16];

    timeout(TIMEOUT, async {
        reader.read_exact(&mut message).await.unwrap();

        let len = dbus::message_len(&message).unwrap().unwrap();
        message.resize(len, 0);
        reader.read_exact(&mut message[16..]).await.unwrap();
    })
    .await
    .expect("timed out reading a bus message");

    message
}
