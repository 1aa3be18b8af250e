use std::collections::HashMap;
use std::sync::Arc;

use lanlink_primitives::bytestream::BytestreamKey;
use lanlink_primitives::handle::{Container, Handle, HandleRepository};
use lanlink_primitives::tube::TubeId;
use lanlink_tubes_primitives::config::TubesConfig;
use lanlink_tubes_primitives::events::TubesEvent;
use lanlink_tubes_primitives::session::Session;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bridge::local::LocalEvent;
use crate::bridge::{ConnId, ListenerId};

/// Addresses a tube from outside its channel.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct TubeRef {
    pub container: Container,
    pub id: TubeId,
}

/// Reverse indices from transport identifiers to the owning tube.
///
/// Entries are removed before a tube tears its transports down, so late
/// events for a closing tube find nothing and are dropped.
#[derive(Debug, Default)]
pub(crate) struct Routes {
    pub streams: HashMap<BytestreamKey, TubeRef>,
    pub conns: HashMap<ConnId, TubeRef>,
    pub listeners: HashMap<ListenerId, TubeRef>,
}

/// State every tube operation may touch, kept apart from the channel map so
/// both can be borrowed at once.
pub(crate) struct Context {
    pub session: Arc<dyn Session>,
    pub handles: Arc<dyn HandleRepository>,
    pub config: TubesConfig,
    pub self_handle: Handle,
    pub self_name: String,
    pub routes: Routes,
    pub disconnected: bool,
    events: mpsc::UnboundedSender<TubesEvent>,
    local: mpsc::UnboundedSender<LocalEvent>,
    serial: u64,
}

impl Context {
    pub fn new(
        session: Arc<dyn Session>,
        handles: Arc<dyn HandleRepository>,
        config: TubesConfig,
        events: mpsc::UnboundedSender<TubesEvent>,
        local: mpsc::UnboundedSender<LocalEvent>,
    ) -> Self {
        let self_handle = session.self_handle();
        let self_name = handles.lookup(self_handle).unwrap_or_default();

        Self {
            session,
            handles,
            config,
            self_handle,
            self_name,
            routes: Routes::default(),
            disconnected: false,
            events,
            local,
            serial: 0,
        }
    }

    pub fn emit(&self, event: TubesEvent) {
        if self.events.send(event).is_err() {
            debug!("Tubes event receiver dropped, discarding event");
        }
    }

    pub fn local_sender(&self) -> mpsc::UnboundedSender<LocalEvent> {
        self.local.clone()
    }

    /// Monotonic counter for connection, listener and tube generation ids.
    pub fn next_serial(&mut self) -> u64 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }

    pub fn name_of(&self, handle: Handle) -> String {
        self.handles.lookup(handle).unwrap_or_default()
    }
}
