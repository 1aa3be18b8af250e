//! Tubes: application byte streams and private D-Bus buses tunnelled
//! through peer sessions.
//!
//! A single task owns all tube state. It reacts to three inputs, each
//! handled to completion before the next:
//!
//! * commands from [`TubesClient`]s,
//! * [`SessionEvent`]s from the peer session,
//! * events from the tasks that own local sockets.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use lanlink_primitives::handle::{Container, Handle, HandleRepository};
use lanlink_tubes_primitives::client::{TubesClient, TubesMessage};
use lanlink_tubes_primitives::config::TubesConfig;
use lanlink_tubes_primitives::error::TubeError;
use lanlink_tubes_primitives::events::TubesEvent;
use lanlink_tubes_primitives::session::{Session, SessionEvent};
use tokio::sync::mpsc;
use tokio::{select, spawn};
use tracing::{debug, info};

use crate::bridge::local::LocalEvent;
use crate::channel::TubesChannel;
use crate::context::Context;
use crate::negotiator::Negotiator;

mod bridge;
mod bytestream;
mod channel;
mod context;
mod handler;
pub mod loopback;
mod negotiator;
mod tube;

#[cfg(test)]
#[path = "tests/mocks.rs"]
mod mocks;

pub use lanlink_primitives as primitives;
pub use lanlink_tubes_primitives as tubes_primitives;

/// Spawns a tubes manager on the current runtime.
pub fn start(
    config: TubesConfig,
    session: Arc<dyn Session>,
    handles: Arc<dyn HandleRepository>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
) -> (TubesClient, mpsc::UnboundedReceiver<TubesEvent>) {
    let (client, event_receiver, manager) = init(config, session, handles, session_events);

    drop(spawn(manager.run()));

    (client, event_receiver)
}

/// Builds a tubes manager without running it.
pub fn init(
    config: TubesConfig,
    session: Arc<dyn Session>,
    handles: Arc<dyn HandleRepository>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
) -> (
    TubesClient,
    mpsc::UnboundedReceiver<TubesEvent>,
    TubesManager,
) {
    let (command_sender, command_receiver) = mpsc::channel(config.command_buffer.max(1));
    let (event_sender, event_receiver) = mpsc::unbounded_channel();
    let (local_sender, local_receiver) = mpsc::unbounded_channel();

    let ctx = Context::new(session, handles, config, event_sender, local_sender);

    let manager = TubesManager {
        ctx,
        channels: BTreeMap::new(),
        negotiator: Negotiator::default(),
        joined_rooms: BTreeSet::new(),
        command_receiver,
        session_events: Some(session_events),
        local_receiver,
    };

    (TubesClient::new(command_sender), event_receiver, manager)
}

pub struct TubesManager {
    ctx: Context,
    channels: BTreeMap<Handle, TubesChannel>,
    negotiator: Negotiator,
    joined_rooms: BTreeSet<Handle>,
    command_receiver: mpsc::Receiver<TubesMessage>,
    session_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    local_receiver: mpsc::UnboundedReceiver<LocalEvent>,
}

impl core::fmt::Debug for TubesManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TubesManager")
            .field("self_handle", &self.ctx.self_handle)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

#[allow(
    clippy::multiple_inherent_impl,
    reason = "Handlers live next to the inputs they serve"
)]
impl TubesManager {
    /// Runs until every [`TubesClient`] is dropped.
    pub async fn run(mut self) {
        info!(self_handle=%self.ctx.self_handle, name=%self.ctx.self_name, "Tubes manager started");

        #[expect(clippy::redundant_pub_crate, reason = "Needed for Tokio code")]
        loop {
            select! {
                command = self.command_receiver.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }
                event = recv_session(&mut self.session_events) => {
                    match event {
                        Some(event) => self.handle_session_event(event),
                        None => {
                            debug!("Session event stream ended");
                            self.session_events = None;
                            self.handle_session_event(SessionEvent::Disconnected);
                        }
                    }
                }
                Some(event) = self.local_receiver.recv() => self.handle_local_event(event),
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        info!(channels = self.channels.len(), "Tubes manager shutting down");

        for (_, mut channel) in core::mem::take(&mut self.channels) {
            channel.close(&mut self.ctx, &TubeError::ChannelClosed);
        }
    }

    fn ensure_channel(&mut self, container: Container) -> &mut TubesChannel {
        let ready = !container.is_group() || self.joined_rooms.contains(&container.handle);

        self.channels
            .entry(container.handle)
            .or_insert_with(|| TubesChannel::new(container, ready))
    }

    /// Removes closed tubes from a channel and re-announces if its open
    /// set changed.
    fn reap(&mut self, container: Handle) {
        let Some(channel) = self.channels.get_mut(&container) else {
            return;
        };

        for tube in channel.reap() {
            self.negotiator.forget(tube.tube_ref());
        }

        channel.announce(&self.ctx, false);
    }
}

async fn recv_session(
    events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>,
) -> Option<SessionEvent> {
    match events {
        Some(events) => events.recv().await,
        None => core::future::pending().await,
    }
}
