use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use lanlink_primitives::bytestream::{BytestreamKey, BytestreamMethod, BytestreamState};
use lanlink_primitives::dbus::{self, FramingError};
use lanlink_primitives::handle::Handle;
use lanlink_tubes_primitives::session::{SendError, Session};
use lanlink_tubes_primitives::wire::{DataFrame, Stanza};
use tracing::{debug, warn};

/// Where a bytestream's frames go.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Route {
    Peer(Handle),
    Room(Handle),
}

impl Route {
    pub const fn target(self) -> Handle {
        match self {
            Self::Peer(handle) | Self::Room(handle) => handle,
        }
    }
}

/// Why inbound data was not taken.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Refused {
    /// The local socket is not draining and the queue is at its limit.
    Overflow,
    /// A room bus sender broke D-Bus message framing. Its partial message
    /// is dropped; other senders are unaffected.
    Framing(FramingError),
}

/// Reassembles the bytes each member sends on a room bus into whole D-Bus
/// messages, so concurrent senders never interleave inside one.
#[derive(Debug, Default)]
pub(crate) struct BusMessages {
    partial: HashMap<Handle, BytesMut>,
}

impl BusMessages {
    /// Adds `data` from `sender`, returning the messages it completed.
    pub fn push(
        &mut self,
        sender: Handle,
        data: &[u8],
        limit: usize,
    ) -> Result<Option<Bytes>, FramingError> {
        let buffer = self.partial.entry(sender).or_default();
        buffer.extend_from_slice(data);

        let mut complete = 0;
        let scanned = loop {
            match dbus::message_len(&buffer[complete..]) {
                Ok(Some(len)) if len > limit => break Err(FramingError::TooLong(len as u64)),
                Ok(Some(len)) if buffer.len() - complete >= len => complete += len,
                Ok(_) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        if let Err(err) = scanned {
            let _dropped = self.partial.remove(&sender);
            return Err(err);
        }

        let messages = (complete > 0).then(|| buffer.split_to(complete).freeze());

        if buffer.is_empty() {
            let _drained = self.partial.remove(&sender);
        }

        Ok(messages)
    }

    pub fn forget(&mut self, sender: Handle) {
        let _dropped = self.partial.remove(&sender);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SendOutcome {
    Sent,
    /// Queued behind a full session; resumes on `Writable`.
    Blocked,
    Failed,
}

/// One logical byte pipe to a peer.
#[derive(Debug)]
pub(crate) struct Bytestream {
    pub key: BytestreamKey,
    pub method: BytestreamMethod,
    pub route: Route,
    state: BytestreamState,
    /// Wire name of `key.initiator`, stamped on every outgoing frame.
    initiator_name: String,
    write_blocked: bool,
    outbound: VecDeque<Bytes>,
    inbound_paused: bool,
    inbound: BytesMut,
    /// Set on the shared stream of a room bus.
    bus: Option<BusMessages>,
    /// Close once `outbound` is flushed.
    closing: bool,
}

impl Bytestream {
    fn new(
        key: BytestreamKey,
        method: BytestreamMethod,
        route: Route,
        initiator_name: String,
        state: BytestreamState,
    ) -> Self {
        Self {
            key,
            method,
            route,
            state,
            initiator_name,
            write_blocked: false,
            outbound: VecDeque::new(),
            // nothing is delivered until the stream is paired with a socket
            inbound_paused: true,
            inbound: BytesMut::new(),
            bus: None,
            closing: false,
        }
    }

    /// A stream a peer asked us to accept.
    pub fn local_pending(
        key: BytestreamKey,
        method: BytestreamMethod,
        route: Route,
        initiator_name: String,
    ) -> Self {
        Self::new(key, method, route, initiator_name, BytestreamState::LocalPending)
    }

    /// A stream we asked for and the peer accepted.
    pub fn initiating(
        key: BytestreamKey,
        method: BytestreamMethod,
        route: Route,
        initiator_name: String,
    ) -> Self {
        Self::new(key, method, route, initiator_name, BytestreamState::Initiating)
    }

    /// The shared stream of a room D-Bus tube; needs no negotiation.
    pub fn room_bus(key: BytestreamKey, room_name: String) -> Self {
        let mut stream = Self::new(
            key,
            BytestreamMethod::MulticastSlice,
            Route::Room(key.peer),
            room_name,
            BytestreamState::Open,
        );
        stream.bus = Some(BusMessages::default());
        stream
    }

    pub const fn state(&self) -> BytestreamState {
        self.state
    }

    pub const fn is_open(&self) -> bool {
        matches!(self.state, BytestreamState::Open)
    }

    pub const fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    pub const fn is_closing(&self) -> bool {
        self.closing
    }

    /// Arranges for the stream to close after queued outbound data reaches
    /// the session. Returns false if nothing is queued, in which case the
    /// caller can close right away.
    pub fn close_when_sent(&mut self) -> bool {
        if !self.write_blocked || self.outbound.is_empty() {
            return false;
        }

        self.closing = true;
        true
    }

    /// LocalPending -> Open, after we replied with an accept.
    pub fn accept(&mut self) -> bool {
        if self.state != BytestreamState::LocalPending {
            return false;
        }

        self.state = BytestreamState::Open;
        true
    }

    /// Initiating -> Open, once the transport is usable.
    pub fn start(&mut self) -> bool {
        if self.state != BytestreamState::Initiating {
            return false;
        }

        self.state = BytestreamState::Open;
        true
    }

    pub fn send(&mut self, session: &dyn Session, data: Bytes) -> SendOutcome {
        if !self.is_open() {
            return SendOutcome::Failed;
        }

        self.outbound.push_back(data);

        if self.write_blocked {
            return SendOutcome::Blocked;
        }

        self.flush(session)
    }

    /// Pushes queued data into the session until it is drained or full.
    pub fn flush(&mut self, session: &dyn Session) -> SendOutcome {
        while let Some(payload) = self.outbound.pop_front() {
            match self.transmit(session, payload.clone()) {
                Ok(()) => {}
                Err(SendError::Full) => {
                    self.outbound.push_front(payload);
                    if !self.write_blocked {
                        debug!(stream=%self.key, "Session is full, blocking bytestream");
                    }
                    self.write_blocked = true;
                    return SendOutcome::Blocked;
                }
                Err(err) => {
                    warn!(%err, stream=%self.key, "Failed to send bytestream data");
                    self.outbound.clear();
                    return SendOutcome::Failed;
                }
            }
        }

        self.write_blocked = false;
        SendOutcome::Sent
    }

    fn transmit(&self, session: &dyn Session, payload: Bytes) -> Result<(), SendError> {
        let frame = DataFrame {
            stream_id: self.key.stream_id,
            initiator: self.initiator_name.clone(),
            payload,
        };

        match self.route {
            Route::Peer(peer) => session.send(peer, Stanza::Data(frame)),
            Route::Room(room) => session.multicast(room, frame),
        }
    }

    /// Accepts inbound data from `sender`, returning what should be written
    /// locally now. While paused, data accumulates until
    /// [`Self::resume_inbound`], up to `limit` bytes.
    pub fn receive(
        &mut self,
        sender: Handle,
        data: &[u8],
        limit: usize,
    ) -> Result<Option<Bytes>, Refused> {
        if !self.is_open() || self.closing {
            return Ok(None);
        }

        let data = match &mut self.bus {
            Some(bus) => match bus.push(sender, data, limit).map_err(Refused::Framing)? {
                Some(messages) => messages,
                None => return Ok(None),
            },
            None => Bytes::copy_from_slice(data),
        };

        if self.inbound_paused {
            if self.inbound.len().saturating_add(data.len()) > limit {
                return Err(Refused::Overflow);
            }

            self.inbound.extend_from_slice(&data);
            return Ok(None);
        }

        Ok(Some(data))
    }

    /// Drops a departed room member's unfinished bus message.
    pub fn forget_sender(&mut self, sender: Handle) {
        if let Some(bus) = &mut self.bus {
            bus.forget(sender);
        }
    }

    pub fn pause_inbound(&mut self) {
        self.inbound_paused = true;
    }

    /// Unpauses and hands back anything queued meanwhile.
    pub fn resume_inbound(&mut self) -> Option<Bytes> {
        self.inbound_paused = false;

        if self.inbound.is_empty() {
            return None;
        }

        Some(self.inbound.split().freeze())
    }

    /// Closes the stream, telling the peer unless it already knows.
    pub fn close(&mut self, session: &dyn Session, notify_peer: bool) {
        if self.state == BytestreamState::Closed {
            return;
        }

        let was_established = matches!(
            self.state,
            BytestreamState::Open | BytestreamState::Initiating
        );

        self.state = BytestreamState::Closed;
        self.outbound.clear();
        self.inbound.clear();
        self.bus = None;

        let room_wide = matches!(self.route, Route::Room(room) if room == self.key.peer);

        if notify_peer && was_established && !room_wide {
            let stanza = Stanza::CloseStream {
                stream_id: self.key.stream_id,
                initiator: self.initiator_name.clone(),
            };

            if let Err(err) = session.send(self.key.peer, stanza) {
                debug!(%err, stream=%self.key, "Failed to notify peer of stream close");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/bytestream.rs"]
mod tests;
