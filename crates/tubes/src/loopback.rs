//! In-memory peer sessions.
//!
//! A [`LoopbackNetwork`] connects any number of named participants inside one
//! process. Every participant sees the others through its own
//! [`HandleSet`], exactly as separate processes would, so managers wired to
//! it exercise the same code paths as over a real link. Every stanza is
//! framed with [`StanzaCodec`] on the way out and decoded on the way in, so
//! what arrives is what a byte transport would have carried. Rooms, member
//! churn and a full outbound queue can all be driven from the network handle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use bytes::BytesMut;
use lanlink_primitives::handle::{Handle, HandleRepository, HandleSet};
use lanlink_tubes_primitives::session::{SendError, Session, SessionEvent};
use lanlink_tubes_primitives::wire::{DataFrame, Stanza, StanzaCodec, DEFAULT_MAX_FRAME_SIZE};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct Member {
    handles: Arc<HandleSet>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Member {
    fn deliver(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("Loopback member stopped listening");
        }
    }

    fn handle(&self, name: &str) -> Handle {
        self.handles.ensure(name)
    }
}

#[derive(Debug)]
struct Network {
    members: HashMap<String, Member>,
    rooms: HashMap<String, BTreeSet<String>>,
    /// `(sender, destination)` pairs whose sends report a full queue.
    choked: HashSet<(String, String)>,
    max_frame_size: usize,
}

impl Network {
    fn new(max_frame_size: usize) -> Self {
        Self {
            members: HashMap::new(),
            rooms: HashMap::new(),
            choked: HashSet::new(),
            max_frame_size,
        }
    }

    /// Puts `stanza` through the wire encoding and back.
    fn carry(&self, stanza: Stanza) -> Result<Stanza, SendError> {
        let mut codec = StanzaCodec::new(self.max_frame_size);
        let mut wire = BytesMut::new();

        if let Err(err) = codec.encode(stanza, &mut wire) {
            warn!(%err, "Refusing to send stanza");
            return Err(SendError::Unframeable);
        }

        match codec.decode(&mut wire) {
            Ok(Some(stanza)) => Ok(stanza),
            Ok(None) => Err(SendError::Unframeable),
            Err(err) => {
                warn!(%err, "Stanza did not survive its own framing");
                Err(SendError::Unframeable)
            }
        }
    }

    fn room_members(&self, room: &str) -> impl Iterator<Item = (&String, &Member)> {
        self.rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter_map(|name| self.members.get(name).map(|member| (name, member)))
    }

    fn remove_from_room(&mut self, room: &str, name: &str) {
        let Some(names) = self.rooms.get_mut(room) else {
            return;
        };
        if !names.remove(name) {
            return;
        }

        for (_, member) in self.room_members(room) {
            member.deliver(SessionEvent::MemberLeft {
                room: member.handle(room),
                member: member.handle(name),
            });
        }
    }
}

/// A set of participants exchanging stanzas in memory.
#[derive(Clone, Debug)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Network>>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// One participant's view of a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackPeer {
    pub session: Arc<LoopbackSession>,
    pub handles: Arc<HandleSet>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A network whose links refuse stanzas that frame larger than `limit`.
    #[must_use]
    pub fn with_max_frame_size(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Network::new(limit))),
        }
    }

    /// Adds a participant. Connecting a name twice replaces the first.
    #[must_use]
    pub fn connect(&self, name: &str) -> LoopbackPeer {
        let handles = Arc::new(HandleSet::new());
        let self_handle = handles.ensure(name);
        let (sender, events) = mpsc::unbounded_channel();

        let _previous = self.inner.lock().members.insert(
            name.to_owned(),
            Member {
                handles: Arc::clone(&handles),
                events: sender,
            },
        );

        debug!(%name, "Loopback participant connected");

        LoopbackPeer {
            session: Arc::new(LoopbackSession {
                name: name.to_owned(),
                self_handle,
                handles: Arc::clone(&handles),
                network: Arc::clone(&self.inner),
            }),
            handles,
            events,
        }
    }

    /// Puts `name` in `room`, telling it the join worked and everyone
    /// already there that it arrived.
    pub fn join(&self, room: &str, name: &str) {
        let mut network = self.inner.lock();

        if !network
            .rooms
            .entry(room.to_owned())
            .or_default()
            .insert(name.to_owned())
        {
            return;
        }

        for (other, member) in network.room_members(room) {
            if other == name {
                member.deliver(SessionEvent::Joined {
                    room: member.handle(room),
                });
            } else {
                member.deliver(SessionEvent::MemberJoined {
                    room: member.handle(room),
                    member: member.handle(name),
                });
            }
        }
    }

    /// Reports a failed join of `room` to `name`.
    pub fn refuse_join(&self, room: &str, name: &str) {
        let network = self.inner.lock();

        if let Some(member) = network.members.get(name) {
            member.deliver(SessionEvent::JoinFailed {
                room: member.handle(room),
            });
        }
    }

    /// Takes `name` out of `room`; everyone left, and `name` itself, sees it go.
    pub fn leave(&self, room: &str, name: &str) {
        let mut network = self.inner.lock();

        if !network.rooms.get(room).is_some_and(|names| names.contains(name)) {
            return;
        }

        if let Some(member) = network.members.get(name) {
            member.deliver(SessionEvent::MemberLeft {
                room: member.handle(room),
                member: member.handle(name),
            });
        }

        network.remove_from_room(room, name);
    }

    /// Makes sends from `from` to `to` (a participant or a room) fail as
    /// full until [`Self::unchoke`].
    pub fn choke(&self, from: &str, to: &str) {
        let _inserted = self
            .inner
            .lock()
            .choked
            .insert((from.to_owned(), to.to_owned()));
    }

    /// Lets `from` send to `to` again and tells it so.
    pub fn unchoke(&self, from: &str, to: &str) {
        let mut network = self.inner.lock();

        if !network.choked.remove(&(from.to_owned(), to.to_owned())) {
            return;
        }

        if let Some(member) = network.members.get(from) {
            member.deliver(SessionEvent::Writable {
                to: member.handle(to),
            });
        }
    }

    /// Drops a participant as if its link went down.
    pub fn disconnect(&self, name: &str) {
        let mut network = self.inner.lock();

        let rooms: Vec<_> = network
            .rooms
            .iter()
            .filter(|(_, names)| names.contains(name))
            .map(|(room, _)| room.clone())
            .collect();

        for room in rooms {
            network.remove_from_room(&room, name);
        }

        if let Some(member) = network.members.remove(name) {
            member.deliver(SessionEvent::Disconnected);
        }

        debug!(%name, "Loopback participant disconnected");
    }
}

/// [`Session`] backed by a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackSession {
    name: String,
    self_handle: Handle,
    handles: Arc<HandleSet>,
    network: Arc<Mutex<Network>>,
}

impl LoopbackSession {
    fn name_of(&self, handle: Handle) -> Result<String, SendError> {
        self.handles.lookup(handle).ok_or(SendError::UnknownPeer)
    }

    /// Delivers one event per room member other than us.
    fn to_room(
        &self,
        room: Handle,
        stanza: Stanza,
        event: impl Fn(Handle, Handle, Stanza) -> SessionEvent,
    ) -> Result<(), SendError> {
        let room = self.name_of(room)?;
        let network = self.network.lock();

        if !network.members.contains_key(&self.name) {
            return Err(SendError::Disconnected);
        }
        if !network
            .rooms
            .get(&room)
            .is_some_and(|names| names.contains(&self.name))
        {
            return Err(SendError::UnknownPeer);
        }
        if network.choked.contains(&(self.name.clone(), room.clone())) {
            return Err(SendError::Full);
        }

        let stanza = network.carry(stanza)?;

        for (name, member) in network.room_members(&room) {
            if *name != self.name {
                member.deliver(event(
                    member.handle(&room),
                    member.handle(&self.name),
                    stanza.clone(),
                ));
            }
        }

        Ok(())
    }
}

impl Session for LoopbackSession {
    fn self_handle(&self) -> Handle {
        self.self_handle
    }

    fn send(&self, to: Handle, stanza: Stanza) -> Result<(), SendError> {
        let to = self.name_of(to)?;
        let network = self.network.lock();

        if !network.members.contains_key(&self.name) {
            return Err(SendError::Disconnected);
        }
        if network.choked.contains(&(self.name.clone(), to.clone())) {
            return Err(SendError::Full);
        }

        let member = network.members.get(&to).ok_or(SendError::UnknownPeer)?;
        let stanza = network.carry(stanza)?;
        member.deliver(SessionEvent::Stanza {
            from: member.handle(&self.name),
            stanza,
        });

        Ok(())
    }

    fn broadcast(&self, room: Handle, stanza: Stanza) -> Result<(), SendError> {
        self.to_room(room, stanza, |room, from, stanza| SessionEvent::GroupStanza {
            room,
            from,
            stanza,
        })
    }

    fn multicast(&self, room: Handle, frame: DataFrame) -> Result<(), SendError> {
        self.to_room(room, Stanza::Data(frame), |room, from, stanza| match stanza {
            Stanza::Data(frame) => SessionEvent::Multicast { room, from, frame },
            stanza => SessionEvent::GroupStanza { room, from, stanza },
        })
    }
}
