use std::collections::{BTreeMap, BTreeSet, HashMap};

use eyre::Result as EyreResult;
use lanlink_primitives::handle::{Container, Handle};
use lanlink_primitives::tube::{TubeId, TubeInfo, TubeState};
use lanlink_tubes_primitives::error::TubeError;
use lanlink_tubes_primitives::events::TubesEvent;
use lanlink_tubes_primitives::wire::{Stanza, TubeAnnouncement};
use rand::thread_rng;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::context::Context;
use crate::tube::Tube;

/// An application request parked until a room join completes.
#[derive(Debug)]
pub(crate) enum PendingRequest {
    OfferStream(oneshot::Sender<EyreResult<()>>),
    OfferDBus(oneshot::Sender<EyreResult<TubeId>>),
}

impl PendingRequest {
    pub fn resolve(self, result: Result<TubeId, TubeError>) {
        let delivered = match self {
            Self::OfferStream(outcome) => outcome.send(result.map(drop).map_err(Into::into)).is_ok(),
            Self::OfferDBus(outcome) => outcome.send(result.map_err(Into::into)).is_ok(),
        };

        if !delivered {
            debug!("Requester went away before its offer completed");
        }
    }
}

/// All tubes within one contact or room.
#[derive(Debug)]
pub(crate) struct TubesChannel {
    pub container: Container,
    ready: bool,
    pub tubes: BTreeMap<TubeId, Tube>,
    pending_requests: BTreeMap<TubeId, Vec<PendingRequest>>,
    /// The open tube set each member last announced.
    announced_by: HashMap<Handle, BTreeSet<TubeId>>,
    last_announced: Option<BTreeSet<TubeId>>,
}

impl TubesChannel {
    /// One-to-one channels are ready at once; rooms once joined.
    pub fn new(container: Container, ready: bool) -> Self {
        Self {
            container,
            ready,
            tubes: BTreeMap::new(),
            pending_requests: BTreeMap::new(),
            announced_by: HashMap::new(),
            last_announced: None,
        }
    }

    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self) {
        self.ready = true;
    }

    /// Picks a random id not used by any tube in this channel.
    pub fn allocate_id(&self) -> TubeId {
        let mut rng = thread_rng();

        loop {
            let id = TubeId::random(&mut rng);
            if !self.tubes.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn tube(&self, id: TubeId) -> Result<&Tube, TubeError> {
        self.tubes.get(&id).ok_or(TubeError::UnknownTube {
            container: self.container,
            id,
        })
    }

    pub fn tube_mut(&mut self, id: TubeId) -> Result<&mut Tube, TubeError> {
        self.tubes.get_mut(&id).ok_or(TubeError::UnknownTube {
            container: self.container,
            id,
        })
    }

    pub fn infos(&self) -> Vec<TubeInfo> {
        self.tubes.values().map(Tube::info).collect()
    }

    pub fn queue(&mut self, id: TubeId, request: PendingRequest) {
        self.pending_requests.entry(id).or_default().push(request);
    }

    pub fn take_pending(&mut self) -> BTreeMap<TubeId, Vec<PendingRequest>> {
        core::mem::take(&mut self.pending_requests)
    }

    pub fn fail_pending(&mut self, id: TubeId, error: &TubeError) {
        for request in self.pending_requests.remove(&id).unwrap_or_default() {
            request.resolve(Err(error.clone()));
        }
    }

    /// Drops closed tubes, failing anything still waiting on them.
    pub fn reap(&mut self) -> Vec<Tube> {
        let closed: Vec<_> = self
            .tubes
            .iter()
            .filter(|(_, tube)| tube.state().is_closed())
            .map(|(id, _)| *id)
            .collect();

        closed
            .into_iter()
            .filter_map(|id| {
                self.fail_pending(id, &TubeError::ChannelClosed);
                self.tubes.remove(&id)
            })
            .collect()
    }

    fn open_tubes(&self) -> BTreeSet<TubeId> {
        self.tubes
            .iter()
            .filter(|(_, tube)| tube.state().is_open())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Broadcasts our open tubes to the room if they changed since the last
    /// announcement, or unconditionally when `force` is set.
    pub fn announce(&mut self, ctx: &Context, force: bool) {
        if !self.container.is_group() || !self.ready || ctx.disconnected {
            return;
        }

        let open = self.open_tubes();

        if !force && self.last_announced.as_ref() == Some(&open) {
            return;
        }

        if !force && self.last_announced.is_none() && open.is_empty() {
            return;
        }

        let announcement = TubeAnnouncement {
            tubes: open
                .iter()
                .filter_map(|id| self.tubes.get(id))
                .map(|tube| tube.announcement(ctx))
                .collect(),
        };

        debug!(room=%self.container.handle, tubes=announcement.tubes.len(), "Announcing tubes");

        match ctx
            .session
            .broadcast(self.container.handle, Stanza::Announcement(announcement))
        {
            Ok(()) => self.last_announced = Some(open),
            Err(err) => warn!(%err, room=%self.container.handle, "Failed to announce tubes"),
        }
    }

    /// Reconciles our view of the room with a member's announcement.
    pub fn apply_announcement(
        &mut self,
        ctx: &mut Context,
        from: Handle,
        announcement: TubeAnnouncement,
    ) {
        let mut seen = BTreeSet::new();

        for announced in announcement.tubes {
            let _ignored = seen.insert(announced.id);

            let initiator = ctx.handles.ensure(&announced.initiator);

            if let Some(tube) = self.tubes.get_mut(&announced.id) {
                if tube.kind() != announced.kind || tube.initiator != initiator {
                    warn!(room=%self.container.handle, %from, tube=%announced.id, "Announcement conflicts with known tube, ignoring");
                    continue;
                }

                if let Some(name) = announced.bus_name {
                    tube.set_bus_name(ctx, from, name);
                }

                continue;
            }

            if initiator == ctx.self_handle {
                debug!(room=%self.container.handle, tube=%announced.id, "Ignoring stale announcement of our own tube");
                continue;
            }

            let mut tube = Tube::remote(
                ctx,
                self.container,
                announced.id,
                initiator,
                announced.kind,
                announced.service,
                announced.parameters,
            );

            ctx.emit(TubesEvent::NewTube {
                container: self.container,
                info: tube.info(),
            });

            if let Some(name) = announced.bus_name {
                tube.set_bus_name(ctx, from, name);
            }

            let _ignored = self.tubes.insert(announced.id, tube);
        }

        let previous = self.announced_by.insert(from, seen.clone()).unwrap_or_default();

        for id in previous.difference(&seen) {
            let Some(tube) = self.tubes.get_mut(id) else {
                continue;
            };

            if tube.initiator == from {
                debug!(room=%self.container.handle, tube=%id, "Initiator withdrew tube");
                let _closed = tube.close(ctx, true);
            } else {
                tube.remove_bus_name(ctx, from);
            }
        }
    }

    pub fn member_left(&mut self, ctx: &mut Context, member: Handle) {
        let _ignored = self.announced_by.remove(&member);

        for tube in self.tubes.values_mut() {
            tube.member_left(ctx, member);
        }
    }

    /// Closes every tube and fails every parked request.
    pub fn close(&mut self, ctx: &mut Context, error: &TubeError) {
        for (_, requests) in self.take_pending() {
            for request in requests {
                request.resolve(Err(error.clone()));
            }
        }

        for tube in self.tubes.values_mut() {
            let _closed = tube.close(ctx, false);
        }

        self.tubes.clear();
    }

    pub fn has_open_tubes(&self) -> bool {
        self.tubes.values().any(|tube| tube.state() == TubeState::Open)
    }
}

#[cfg(test)]
#[path = "tests/channel.rs"]
mod tests;
