use tracing::{debug, warn};

use crate::bridge::local::LocalEvent;
use crate::handler::commands::find_tube_mut;
use crate::tube::Accepted;
use crate::TubesManager;

#[allow(
    clippy::multiple_inherent_impl,
    reason = "Handlers live next to the inputs they serve"
)]
impl TubesManager {
    pub(crate) fn handle_local_event(&mut self, event: LocalEvent) {
        match event {
            LocalEvent::Accepted {
                listener,
                stream,
                source_port,
            } => {
                let Some(tube_ref) = self.ctx.routes.listeners.get(&listener).copied() else {
                    debug!(%listener, "Connection on a listener that is gone");
                    return;
                };
                let Ok(tube) = find_tube_mut(&mut self.channels, tube_ref.container, tube_ref.id)
                else {
                    return;
                };

                if let Accepted::NeedsStream(conn) = tube.on_accepted(&mut self.ctx, stream, source_port) {
                    if let Err(err) = self.negotiator.request_connection(&self.ctx, tube, conn) {
                        warn!(%err, tube=%tube_ref.id, %conn, "Failed to request a bytestream");
                        tube.reject_conn(&mut self.ctx, conn);
                    }
                }
            }
            LocalEvent::Dialed { conn, result } => {
                let Some(tube_ref) = self.ctx.routes.conns.get(&conn).copied() else {
                    debug!(%conn, "Dial finished for a connection that is gone");
                    return;
                };

                if let Ok(tube) = find_tube_mut(&mut self.channels, tube_ref.container, tube_ref.id) {
                    tube.on_dialed(&mut self.ctx, conn, result);
                }
            }
            LocalEvent::Read { conn, data } => {
                let Some(tube_ref) = self.ctx.routes.conns.get(&conn).copied() else {
                    debug!(%conn, len=data.len(), "Dropping read from a connection that is gone");
                    return;
                };

                if let Ok(tube) = find_tube_mut(&mut self.channels, tube_ref.container, tube_ref.id) {
                    tube.on_read(&mut self.ctx, conn, data);
                }
            }
            LocalEvent::Flushed { conn } => {
                let Some(tube_ref) = self.ctx.routes.conns.get(&conn).copied() else {
                    return;
                };

                if let Ok(tube) = find_tube_mut(&mut self.channels, tube_ref.container, tube_ref.id) {
                    tube.on_flushed(&mut self.ctx, conn);
                }
            }
            LocalEvent::Closed { conn } => {
                let Some(tube_ref) = self.ctx.routes.conns.get(&conn).copied() else {
                    return;
                };

                if let Ok(tube) = find_tube_mut(&mut self.channels, tube_ref.container, tube_ref.id) {
                    debug!(tube=%tube_ref.id, %conn, "Local connection closed");
                    tube.on_local_closed(&mut self.ctx, conn);
                }
            }
        }
    }
}
