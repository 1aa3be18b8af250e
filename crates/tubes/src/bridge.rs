//! Pairs local socket connections with bytestreams.
//!
//! The two pair tables are only ever updated together, so looking up a
//! pair from either side gives the same answer.

use core::fmt;
use std::collections::HashMap;
use std::fs::remove_file;

use bytes::Bytes;
use camino::Utf8PathBuf;
use lanlink_primitives::bytestream::BytestreamKey;
use lanlink_primitives::socket::{AccessControl, SocketAddress};
use tokio::task::AbortHandle;
use tracing::debug;

pub(crate) mod local;

use local::Pump;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct ConnId(u64);

impl ConnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct ListenerId(u64);

impl ListenerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A socket a tube listens on for local connections.
#[derive(Debug)]
pub(crate) struct Listener {
    pub id: ListenerId,
    pub address: SocketAddress,
    pub access_control: AccessControl,
    task: AbortHandle,
}

impl Listener {
    pub const fn new(
        id: ListenerId,
        address: SocketAddress,
        access_control: AccessControl,
        task: AbortHandle,
    ) -> Self {
        Self {
            id,
            address,
            access_control,
            task,
        }
    }

    fn unix_path(&self) -> Option<&Utf8PathBuf> {
        match &self.address {
            SocketAddress::Unix(path) => Some(path),
            SocketAddress::Inet(_) => None,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();

        if let Some(path) = self.unix_path() {
            if let Err(err) = remove_file(path) {
                debug!(%err, %path, "Failed to remove tube socket");
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    /// Outbound connect in progress, no pump yet.
    Dialing,
    /// Connected but not yet paired; nothing is read.
    Waiting,
    Paired,
    /// Unpaired, closes once queued writes are flushed.
    Draining,
}

#[derive(Debug)]
struct LocalConn {
    pump: Option<Pump>,
    phase: Phase,
    unflushed: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Flush {
    /// Writes are still outstanding.
    Pending,
    /// The connection has nothing left to write.
    Idle,
    /// A draining connection finished and was removed.
    Finished,
}

#[derive(Debug, Default)]
pub(crate) struct Bridge {
    listener: Option<Listener>,
    conns: HashMap<ConnId, LocalConn>,
    by_stream: HashMap<BytestreamKey, ConnId>,
    by_conn: HashMap<ConnId, BytestreamKey>,
}

impl Bridge {
    pub fn set_listener(&mut self, listener: Listener) {
        self.listener = Some(listener);
    }

    pub const fn listener(&self) -> Option<&Listener> {
        self.listener.as_ref()
    }

    pub fn add_dialing(&mut self, conn: ConnId) {
        self.insert_conn(conn, None, Phase::Dialing);
    }

    pub fn add_waiting(&mut self, conn: ConnId, pump: Pump) {
        self.insert_conn(conn, Some(pump), Phase::Waiting);
    }

    fn insert_conn(&mut self, conn: ConnId, pump: Option<Pump>, phase: Phase) {
        let _ignored = self.conns.insert(
            conn,
            LocalConn {
                pump,
                phase,
                unflushed: 0,
            },
        );
    }

    /// Gives a dialed connection its pump. Returns false if the connection
    /// was dropped while dialing.
    pub fn attach_pump(&mut self, conn: ConnId, pump: Pump) -> bool {
        let Some(local) = self.conns.get_mut(&conn) else {
            return false;
        };

        local.pump = Some(pump);
        if local.phase == Phase::Dialing {
            local.phase = if self.by_conn.contains_key(&conn) {
                Phase::Paired
            } else {
                Phase::Waiting
            };
        }

        true
    }

    #[cfg(test)]
    pub fn has_conn(&self, conn: ConnId) -> bool {
        self.conns.contains_key(&conn)
    }

    pub fn is_waiting(&self, conn: ConnId) -> bool {
        self.conns
            .get(&conn)
            .is_some_and(|local| local.phase == Phase::Waiting)
    }

    pub fn is_ready(&self, conn: ConnId) -> bool {
        self.conns
            .get(&conn)
            .is_some_and(|local| local.pump.is_some())
    }

    pub fn first_waiting(&self) -> Option<ConnId> {
        self.conns
            .iter()
            .filter(|(_, local)| local.phase == Phase::Waiting)
            .map(|(conn, _)| *conn)
            .min()
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn pair(&mut self, key: BytestreamKey, conn: ConnId) {
        if let Some(local) = self.conns.get_mut(&conn) {
            if local.phase == Phase::Waiting {
                local.phase = Phase::Paired;
            }
        }

        let _ignored = self.by_stream.insert(key, conn);
        let _ignored = self.by_conn.insert(conn, key);
    }

    pub fn unpair_conn(&mut self, conn: ConnId) -> Option<BytestreamKey> {
        let key = self.by_conn.remove(&conn)?;
        let _ignored = self.by_stream.remove(&key);

        Some(key)
    }

    pub fn unpair_stream(&mut self, key: BytestreamKey) -> Option<ConnId> {
        let conn = self.by_stream.remove(&key)?;
        let _ignored = self.by_conn.remove(&conn);

        Some(conn)
    }

    pub fn conn_for(&self, key: BytestreamKey) -> Option<ConnId> {
        self.by_stream.get(&key).copied()
    }

    pub fn stream_for(&self, conn: ConnId) -> Option<BytestreamKey> {
        self.by_conn.get(&conn).copied()
    }

    pub fn pair_count(&self) -> usize {
        debug_assert_eq!(self.by_stream.len(), self.by_conn.len());
        self.by_stream.len()
    }

    pub fn grant_read(&self, conn: ConnId) {
        if let Some(pump) = self.conns.get(&conn).and_then(|local| local.pump.as_ref()) {
            pump.grant();
        }
    }

    /// Queues `data` for the local socket. Returns false when the
    /// connection cannot take writes.
    pub fn write(&mut self, conn: ConnId, data: Bytes) -> bool {
        let Some(local) = self.conns.get_mut(&conn) else {
            return false;
        };
        let Some(pump) = &local.pump else {
            return false;
        };

        if !pump.write(data) {
            return false;
        }

        local.unflushed = local.unflushed.saturating_add(1);
        true
    }

    pub fn flushed(&mut self, conn: ConnId) -> Flush {
        let Some(local) = self.conns.get_mut(&conn) else {
            return Flush::Pending;
        };

        local.unflushed = local.unflushed.saturating_sub(1);

        if local.unflushed > 0 {
            return Flush::Pending;
        }

        if local.phase != Phase::Draining {
            return Flush::Idle;
        }

        if let Some(local) = self.conns.remove(&conn) {
            if let Some(pump) = local.pump {
                pump.finish();
            }
        }

        Flush::Finished
    }

    /// Closes `conn` once its queued writes reach the socket. Returns true
    /// if it was removed immediately.
    pub fn close_after_flush(&mut self, conn: ConnId) -> bool {
        let _ignored = self.unpair_conn(conn);

        let Some(local) = self.conns.get_mut(&conn) else {
            return false;
        };

        if local.unflushed > 0 && local.pump.is_some() {
            local.phase = Phase::Draining;
            return false;
        }

        if let Some(pump) = self.conns.remove(&conn).and_then(|local| local.pump) {
            pump.finish();
        }

        true
    }

    pub fn force_close(&mut self, conn: ConnId) -> bool {
        let _ignored = self.unpair_conn(conn);

        let Some(local) = self.conns.remove(&conn) else {
            return false;
        };

        if let Some(pump) = local.pump {
            pump.abort();
        }

        true
    }

    /// Drops every connection and the listener. Returns what was torn down
    /// so the caller can forget its routes.
    pub fn close_all(&mut self) -> (Vec<ConnId>, Option<ListenerId>) {
        self.by_stream.clear();
        self.by_conn.clear();

        let conns = self
            .conns
            .drain()
            .map(|(conn, local)| {
                if let Some(pump) = local.pump {
                    pump.abort();
                }
                conn
            })
            .collect();

        let listener = self.listener.take().map(|listener| listener.id);

        (conns, listener)
    }
}
