#[cfg(test)]
#[path = "tests/tube.rs"]
mod tests;

use core::fmt;
use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handle::Handle;

/// Identifies a tube within its container. Always fits in 31 bits.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct TubeId(u32);

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("tube id {0} does not fit in 31 bits")]
pub struct InvalidTubeId(pub u32);

impl TubeId {
    pub const MAX: u32 = 0x7fff_ffff;

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen_range(0..=Self::MAX))
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for TubeId {
    type Error = InvalidTubeId;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        if raw > Self::MAX {
            return Err(InvalidTubeId(raw));
        }

        Ok(Self(raw))
    }
}

impl From<TubeId> for u32 {
    fn from(id: TubeId) -> Self {
        id.0
    }
}

impl fmt::Display for TubeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TubeKind {
    Stream,
    DBus,
}

impl fmt::Display for TubeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Stream => "stream",
            Self::DBus => "dbus",
        })
    }
}

/// Lifecycle of a tube.
///
/// ```text
/// NotOffered --offer--> RemotePending --peer accepts--> Open
///                   \--(room)---------------------------^
/// LocalPending --accept--> Open
/// any --close--> Closed
/// ```
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TubeState {
    NotOffered,
    LocalPending,
    RemotePending,
    Open,
    Closed,
}

impl TubeState {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// A single typed tube parameter value.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    Str(String),
    Bytes(Vec<u8>),
    Int(i32),
    Uint(u32),
    Bool(bool),
}

pub type Parameters = BTreeMap<String, ParamValue>;

/// Application-visible description of a tube.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TubeInfo {
    pub id: TubeId,
    pub initiator: Handle,
    pub kind: TubeKind,
    pub service: String,
    pub parameters: Parameters,
    pub state: TubeState,
}
