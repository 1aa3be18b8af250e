#[cfg(test)]
#[path = "tests/handle.rs"]
mod tests;

use core::fmt;
use core::num::NonZeroU32;
use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Opaque integer naming a contact or a room within one local session.
///
/// Handles are only meaningful relative to the [`HandleRepository`] that
/// issued them; two participants will generally assign different handles
/// to the same remote name.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Handle(NonZeroU32);

impl Handle {
    #[must_use]
    pub const fn new(raw: NonZeroU32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    Contact,
    Room,
}

/// The conversation a tube lives in: a single contact or a multi-user room.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Container {
    pub handle: Handle,
    pub kind: HandleKind,
}

impl Container {
    #[must_use]
    pub const fn contact(handle: Handle) -> Self {
        Self {
            handle,
            kind: HandleKind::Contact,
        }
    }

    #[must_use]
    pub const fn room(handle: Handle) -> Self {
        Self {
            handle,
            kind: HandleKind::Room,
        }
    }

    #[must_use]
    pub const fn is_group(&self) -> bool {
        matches!(self.kind, HandleKind::Room)
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            HandleKind::Contact => write!(f, "contact {}", self.handle),
            HandleKind::Room => write!(f, "room {}", self.handle),
        }
    }
}

/// Maps handles to the textual names peers use on the wire, and back.
pub trait HandleRepository: Send + Sync {
    /// Returns the handle for `name`, allocating one if it has never been seen.
    fn ensure(&self, name: &str) -> Handle;

    fn lookup(&self, handle: Handle) -> Option<String>;

    fn lookup_name(&self, name: &str) -> Option<Handle>;
}

#[derive(Debug, Default)]
struct Interned {
    by_name: HashMap<String, Handle>,
    names: Vec<String>,
}

/// In-memory [`HandleRepository`]. Handles are dense and never reused.
#[derive(Debug, Default)]
pub struct HandleSet {
    inner: RwLock<Interned>,
}

impl HandleSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HandleRepository for HandleSet {
    fn ensure(&self, name: &str) -> Handle {
        if let Some(handle) = self.lookup_name(name) {
            return handle;
        }

        let mut inner = self.inner.write();

        // another writer may have interned it between the two locks
        if let Some(handle) = inner.by_name.get(name) {
            return *handle;
        }

        inner.names.push(name.to_owned());

        let raw = u32::try_from(inner.names.len())
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or(NonZeroU32::MAX);
        let handle = Handle(raw);

        let _ignored = inner.by_name.insert(name.to_owned(), handle);

        handle
    }

    fn lookup(&self, handle: Handle) -> Option<String> {
        let index = usize::try_from(handle.get()).ok()?.checked_sub(1)?;

        self.inner.read().names.get(index).cloned()
    }

    fn lookup_name(&self, name: &str) -> Option<Handle> {
        self.inner.read().by_name.get(name).copied()
    }
}
