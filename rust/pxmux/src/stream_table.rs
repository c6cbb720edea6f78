//! Per-physical-connection table of virtual streams.
//!
//! Entries live in a vector indexed by stream id. Freed ids go to an ordered
//! set so allocation always hands out the smallest id not in use.

use std::collections::BTreeSet;

use pxmux_wire::{ReasonCode, StreamId};

/// Close state of one stream.
///
/// A stream is removed only once both sides agree it is closed; until then
/// the entry keeps its id reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// The owner closed; waiting for the backend's `CloseStream`.
    ClosedByClient,
    /// The backend closed; waiting for the owner to acknowledge.
    ClosedByServer,
    /// The physical connection is closing; waiting for the owner to
    /// acknowledge.
    PhysicalClosed,
}

/// Something that closes a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseEvent {
    /// The owner closed the stream.
    Local(ReasonCode),
    /// The backend sent `CloseStream`.
    Remote(ReasonCode),
    /// The physical connection is going away.
    Physical(ReasonCode),
}

/// Side effect the caller must carry out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Write `CloseStream` with this reason to the backend.
    SendClose(ReasonCode),
    /// Tell the owner the stream closed, with this reason.
    NotifyOwner(ReasonCode),
}

/// Result of applying a [`CloseEvent`] to a [`StreamState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Advance { state: StreamState, effect: Effect },
    Remove,
    Ignore,
}

impl StreamState {
    /// The close state machine. Each side's close is observed at most once,
    /// so the owner is notified at most once.
    pub fn on(self, event: CloseEvent) -> Step {
        use CloseEvent::*;
        use StreamState::*;
        match (self, event) {
            (Open, Local(reason)) => Step::Advance {
                state: ClosedByClient,
                effect: Effect::SendClose(reason),
            },
            (Open, Remote(reason)) => Step::Advance {
                state: ClosedByServer,
                effect: Effect::NotifyOwner(reason),
            },
            (Open, Physical(reason)) => Step::Advance {
                state: PhysicalClosed,
                effect: Effect::NotifyOwner(reason),
            },
            (ClosedByClient, Remote(_) | Physical(_)) => Step::Remove,
            (ClosedByServer | PhysicalClosed, Local(_)) => Step::Remove,
            (ClosedByClient, Local(_))
            | (ClosedByServer | PhysicalClosed, Remote(_) | Physical(_)) => Step::Ignore,
        }
    }
}

#[derive(Debug)]
pub struct StreamEntry<O> {
    pub state: StreamState,
    /// Where inbound data and close notifications for the owner go.
    pub owner: O,
}

/// What [`StreamTable::apply`] did.
#[derive(Debug)]
pub enum Applied<O> {
    /// No such stream.
    Missing,
    Ignored,
    Advanced(Effect),
    Removed(StreamEntry<O>),
}

pub struct StreamTable<O> {
    entries: Vec<Option<StreamEntry<O>>>,
    /// Ids below `entries.len()` that are free.
    free: BTreeSet<u16>,
    len: usize,
    max_streams: u16,
}

impl<O> StreamTable<O> {
    /// A table handing out ids `1..=max_streams`.
    pub fn new(max_streams: u16) -> Self {
        Self {
            entries: Vec::new(),
            free: BTreeSet::new(),
            len: 0,
            max_streams,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.max_streams as usize
    }

    /// Allocate the smallest free id and insert an `Open` entry for it.
    ///
    /// Returns `None` when every id is in use.
    pub fn insert(&mut self, owner: O) -> Option<StreamId> {
        let raw = match self.free.pop_first() {
            Some(raw) => raw,
            None if self.entries.len() < self.max_streams as usize => {
                self.entries.push(None);
                self.entries.len() as u16
            }
            None => return None,
        };
        let id = StreamId::new(raw)?;
        self.entries[Self::index(id)] = Some(StreamEntry {
            state: StreamState::Open,
            owner,
        });
        self.len += 1;
        Some(id)
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamEntry<O>> {
        self.entries.get(Self::index(id))?.as_ref()
    }

    pub fn remove(&mut self, id: StreamId) -> Option<StreamEntry<O>> {
        let entry = self.entries.get_mut(Self::index(id))?.take()?;
        self.free.insert(id.get());
        self.len -= 1;
        Some(entry)
    }

    /// Run the close state machine for one stream.
    pub fn apply(&mut self, id: StreamId, event: CloseEvent) -> Applied<O> {
        let Some(entry) = self
            .entries
            .get_mut(Self::index(id))
            .and_then(Option::as_mut)
        else {
            return Applied::Missing;
        };
        match entry.state.on(event) {
            Step::Advance { state, effect } => {
                entry.state = state;
                Applied::Advanced(effect)
            }
            Step::Ignore => Applied::Ignored,
            Step::Remove => match self.remove(id) {
                Some(entry) => Applied::Removed(entry),
                None => Applied::Missing,
            },
        }
    }

    /// Snapshot of the ids in use, ascending.
    pub fn ids(&self) -> Vec<StreamId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .filter_map(|(i, _)| StreamId::new(i as u16 + 1))
            .collect()
    }

    /// Remove every entry, returning them.
    pub fn drain(&mut self) -> Vec<(StreamId, StreamEntry<O>)> {
        let mut out = Vec::with_capacity(self.len);
        for id in self.ids() {
            if let Some(entry) = self.remove(id) {
                out.push((id, entry));
            }
        }
        out
    }

    fn index(id: StreamId) -> usize {
        id.get() as usize - 1
    }
}
