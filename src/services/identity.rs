//! Track → identity links, the operator selection and link-zone membership

use crate::domain::session::Identity;
use crate::domain::types::TrackId;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// New or changed link; carries whatever it replaced
    Linked { previous: Option<Identity> },
    /// Same identity already linked
    Unchanged,
}

#[derive(Debug, Default)]
pub struct IdentityRegistry {
    links: FxHashMap<TrackId, Identity>,
    /// Track currently chosen by the operator; receives every code read
    selected: Option<TrackId>,
    /// Tracks standing inside the auto-link zone
    in_link_zone: FxHashSet<TrackId>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins
    pub fn link(&mut self, track: TrackId, identity: Identity) -> LinkOutcome {
        if self.links.get(&track) == Some(&identity) {
            return LinkOutcome::Unchanged;
        }
        LinkOutcome::Linked { previous: self.links.insert(track, identity) }
    }

    pub fn lookup(&self, track: TrackId) -> Option<&Identity> {
        self.links.get(&track)
    }

    pub fn remove(&mut self, track: TrackId) -> Option<Identity> {
        self.in_link_zone.remove(&track);
        self.links.remove(&track)
    }

    /// Replace the operator selection, returning the old one
    pub fn select(&mut self, track: Option<TrackId>) -> Option<TrackId> {
        std::mem::replace(&mut self.selected, track)
    }

    pub fn selected(&self) -> Option<TrackId> {
        self.selected
    }

    /// Clear the selection if it points at `track`
    pub fn clear_selection_if(&mut self, track: TrackId) -> bool {
        if self.selected == Some(track) {
            self.selected = None;
            return true;
        }
        false
    }

    pub fn set_in_link_zone(&mut self, track: TrackId, inside: bool) {
        if inside {
            self.in_link_zone.insert(track);
        } else {
            self.in_link_zone.remove(&track);
        }
    }

    /// Tracks that should receive a code read: the selection first, then
    /// link-zone tracks in ascending id order
    pub fn link_targets(&self) -> SmallVec<[TrackId; 4]> {
        let mut zone: SmallVec<[TrackId; 4]> =
            self.in_link_zone.iter().copied().filter(|t| Some(*t) != self.selected).collect();
        zone.sort_unstable();

        let mut out = SmallVec::new();
        out.extend(self.selected);
        out.extend(zone);
        out
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
