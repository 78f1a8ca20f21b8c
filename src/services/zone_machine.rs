//! Per-track last-zone state and the transitions it produces

use crate::domain::types::{TrackId, ZoneId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneTransition {
    Exit(ZoneId),
    Enter(ZoneId),
}

#[derive(Debug, Default)]
pub struct ZoneMachine {
    last_zone: FxHashMap<TrackId, ZoneId>,
}

impl ZoneMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the zone a track is in now; a move between two zones yields
    /// the exit strictly before the enter.
    pub fn observe(&mut self, track: TrackId, zone: Option<ZoneId>) -> SmallVec<[ZoneTransition; 2]> {
        let mut out = SmallVec::new();
        let previous = match zone {
            Some(z) => self.last_zone.insert(track, z),
            None => self.last_zone.remove(&track),
        };
        if previous == zone {
            return out;
        }
        if let Some(prev) = previous {
            out.push(ZoneTransition::Exit(prev));
        }
        if let Some(next) = zone {
            out.push(ZoneTransition::Enter(next));
        }
        out
    }

    pub fn current(&self, track: TrackId) -> Option<ZoneId> {
        self.last_zone.get(&track).copied()
    }

    /// Drop a track without producing an exit
    pub fn forget(&mut self, track: TrackId) -> Option<ZoneId> {
        self.last_zone.remove(&track)
    }

    pub fn len(&self) -> usize {
        self.last_zone.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_zone.is_empty()
    }
}
