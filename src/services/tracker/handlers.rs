//! Event handlers for the Tracker
//!
//! Each handler processes one kind of event, updating per-track state and
//! mirroring every cart, identity and status change to the backend.

use super::Tracker;
use crate::domain::session::{Identity, InvoiceOutcome};
use crate::domain::types::{
    CodeRead, ControlCommand, Labels, PerceptionFrame, SessionStatus, TrackId, ZoneId,
};
use crate::services::baseline::{CaptureOutcome, DiffOutcome, EnterOutcome, ExitOutcome};
use crate::services::identity::LinkOutcome;
use crate::services::zone_machine::ZoneTransition;
use rustc_hash::FxHashSet;
use std::time::Instant;
use tracing::{debug, info, warn};

impl Tracker {
    /// Handle one perception frame
    ///
    /// Order within a frame: zone transitions per observed track, then code
    /// reads, then departures of tracks missing from the frame.
    pub(crate) fn handle_frame(&mut self, frame: PerceptionFrame, received_at: Instant) {
        let mut seen: FxHashSet<TrackId> = FxHashSet::default();
        let link_zone = self.config.link_zone();

        for obs in &frame.tracks {
            let track = obs.track_id();
            if !seen.insert(track) {
                continue;
            }
            if self.departing.contains(&track) {
                debug!(track_id = %track, "departing_track_ignored");
                continue;
            }
            if self.settlement.is_in_flight(track) {
                debug!(track_id = %track, "settling_track_ignored");
                continue;
            }
            if self.presence.insert(track, 0).is_none() {
                debug!(track_id = %track, "track_created");
            }

            let position = obs.position();
            let zone = self.zones.resolve(position);
            for transition in self.zone_machine.observe(track, zone) {
                match transition {
                    ZoneTransition::Exit(z) => self.on_zone_exit(track, z),
                    ZoneTransition::Enter(z) => self.on_zone_enter(track, z),
                }
            }

            let in_link_zone = link_zone.is_some_and(|r| r.contains(&position));
            self.identities.set_in_link_zone(track, in_link_zone);
        }

        for code in &frame.codes {
            self.handle_code_read(code);
        }

        let threshold = self.config.departure_after_frames();
        let mut departed: Vec<TrackId> = Vec::new();
        for (track, missed) in self.presence.iter_mut() {
            if seen.contains(track) {
                continue;
            }
            *missed += 1;
            if *missed >= threshold {
                departed.push(*track);
            }
        }
        departed.sort_unstable();
        for track in departed {
            self.handle_departure(track);
        }

        debug!(
            ts = %frame.ts,
            tracks = %frame.tracks.len(),
            codes = %frame.codes.len(),
            lag_us = %received_at.elapsed().as_micros(),
            "frame_processed"
        );
    }

    fn on_zone_enter(&mut self, track: TrackId, zone: ZoneId) {
        self.metrics.record_zone_enter();
        let name = self.zones.name(zone).to_string();
        match self.baselines.enter((track, zone), &name) {
            EnterOutcome::Capturing { generation } => {
                info!(track_id = %track, zone = %name, generation = %generation, "zone_enter");
            }
            EnterOutcome::CarriedOver { generation } => {
                self.metrics.record_diff_superseded();
                info!(track_id = %track, zone = %name, generation = %generation, "zone_reenter_carry_over");
            }
            EnterOutcome::Resumed { generation } => {
                info!(track_id = %track, zone = %name, generation = %generation, "zone_reenter_capturing");
            }
        }
        self.egress.post_event(format!("track {track}: entered {name}"));
    }

    fn on_zone_exit(&mut self, track: TrackId, zone: ZoneId) {
        self.metrics.record_zone_exit();
        let name = self.zones.name(zone).to_string();
        match self.baselines.exit((track, zone)) {
            ExitOutcome::DiffScheduled { generation } => {
                info!(
                    track_id = %track,
                    zone = %name,
                    generation = %generation,
                    delay_ms = %self.config.settle_delay().as_millis(),
                    "zone_exit"
                );
            }
            ExitOutcome::AwaitingBaseline { generation } => {
                info!(track_id = %track, zone = %name, generation = %generation, "zone_exit_awaiting_baseline");
            }
            ExitOutcome::NoBaseline => {
                self.metrics.record_diff_skipped();
                info!(track_id = %track, zone = %name, reason = "no_baseline", "diff_skipped");
            }
        }
        self.egress.post_event(format!("track {track}: left {name}"));
    }

    pub(crate) fn handle_baseline_captured(
        &mut self,
        track: TrackId,
        zone: ZoneId,
        generation: u64,
        labels: Option<Labels>,
    ) {
        let items = labels.as_ref().map_or(0, Vec::len);
        let name = self.zones.name(zone);
        match self.baselines.on_baseline_captured(generation, labels) {
            CaptureOutcome::Ready { .. } => {
                self.metrics.record_baseline_captured();
                info!(track_id = %track, zone = %name, items = %items, "baseline_captured");
            }
            CaptureOutcome::DiffScheduled { .. } => {
                self.metrics.record_baseline_captured();
                info!(track_id = %track, zone = %name, items = %items, "baseline_captured_after_exit");
            }
            CaptureOutcome::Failed { .. } => {
                self.metrics.record_detection_unavailable();
                warn!(track_id = %track, zone = %name, "baseline_dropped");
                self.settle_if_deferred(track);
            }
            CaptureOutcome::Stale => {
                debug!(track_id = %track, generation = %generation, "baseline_stale");
            }
        }
    }

    pub(crate) fn handle_diff_captured(&mut self, generation: u64, labels: Option<Labels>) {
        let Some(DiffOutcome { key: (track, zone), diff }) =
            self.baselines.on_diff_captured(generation, labels)
        else {
            self.metrics.record_diff_superseded();
            debug!(generation = %generation, "diff_superseded");
            return;
        };
        let name = self.zones.name(zone).to_string();

        match diff {
            None => {
                self.metrics.record_detection_unavailable();
                self.metrics.record_diff_skipped();
                warn!(track_id = %track, zone = %name, reason = "detection_unavailable", "diff_skipped");
            }
            Some(diff) => {
                self.metrics.record_diff_applied();
                info!(
                    track_id = %track,
                    zone = %name,
                    missing = %diff.missing_count(),
                    returned = %diff.returned_count(),
                    "diff_applied"
                );
                for change in self.ledger.apply_diff(track, &diff) {
                    self.publish_session(track);
                    self.egress.post_event(format!("track {track}: {}", change.describe()));
                }
            }
        }

        self.settle_if_deferred(track);
    }

    fn handle_code_read(&mut self, code: &CodeRead) {
        let Some(identity) = Identity::from_code(&code.text) else {
            debug!("code_read_empty");
            return;
        };

        let targets = self.identities.link_targets();
        let mut linked = 0;
        for track in targets {
            if !self.presence.contains_key(&track) {
                continue;
            }
            linked += 1;
            match self.identities.link(track, identity.clone()) {
                LinkOutcome::Unchanged => {
                    debug!(track_id = %track, identity = %identity.external_id, "identity_unchanged");
                }
                LinkOutcome::Linked { previous } => {
                    self.metrics.record_identity_link();
                    info!(
                        track_id = %track,
                        identity = %identity.external_id,
                        previous = ?previous.as_ref().map(|p| p.external_id.as_str()),
                        "identity_linked"
                    );
                    self.publish_session(track);
                    self.egress
                        .post_event(format!("track {track}: linked to {}", identity.display_name));
                }
            }
        }

        if linked == 0 {
            debug!(identity = %identity.external_id, "code_read_unclaimed");
        }
    }

    pub(crate) fn handle_control(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Select { select } => {
                let track = select.map(TrackId);
                let previous = self.identities.select(track);
                info!(
                    selected = ?track.map(|t| t.0),
                    previous = ?previous.map(|t| t.0),
                    "track_selected"
                );
            }
        }
    }

    /// A track disappeared: drop its live state and settle it, or defer the
    /// settlement until its outstanding diffs resolve
    fn handle_departure(&mut self, track: TrackId) {
        self.presence.remove(&track);
        let zone = self.zone_machine.forget(track);
        let discarded = self.baselines.discard_open(track);
        self.identities.set_in_link_zone(track, false);
        if self.identities.clear_selection_if(track) {
            info!(track_id = %track, "selection_cleared");
        }
        info!(
            track_id = %track,
            zone = ?zone.map(|z| self.zones.name(z)),
            baselines_discarded = %discarded,
            "track_departed"
        );

        if self.baselines.has_pending(track) {
            self.departing.insert(track);
            info!(track_id = %track, "settlement_deferred");
            return;
        }
        self.settle(track);
    }

    fn settle_if_deferred(&mut self, track: TrackId) {
        if self.departing.contains(&track) && !self.baselines.has_pending(track) {
            self.settle(track);
        }
    }

    fn settle(&mut self, track: TrackId) {
        self.departing.remove(&track);
        let identity = self.identities.remove(track);
        self.settlement.settle(track, identity, &mut self.ledger);
    }

    pub(crate) fn handle_invoice_settled(&mut self, track: TrackId, outcome: InvoiceOutcome) {
        self.settlement.complete(track, outcome, &mut self.ledger);
    }

    /// Mirror the track's full session state to the backend
    fn publish_session(&self, track: TrackId) {
        let customer = self
            .identities
            .lookup(track)
            .map(|i| (i.external_id.as_str(), i.display_name.as_str()));
        let cart = self.ledger.snapshot(track);
        self.egress.publish_session(track, &cart, SessionStatus::Processing, customer);
    }
}
