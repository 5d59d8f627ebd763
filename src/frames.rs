// Frame compositions. An infant-controlled frame is a lifecycle controller plus a lookaway tracker,
// with the tracker's timeline and outcome flowing into the controller's payload.
// See DESIGN.md: frames

use serde_json::Value;

use crate::collaborators::Capabilities;
use crate::error::PlayerError;
use crate::lifecycle::FrameController;
use crate::timing::{LookawayTracker, ParentControlConfig, TrialOutcome};
use crate::types::{JsonMap, SessionRecord, Timestamp};

/// A frame whose trial length is decided by the parent's lookaway input.
pub struct InfantControlledFrame {
    controller: FrameController,
    tracker: LookawayTracker,
}

impl InfantControlledFrame {
    /// Wrap an attached controller; tracker settings come from its resolved config.
    pub fn new(mut controller: FrameController) -> Result<Self, PlayerError> {
        let config = ParentControlConfig::from_frame_config(controller.config())?;
        controller.declare(Capabilities {
            parent_control: true,
            ..Capabilities::default()
        });
        Ok(InfantControlledFrame {
            controller,
            tracker: LookawayTracker::new(config),
        })
    }

    pub fn controller(&self) -> &FrameController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut FrameController {
        &mut self.controller
    }

    pub fn tracker(&self) -> &LookawayTracker {
        &self.tracker
    }

    /// Attach the controller; a clean visit also rebuilds the tracker from the new config.
    pub fn attach(&mut self, index: usize, session: &SessionRecord, now: Timestamp) -> Result<bool, PlayerError> {
        let configured = self.controller.on_attach(index, session, now)?;
        if configured {
            let config = ParentControlConfig::from_frame_config(self.controller.config())?;
            self.tracker = LookawayTracker::new(config);
        }
        Ok(configured)
    }

    pub fn start_parent_control(&mut self, now: Timestamp) {
        self.tracker.start_control(now);
        self.sync(None);
    }

    pub fn end_parent_control(&mut self, now: Timestamp) {
        self.tracker.end_control(now);
        self.sync(None);
    }

    pub fn key_down(&mut self, key: &str, now: Timestamp) -> Option<TrialOutcome> {
        let outcome = self.tracker.key_down(key, now);
        self.sync(outcome)
    }

    pub fn key_up(&mut self, key: &str, now: Timestamp) {
        self.tracker.key_up(key, now);
        self.sync(None);
    }

    pub fn mouse_down(&mut self, now: Timestamp) {
        self.tracker.mouse_down(now);
        self.sync(None);
    }

    pub fn mouse_up(&mut self, now: Timestamp) {
        self.tracker.mouse_up(now);
        self.sync(None);
    }

    pub fn on_timer(&mut self, now: Timestamp) -> Option<TrialOutcome> {
        let outcome = self.tracker.on_timer(now);
        self.sync(outcome)
    }

    /// Move tracker events into the timeline and record a terminal outcome as frame data.
    fn sync(&mut self, outcome: Option<TrialOutcome>) -> Option<TrialOutcome> {
        for (event, at) in self.tracker.drain_events() {
            self.controller.record_event(event.as_str(), JsonMap::new(), at);
        }
        if let Some(outcome) = outcome {
            self.controller
                .set_data("totalLookingTime", Value::from(outcome.total_looking_time));
            self.controller
                .set_data("trialEndReason", Value::from(outcome.reason.as_str()));
            self.controller
                .set_data("totalLookawayMs", Value::from(outcome.total_lookaway_ms));
        }
        outcome
    }
}
