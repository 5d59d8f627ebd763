// Infant-controlled timing: look/lookaway accumulation and threshold-based trial termination.
// Host-driven: the tracker never reads a clock. Every edge carries `now`, and deferred
// decisions are exposed as a deadline the host schedules and reports back via `on_timer`.
// See DESIGN.md: Lookaway/Timing Tracker

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wasm_bindgen::prelude::*;

use crate::error::PlayerError;
use crate::types::{JsonMap, Timestamp, TrialEndReason};

/// How lookaway time is compared against the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LookawayType {
    /// Cumulative lookaway across the control period.
    #[default]
    Total,
    /// A single uninterrupted lookaway.
    Continuous,
}

/// Per-frame parent control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentControlConfig {
    /// Key held down while the child looks away. `"mouse"` uses mouse buttons instead.
    #[serde(default = "default_lookaway_key")]
    pub lookaway_key: String,
    #[serde(default = "default_end_trial_key")]
    pub end_trial_key: String,
    #[serde(default)]
    pub lookaway_type: LookawayType,
    /// Seconds.
    #[serde(default = "default_lookaway_threshold")]
    pub lookaway_threshold: f64,
    /// Seconds of control period after which the trial ends with `ceiling`.
    #[serde(default)]
    pub max_looking_time: Option<f64>,
}

impl Default for ParentControlConfig {
    fn default() -> Self {
        ParentControlConfig {
            lookaway_key: default_lookaway_key(),
            end_trial_key: default_end_trial_key(),
            lookaway_type: LookawayType::default(),
            lookaway_threshold: default_lookaway_threshold(),
            max_looking_time: None,
        }
    }
}

impl ParentControlConfig {
    /// Read `lookawayKey`, `endTrialKey`, ... out of a resolved frame config.
    pub fn from_frame_config(config: &JsonMap) -> Result<Self, PlayerError> {
        serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| PlayerError::InvalidConfig(format!("parent control settings: {}", e)))
    }
}

fn default_lookaway_key() -> String {
    "p".to_string()
}

fn default_end_trial_key() -> String {
    "q".to_string()
}

fn default_lookaway_threshold() -> f64 {
    2.0
}

fn secs_to_micros(secs: f64) -> u64 {
    (secs.max(0.0) * 1_000_000.0).round() as u64
}

/// Raw state of one control window.
#[derive(Debug, Clone, PartialEq)]
pub struct LookawayState {
    pub is_looking: bool,
    pub total_lookaway_us: u64,
    pub control_period_active: bool,
    pub any_look_during_control_period: bool,
    pub trial_start_time: Option<Timestamp>,
    pub trial_end_time: Option<Timestamp>,
    pub trial_end_reason: Option<TrialEndReason>,
    /// Start of the lookaway currently counting toward the total.
    counted_lookaway_start: Option<Timestamp>,
    /// Set by `end_control`; later finalization measures up to here.
    control_ended_at: Option<Timestamp>,
    /// Where looking time is measured from: the window start, or the first look if the
    /// window opened during a lookaway.
    looking_since: Option<Timestamp>,
    total_looking_time: Option<f64>,
}

impl Default for LookawayState {
    fn default() -> Self {
        LookawayState {
            is_looking: true,
            total_lookaway_us: 0,
            control_period_active: false,
            any_look_during_control_period: false,
            trial_start_time: None,
            trial_end_time: None,
            trial_end_reason: None,
            counted_lookaway_start: None,
            control_ended_at: None,
            looking_since: None,
            total_looking_time: None,
        }
    }
}

/// A decision the host must schedule a timer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadline {
    pub due: Timestamp,
    pub reason: TrialEndReason,
}

/// Terminal result of a control window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialOutcome {
    pub reason: TrialEndReason,
    /// Seconds.
    pub total_looking_time: f64,
    pub total_lookaway_ms: f64,
    pub trial_start_ms: f64,
    pub trial_end_ms: f64,
}

/// Timeline entries produced by the tracker, drained into the frame's event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimingEvent {
    LookawayStart,
    LookawayEnd,
    ParentControlStart,
    ParentControlEnd,
    LookawayEndedTrial,
    ParentEndedTrial,
    CeilingEndedTrial,
}

impl TimingEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimingEvent::LookawayStart => "lookawayStart",
            TimingEvent::LookawayEnd => "lookawayEnd",
            TimingEvent::ParentControlStart => "parentControlStart",
            TimingEvent::ParentControlEnd => "parentControlEnd",
            TimingEvent::LookawayEndedTrial => "lookawayEndedTrial",
            TimingEvent::ParentEndedTrial => "parentEndedTrial",
            TimingEvent::CeilingEndedTrial => "ceilingEndedTrial",
        }
    }
}

/// Tracks looking and lookaway for one frame. Not shared between frames.
#[derive(Debug, Clone)]
pub struct LookawayTracker {
    config: ParentControlConfig,
    state: LookawayState,
    pending_lookaway: Option<Deadline>,
    ceiling: Option<Deadline>,
    finalized: bool,
    events: Vec<(TimingEvent, Timestamp)>,
}

impl LookawayTracker {
    pub fn new(config: ParentControlConfig) -> Self {
        LookawayTracker {
            config,
            state: LookawayState::default(),
            pending_lookaway: None,
            ceiling: None,
            finalized: false,
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &ParentControlConfig {
        &self.config
    }

    pub fn state(&self) -> &LookawayState {
        &self.state
    }

    pub fn total_lookaway_ms(&self) -> f64 {
        self.state.total_lookaway_us as f64 / 1000.0
    }

    /// `None` until a window has been finalized. A frame torn down mid-window stays `None`.
    pub fn total_looking_time(&self) -> Option<f64> {
        self.state.total_looking_time
    }

    pub fn trial_end_reason(&self) -> Option<TrialEndReason> {
        self.state.trial_end_reason
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Begin a fresh measurement window. Discards anything accumulated before.
    pub fn start_control(&mut self, now: Timestamp) {
        let is_looking = self.state.is_looking;
        self.state = LookawayState {
            is_looking,
            control_period_active: true,
            any_look_during_control_period: is_looking,
            trial_start_time: Some(now),
            looking_since: is_looking.then_some(now),
            ..LookawayState::default()
        };
        self.pending_lookaway = None;
        self.finalized = false;
        self.ceiling = self.config.max_looking_time.map(|secs| Deadline {
            due: now.plus_micros(secs_to_micros(secs)),
            reason: TrialEndReason::Ceiling,
        });
        self.events.push((TimingEvent::ParentControlStart, now));
        tracing::debug!(is_looking, "parent control started");
    }

    /// Freeze accumulation. Totals stay readable so a racing termination can still finalize.
    pub fn end_control(&mut self, now: Timestamp) {
        if !self.state.control_period_active {
            return;
        }
        self.fold_open_lookaway(now);
        self.state.control_period_active = false;
        self.state.control_ended_at = Some(now);
        self.pending_lookaway = None;
        self.ceiling = None;
        self.events.push((TimingEvent::ParentControlEnd, now));
        tracing::debug!(total_lookaway_ms = self.total_lookaway_ms(), "parent control ended");
    }

    /// Lookaway edge. Returns false when already looking away (key repeat).
    pub fn record_lookaway_start(&mut self, now: Timestamp) -> bool {
        if !self.state.is_looking {
            return false;
        }
        self.state.is_looking = false;
        self.events.push((TimingEvent::LookawayStart, now));

        if self.state.control_period_active && self.state.any_look_during_control_period {
            self.state.counted_lookaway_start = Some(now);
            self.evaluate_lookaway_threshold(now);
        }
        true
    }

    /// Look edge. Returns false when already looking.
    pub fn record_look_start(&mut self, now: Timestamp) -> bool {
        if self.state.is_looking {
            return false;
        }
        self.state.is_looking = true;
        self.events.push((TimingEvent::LookawayEnd, now));

        if self.state.control_period_active {
            self.fold_open_lookaway(now);
            if !self.state.any_look_during_control_period {
                self.state.looking_since = Some(now);
            }
            self.state.any_look_during_control_period = true;
            self.pending_lookaway = None;
        }
        true
    }

    /// Schedule the lookaway decision for a lookaway beginning at `now`.
    pub fn evaluate_lookaway_threshold(&mut self, now: Timestamp) -> Option<Deadline> {
        if !self.state.control_period_active {
            return None;
        }
        let threshold_us = secs_to_micros(self.config.lookaway_threshold);
        let delay_us = match self.config.lookaway_type {
            LookawayType::Continuous => threshold_us,
            LookawayType::Total => threshold_us.saturating_sub(self.state.total_lookaway_us),
        };
        let deadline = Deadline {
            due: now.plus_micros(delay_us),
            reason: TrialEndReason::Lookaway,
        };
        self.pending_lookaway = Some(deadline);
        Some(deadline)
    }

    /// Earliest outstanding deadline the host should set a timer for.
    pub fn pending_deadline(&self) -> Option<Deadline> {
        match (self.pending_lookaway, self.ceiling) {
            (Some(a), Some(b)) => Some(if b.due < a.due { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    /// Host timer fired. Re-checks everything; stale or early timers are no-ops.
    pub fn on_timer(&mut self, now: Timestamp) -> Option<TrialOutcome> {
        if !self.state.control_period_active || self.finalized {
            return None;
        }
        if let Some(ceiling) = self.ceiling {
            if now >= ceiling.due {
                // A late timer still ends the trial at the ceiling itself.
                return self.finalize(TrialEndReason::Ceiling, ceiling.due.min(now));
            }
        }
        match self.pending_lookaway {
            Some(deadline) if now >= deadline.due && !self.state.is_looking => {
                self.finalize(TrialEndReason::Lookaway, now)
            }
            _ => None,
        }
    }

    /// Parent pressed the end-trial key.
    pub fn end_trial(&mut self, now: Timestamp) -> Option<TrialOutcome> {
        if !self.state.control_period_active {
            return None;
        }
        self.finalize(TrialEndReason::ParentEnded, now)
    }

    /// Compute the looking time and lock the end reason. Only the first call per window wins.
    pub fn finalize(&mut self, reason: TrialEndReason, now: Timestamp) -> Option<TrialOutcome> {
        if self.finalized {
            return None;
        }
        let start = self.state.trial_start_time?;
        self.fold_open_lookaway(now);
        let end = self.state.control_ended_at.unwrap_or(now);
        // A window that never saw a look has no looking time.
        let looking_from = self.state.looking_since.unwrap_or(end);
        let looking_us = end
            .micros_since(looking_from)
            .saturating_sub(self.state.total_lookaway_us);
        let total_looking_time = looking_us as f64 / 1_000_000.0;

        self.finalized = true;
        self.state.control_period_active = false;
        self.state.trial_end_time = Some(end);
        self.state.trial_end_reason = Some(reason);
        self.state.total_looking_time = Some(total_looking_time);
        self.pending_lookaway = None;
        self.ceiling = None;

        let event = match reason {
            TrialEndReason::Lookaway => TimingEvent::LookawayEndedTrial,
            TrialEndReason::ParentEnded => TimingEvent::ParentEndedTrial,
            TrialEndReason::Ceiling => TimingEvent::CeilingEndedTrial,
        };
        self.events.push((event, now));
        tracing::debug!(reason = reason.as_str(), total_looking_time, "trial finalized");

        Some(TrialOutcome {
            reason,
            total_looking_time,
            total_lookaway_ms: self.total_lookaway_ms(),
            trial_start_ms: start.as_millis(),
            trial_end_ms: end.as_millis(),
        })
    }

    /// Keyboard edge. Returns an outcome when the key ended the trial.
    pub fn key_down(&mut self, key: &str, now: Timestamp) -> Option<TrialOutcome> {
        if key.eq_ignore_ascii_case(&self.config.lookaway_key) {
            self.record_lookaway_start(now);
            None
        } else if key.eq_ignore_ascii_case(&self.config.end_trial_key) {
            self.end_trial(now)
        } else {
            None
        }
    }

    pub fn key_up(&mut self, key: &str, now: Timestamp) {
        if key.eq_ignore_ascii_case(&self.config.lookaway_key) {
            self.record_look_start(now);
        }
    }

    pub fn mouse_down(&mut self, now: Timestamp) {
        if self.uses_mouse() {
            self.record_lookaway_start(now);
        }
    }

    pub fn mouse_up(&mut self, now: Timestamp) {
        if self.uses_mouse() {
            self.record_look_start(now);
        }
    }

    pub fn drain_events(&mut self) -> Vec<(TimingEvent, Timestamp)> {
        std::mem::take(&mut self.events)
    }

    fn uses_mouse(&self) -> bool {
        self.config.lookaway_key.eq_ignore_ascii_case("mouse")
    }

    fn fold_open_lookaway(&mut self, now: Timestamp) {
        if let Some(start) = self.state.counted_lookaway_start.take() {
            self.state.total_lookaway_us += now.micros_since(start);
        }
    }
}

// =============================================================================
// WASM Bindings
// =============================================================================

/// Serialized timeline entry handed to JS by `WasmLookawayTracker::drain_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingEventJson {
    pub event_type: TimingEvent,
    pub timestamp: f64,
}

/// WASM-exposed lookaway tracker. All times are host milliseconds.
///
/// # Example JSON Config
/// ```json
/// { "lookawayKey": "p", "endTrialKey": "q", "lookawayType": "total", "lookawayThreshold": 2 }
/// ```
#[wasm_bindgen]
pub struct WasmLookawayTracker {
    inner: LookawayTracker,
}

#[wasm_bindgen]
impl WasmLookawayTracker {
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str) -> Result<WasmLookawayTracker, JsValue> {
        let config: ParentControlConfig = serde_json::from_str(config_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid parent control config: {}", e)))?;
        Ok(WasmLookawayTracker {
            inner: LookawayTracker::new(config),
        })
    }

    pub fn start_control(&mut self, now_ms: f64) {
        self.inner.start_control(Timestamp::from_millis(now_ms));
    }

    pub fn end_control(&mut self, now_ms: f64) {
        self.inner.end_control(Timestamp::from_millis(now_ms));
    }

    /// Returns the outcome JSON, or `"null"` when the trial continues.
    pub fn key_down(&mut self, key: &str, now_ms: f64) -> Result<String, JsValue> {
        let outcome = self.inner.key_down(key, Timestamp::from_millis(now_ms));
        to_json(&outcome)
    }

    pub fn key_up(&mut self, key: &str, now_ms: f64) {
        self.inner.key_up(key, Timestamp::from_millis(now_ms));
    }

    pub fn mouse_down(&mut self, now_ms: f64) {
        self.inner.mouse_down(Timestamp::from_millis(now_ms));
    }

    pub fn mouse_up(&mut self, now_ms: f64) {
        self.inner.mouse_up(Timestamp::from_millis(now_ms));
    }

    /// When the host should call `on_timer` next, in milliseconds.
    pub fn pending_deadline_ms(&self) -> Option<f64> {
        self.inner.pending_deadline().map(|d| d.due.as_millis())
    }

    pub fn on_timer(&mut self, now_ms: f64) -> Result<String, JsValue> {
        let outcome = self.inner.on_timer(Timestamp::from_millis(now_ms));
        to_json(&outcome)
    }

    pub fn total_looking_time(&self) -> Option<f64> {
        self.inner.total_looking_time()
    }

    pub fn drain_events(&mut self) -> Result<String, JsValue> {
        let events: Vec<TimingEventJson> = self
            .inner
            .drain_events()
            .into_iter()
            .map(|(event_type, ts)| TimingEventJson {
                event_type,
                timestamp: ts.as_millis(),
            })
            .collect();
        to_json(&events)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, JsValue> {
    serde_json::to_string(value)
        .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}
