// Strong typing over strings. Newtypes for timestamps, enums for frame and trial tags.
// See DESIGN.md: types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON object as it arrives from researcher config or leaves as a saved payload.
pub type JsonMap = serde_json::Map<String, Value>;

/// Timestamp in microseconds. Newtype for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_micros(us: u64) -> Self {
        Timestamp(us)
    }

    /// Host clocks report fractional milliseconds. Negative input clamps to zero.
    pub fn from_millis(ms: f64) -> Self {
        Timestamp((ms.max(0.0) * 1000.0).round() as u64)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    pub fn as_millis(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn as_secs(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Microseconds elapsed since `earlier`, zero if the clock went backwards.
    pub fn micros_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn plus_micros(&self, us: u64) -> Self {
        Timestamp(self.0.saturating_add(us))
    }
}

/// Which lifecycle side effects a frame triggers when saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    Exit,
    Consent,
    #[default]
    Default,
}

/// Why an infant-controlled trial ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrialEndReason {
    Lookaway,
    ParentEnded,
    Ceiling,
}

impl TrialEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialEndReason::Lookaway => "lookaway",
            TrialEndReason::ParentEnded => "parentEnded",
            TrialEndReason::Ceiling => "ceiling",
        }
    }
}

/// One entry in a frame's append-only event timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// `"<kind>:<eventType>"`.
    pub event_type: String,
    /// Host clock, milliseconds.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_time: Option<f64>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// The slice of the participant's session the engine reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// `"<index>-<frameId>"` to serialized frame payload.
    #[serde(default)]
    pub exp_data: BTreeMap<String, JsonMap>,
    /// Frame ids visited so far, in order.
    #[serde(default)]
    pub sequence: Vec<String>,
    /// Randomizer frame id to the condition object it chose.
    #[serde(default)]
    pub conditions: BTreeMap<String, Value>,
    #[serde(default)]
    pub child: Value,
    /// Most recent first; index 0 is the current session.
    #[serde(default)]
    pub past_sessions: Vec<SessionRecord>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_consent_frame: bool,
}

impl SessionRecord {
    pub fn exp_data_key(index: usize, frame_id: &str) -> String {
        format!("{}-{}", index, frame_id)
    }

    /// Serialized `expData` for researcher callbacks.
    pub fn exp_data_value(&self) -> Value {
        Value::Object(
            self.exp_data
                .iter()
                .map(|(k, v)| (k.clone(), Value::Object(v.clone())))
                .collect(),
        )
    }

    pub fn conditions_value(&self) -> Value {
        Value::Object(
            self.conditions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn past_sessions_value(&self) -> Value {
        serde_json::to_value(&self.past_sessions).unwrap_or(Value::Array(Vec::new()))
    }
}

/// Comparison used when a looping test video decides whether to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum LoopBoundary {
    /// Finish once `times_played >= test_count`.
    #[default]
    Inclusive,
    /// Finish once `times_played > test_count`.
    Exclusive,
}

/// Player configuration passed from JS. Keys are camelCase like the rest of the host JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
    /// Text of the persistent notice shown when a save fails.
    #[serde(default = "default_save_failure_message")]
    pub save_failure_message: String,
    /// How long to wait for the recorder to flush on stop (milliseconds).
    #[serde(default = "default_recorder_stop_timeout")]
    pub recorder_stop_timeout_ms: u64,
    #[serde(default)]
    pub loop_boundary: LoopBoundary,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        PlayerConfig {
            save_failure_message: default_save_failure_message(),
            recorder_stop_timeout_ms: default_recorder_stop_timeout(),
            loop_boundary: LoopBoundary::default(),
        }
    }
}

fn default_save_failure_message() -> String {
    "Your session data could not be saved. Please check your connection; you may continue the study.".to_string()
}

fn default_recorder_stop_timeout() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_conversions() {
        let ts = Timestamp::from_millis(1500.0);
        assert_eq!(ts.as_micros(), 1_500_000);
        assert!((ts.as_secs() - 1.5).abs() < 0.0001);
        assert_eq!(Timestamp::from_millis(-3.0).as_micros(), 0);
    }

    #[test]
    fn micros_since_saturates() {
        let a = Timestamp::from_micros(10);
        let b = Timestamp::from_micros(4);
        assert_eq!(a.micros_since(b), 6);
        assert_eq!(b.micros_since(a), 0);
    }

    #[test]
    fn trial_end_reason_serializes_camel_case() {
        let json = serde_json::to_string(&TrialEndReason::ParentEnded).unwrap();
        assert_eq!(json, "\"parentEnded\"");
        assert_eq!(TrialEndReason::Ceiling.as_str(), "ceiling");
    }

    #[test]
    fn frame_type_tags() {
        let json = serde_json::to_string(&FrameType::Consent).unwrap();
        assert_eq!(json, "\"CONSENT\"");
    }

    #[test]
    fn session_record_from_partial_json() {
        let session: SessionRecord =
            serde_json::from_str(r#"{"sequence":["0-intro"],"child":{"age":14}}"#).unwrap();
        assert_eq!(session.sequence, vec!["0-intro".to_string()]);
        assert!(session.exp_data.is_empty());
        assert!(!session.completed);
    }

    #[test]
    fn player_config_defaults() {
        let config: PlayerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.recorder_stop_timeout_ms, 10_000);
        assert_eq!(config.loop_boundary, LoopBoundary::Inclusive);
    }

    #[test]
    fn player_config_reads_camel_case_keys() {
        let config: PlayerConfig = serde_json::from_str(
            r#"{"saveFailureMessage":"Saving failed","recorderStopTimeoutMs":500,"loopBoundary":"exclusive"}"#,
        )
        .unwrap();
        assert_eq!(config.save_failure_message, "Saving failed");
        assert_eq!(config.recorder_stop_timeout_ms, 500);
        assert_eq!(config.loop_boundary, LoopBoundary::Exclusive);
    }

    #[test]
    fn event_record_flattens_extra_fields() {
        let mut extra = JsonMap::new();
        extra.insert("key".into(), Value::from("p"));
        let record = EventRecord {
            event_type: "exp-lookit-video:lookawayStart".into(),
            timestamp: 12.5,
            stream_time: None,
            extra,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["eventType"], "exp-lookit-video:lookawayStart");
        assert_eq!(value["key"], "p");
        assert!(value.get("streamTime").is_none());
    }
}
