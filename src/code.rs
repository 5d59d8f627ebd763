// Researcher-supplied logic as injected capabilities.
// The host compiles source text; the engine only sees callables with fixed argument contracts.
// See DESIGN.md: researcher code

use serde_json::Value;

use crate::error::PlayerError;
use crate::types::SessionRecord;

/// Session snapshot handed to researcher callbacks. Plain JSON, no live references.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionView {
    pub exp_data: Value,
    pub sequence: Value,
    pub child: Value,
    pub past_sessions: Value,
    pub conditions: Value,
}

impl SessionView {
    pub fn from_session(session: &SessionRecord) -> Self {
        SessionView {
            exp_data: session.exp_data_value(),
            sequence: Value::from(session.sequence.clone()),
            child: session.child.clone(),
            past_sessions: session.past_sessions_value(),
            conditions: session.conditions_value(),
        }
    }
}

/// Arguments of `selectNextFrame`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectArgs {
    pub frames: Value,
    pub frame_index: usize,
    pub frame_data: Value,
    pub session: SessionView,
}

/// `generateProperties(expData, sequence, child, pastSessions, conditions)`.
/// Must return a JSON object. `Err` carries the thrown message.
pub trait GenerateProperties {
    fn call(&self, args: &SessionView) -> Result<Value, String>;
}

/// `selectNextFrame(frames, frameIndex, frameData, expData, sequence, child, pastSessions)`.
/// Must return a frame index.
pub trait SelectNextFrame {
    fn call(&self, args: &SelectArgs) -> Result<Value, String>;
}

impl<F> GenerateProperties for F
where
    F: Fn(&SessionView) -> Result<Value, String>,
{
    fn call(&self, args: &SessionView) -> Result<Value, String> {
        self(args)
    }
}

impl<F> SelectNextFrame for F
where
    F: Fn(&SelectArgs) -> Result<Value, String>,
{
    fn call(&self, args: &SelectArgs) -> Result<Value, String> {
        self(args)
    }
}

/// Turns source strings into callables. Compile failures are configuration errors.
pub trait CodeEvaluator {
    fn compile_generate(&self, source: &str) -> Result<Box<dyn GenerateProperties>, String>;
    fn compile_select(&self, source: &str) -> Result<Box<dyn SelectNextFrame>, String>;
}

/// Evaluator for hosts that do not allow researcher code. Any source string is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvaluator;

impl CodeEvaluator for NoEvaluator {
    fn compile_generate(&self, _source: &str) -> Result<Box<dyn GenerateProperties>, String> {
        Err("researcher code is not enabled in this player".to_string())
    }

    fn compile_select(&self, _source: &str) -> Result<Box<dyn SelectNextFrame>, String> {
        Err("researcher code is not enabled in this player".to_string())
    }
}

/// Compile `generateProperties` if the frame declares one.
pub fn compile_generate(
    evaluator: &dyn CodeEvaluator,
    kind: &str,
    source: Option<&str>,
) -> Result<Option<Box<dyn GenerateProperties>>, PlayerError> {
    match source {
        None => Ok(None),
        Some(src) => evaluator.compile_generate(src).map(Some).map_err(|e| {
            tracing::error!(kind, error = %e, "generateProperties failed to compile");
            PlayerError::configuration(kind, format!("generateProperties failed to compile: {}", e))
        }),
    }
}

pub fn compile_select(
    evaluator: &dyn CodeEvaluator,
    kind: &str,
    source: Option<&str>,
) -> Result<Option<Box<dyn SelectNextFrame>>, PlayerError> {
    match source {
        None => Ok(None),
        Some(src) => evaluator.compile_select(src).map(Some).map_err(|e| {
            tracing::error!(kind, error = %e, "selectNextFrame failed to compile");
            PlayerError::configuration(kind, format!("selectNextFrame failed to compile: {}", e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn closures_are_generators() {
        let generate = |args: &SessionView| -> Result<Value, String> {
            Ok(json!({ "sequenceLength": args.sequence.as_array().map(|s| s.len()) }))
        };
        let view = SessionView {
            sequence: json!(["0-a", "1-b"]),
            ..SessionView::default()
        };
        assert_eq!(generate.call(&view).unwrap(), json!({ "sequenceLength": 2 }));
    }

    #[test]
    fn view_copies_session_fields() {
        let mut session = SessionRecord::default();
        session.sequence.push("0-intro".into());
        session.child = json!({ "ageInDays": 300 });
        session.conditions.insert("2-rand".into(), json!({ "set": 1 }));

        let view = SessionView::from_session(&session);
        assert_eq!(view.sequence, json!(["0-intro"]));
        assert_eq!(view.child["ageInDays"], 300);
        assert_eq!(view.conditions["2-rand"]["set"], 1);
        assert_eq!(view.past_sessions, json!([]));
    }

    #[test]
    fn no_evaluator_makes_source_a_configuration_error() {
        let err = match compile_select(&NoEvaluator, "exp-lookit-text", Some("function(){}")) {
            Err(err) => err,
            Ok(_) => panic!("expected a configuration error"),
        };
        assert!(matches!(err, PlayerError::Configuration { .. }));
        assert!(compile_generate(&NoEvaluator, "exp-lookit-text", None).unwrap().is_none());
    }
}
