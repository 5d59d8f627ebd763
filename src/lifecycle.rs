// Frame lifecycle: configure on clean visits, record events, serialize, save, and pick the next frame.
// Saves are fire-and-forget: navigation never waits on the network.
// See DESIGN.md: Frame Lifecycle Controller

use serde_json::Value;

use crate::code::{self, SelectArgs, SelectNextFrame, SessionView};
use crate::collaborators::{Capabilities, FrameContext, FrameTransition};
use crate::error::{PlayerError, ValidationIssue};
use crate::recording::RecordingSession;
use crate::resolver::{self, FrameSchema};
use crate::types::{EventRecord, FrameType, JsonMap, SessionRecord, Timestamp};

/// Where a frame is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Configuring,
    Active,
    Saving,
    Advancing,
    Destroyed,
}

/// Per-kind hooks. Everything has a default so plain frames implement nothing.
pub trait FrameBehavior {
    /// Called when returning to a frame that already has a saved payload.
    fn load_data(&mut self, _payload: &JsonMap) {}

    /// Frame-specific data values to include in the payload.
    fn data(&self) -> JsonMap {
        JsonMap::new()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

/// A frame kind with no hooks of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFrame {
    pub capabilities: Capabilities,
}

impl FrameBehavior for PlainFrame {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

/// Drives one frame component from attach to hand-off.
pub struct FrameController {
    schema: FrameSchema,
    frame_config: JsonMap,
    behavior: Box<dyn FrameBehavior>,
    ctx: FrameContext,
    extra_capabilities: Capabilities,

    state: LifecycleState,
    id: String,
    index: usize,
    last_index: Option<usize>,
    config: JsonMap,
    generated_properties: Option<JsonMap>,
    data: JsonMap,
    event_timings: Vec<EventRecord>,
    start_timestamp: Option<Timestamp>,
    select_next: Option<Box<dyn SelectNextFrame>>,
    recording: Option<RecordingSession>,
    issues: Vec<ValidationIssue>,
}

impl FrameController {
    pub fn new(
        schema: FrameSchema,
        frame_config: JsonMap,
        behavior: Box<dyn FrameBehavior>,
        ctx: FrameContext,
    ) -> Self {
        FrameController {
            schema,
            frame_config,
            behavior,
            ctx,
            extra_capabilities: Capabilities::default(),
            state: LifecycleState::Uninitialized,
            id: String::new(),
            index: 0,
            last_index: None,
            config: JsonMap::new(),
            generated_properties: None,
            data: JsonMap::new(),
            event_timings: Vec::new(),
            start_timestamp: None,
            select_next: None,
            recording: None,
            issues: Vec::new(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.schema.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn frame_type(&self) -> FrameType {
        self.schema.frame_type
    }

    pub fn config(&self) -> &JsonMap {
        &self.config
    }

    pub fn generated_properties(&self) -> Option<&JsonMap> {
        self.generated_properties.as_ref()
    }

    pub fn event_timings(&self) -> &[EventRecord] {
        &self.event_timings
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn recording(&self) -> Option<&RecordingSession> {
        self.recording.as_ref()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.behavior.capabilities().union(self.extra_capabilities)
    }

    /// Add capabilities on top of what the behavior declares (composition wrappers use this).
    pub fn declare(&mut self, capabilities: Capabilities) {
        self.extra_capabilities = self.extra_capabilities.union(capabilities);
    }

    /// Set a frame data value to be saved.
    pub fn set_data(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    /// Replace the researcher JSON (e.g. host re-render with new attributes).
    pub fn set_frame_config(&mut self, frame_config: JsonMap) {
        self.frame_config = frame_config;
    }

    /// Render at `index`. Reconfigures only when the index changed; returns whether it did.
    pub fn on_attach(
        &mut self,
        index: usize,
        session: &SessionRecord,
        now: Timestamp,
    ) -> Result<bool, PlayerError> {
        if self.state == LifecycleState::Destroyed {
            return Err(PlayerError::InvalidConfig(format!(
                "frame {} attached after it was destroyed",
                self.id
            )));
        }
        if self.last_index == Some(index) {
            self.rerender()?;
            return Ok(false);
        }

        self.state = LifecycleState::Configuring;
        self.index = index;
        self.id = match self.frame_config.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => format!("{}-{}", self.schema.kind, index),
        };

        let generator = code::compile_generate(
            self.ctx.evaluator.as_ref(),
            &self.schema.kind,
            self.frame_config.get("generateProperties").and_then(Value::as_str),
        )?;
        let view = SessionView::from_session(session);
        let resolution = resolver::resolve(
            &self.schema,
            &self.frame_config,
            true,
            None,
            generator.as_deref().map(|g| (g, &view)),
        )?;

        self.select_next = code::compile_select(
            self.ctx.evaluator.as_ref(),
            &self.schema.kind,
            resolution.config.get("selectNextFrame").and_then(Value::as_str),
        )?;
        self.config = resolution.config;
        self.generated_properties = resolution.generated_properties;
        self.issues = resolution.issues;
        self.data = JsonMap::new();
        self.event_timings = Vec::new();
        self.start_timestamp = Some(now);
        self.recording = match (&self.ctx.recorder, self.capabilities().recording) {
            (Some(recorder), true) => Some(RecordingSession::new(
                recorder.clone(),
                self.ctx.config.recorder_stop_timeout_ms,
            )),
            _ => None,
        };

        let key = SessionRecord::exp_data_key(index, &self.id);
        if let Some(payload) = session.exp_data.get(&key) {
            tracing::debug!(frame_id = %self.id, "returning to saved frame");
            self.behavior.load_data(payload);
        }

        self.last_index = Some(index);
        self.state = LifecycleState::Active;
        tracing::debug!(frame_id = %self.id, kind = %self.schema.kind, index, "frame configured");
        Ok(true)
    }

    /// Same-index render: carry values over, keep the event timeline.
    fn rerender(&mut self) -> Result<(), PlayerError> {
        let mut resolution =
            resolver::resolve(&self.schema, &self.frame_config, false, Some(&self.config), None)?;
        if let Some(generated) = &self.generated_properties {
            for (key, value) in generated {
                resolution.config.insert(key.clone(), value.clone());
            }
        }
        self.config = resolution.config;
        self.issues = resolution.issues;
        Ok(())
    }

    /// Append to the timeline. Entries are never reordered or removed.
    pub fn record_event(&mut self, event_type: &str, extra: JsonMap, at: Timestamp) {
        let stream_time = self.recording.as_ref().and_then(RecordingSession::time);
        self.event_timings.push(EventRecord {
            event_type: format!("{}:{}", self.schema.kind, event_type),
            timestamp: at.as_millis(),
            stream_time,
            extra,
        });
    }

    /// The payload saved for this visit.
    pub fn serialize(&self, now: Timestamp) -> JsonMap {
        let mut payload = JsonMap::new();
        let behavior_data = self.behavior.data();

        for name in &self.schema.data {
            let value = self
                .data
                .get(name)
                .or_else(|| behavior_data.get(name))
                .or_else(|| self.config.get(name))
                .cloned()
                .unwrap_or(Value::Null);
            payload.insert(name.clone(), value);
        }
        for (key, value) in behavior_data.iter().chain(self.data.iter()) {
            payload.insert(key.clone(), value.clone());
        }

        payload.insert(
            "generatedProperties".into(),
            self.generated_properties
                .clone()
                .map(Value::Object)
                .unwrap_or(Value::Null),
        );
        payload.insert(
            "eventTimings".into(),
            serde_json::to_value(&self.event_timings).unwrap_or(Value::Array(Vec::new())),
        );
        payload.insert(
            "frameType".into(),
            serde_json::to_value(self.schema.frame_type).unwrap_or(Value::Null),
        );
        let frame_duration = self
            .start_timestamp
            .map(|start| Value::from(now.micros_since(start) as f64 / 1_000_000.0))
            .unwrap_or(Value::Null);
        payload.insert("frameDuration".into(), frame_duration);
        payload
    }

    /// Write the payload into the session and hand it to persistence without waiting.
    pub fn save(&mut self, session: &mut SessionRecord, now: Timestamp) -> JsonMap {
        self.state = LifecycleState::Saving;
        let payload = self.serialize(now);

        session
            .exp_data
            .insert(SessionRecord::exp_data_key(self.index, &self.id), payload.clone());
        if session.sequence.last() != Some(&self.id) {
            session.sequence.push(self.id.clone());
        }
        match self.schema.frame_type {
            FrameType::Exit => session.completed = true,
            FrameType::Consent => session.completed_consent_frame = true,
            FrameType::Default => {}
        }

        let pending = self.ctx.persistence.save(&self.id, payload.clone());
        let notifier = self.ctx.notifier.clone();
        let message = self.ctx.config.save_failure_message.clone();
        let frame_id = self.id.clone();
        self.ctx.spawner.spawn_local(Box::pin(async move {
            if let Err(e) = pending.await {
                tracing::warn!(frame_id = %frame_id, error = %e, "frame save failed");
                notifier.persistent_warning(&message);
            }
        }));

        self.state = LifecycleState::Active;
        payload
    }

    /// Save, then choose the next frame index. Does not wait for the save.
    pub fn advance(
        &mut self,
        frames: &Value,
        session: &mut SessionRecord,
        now: Timestamp,
    ) -> Result<usize, PlayerError> {
        let payload = self.save(session, now);
        self.state = LifecycleState::Advancing;

        let next = match &self.select_next {
            Some(select) => {
                let args = SelectArgs {
                    frames: frames.clone(),
                    frame_index: self.index,
                    frame_data: Value::Object(payload),
                    session: SessionView::from_session(session),
                };
                let result = select.call(&args).map_err(|e| {
                    PlayerError::configuration(&self.schema.kind, format!("selectNextFrame threw: {}", e))
                })?;
                frame_index_from(&result).ok_or_else(|| {
                    tracing::error!(kind = %self.schema.kind, %result, "selectNextFrame returned a non-index");
                    PlayerError::configuration(
                        &self.schema.kind,
                        format!("selectNextFrame must return a frame index, got {}", result),
                    )
                })?
            }
            None => self.index + 1,
        };

        self.emit_transition(next);
        Ok(next)
    }

    /// Save and step back one frame.
    pub fn retreat(&mut self, session: &mut SessionRecord, now: Timestamp) -> usize {
        self.save(session, now);
        self.state = LifecycleState::Advancing;
        let previous = self.index.saturating_sub(1);
        self.emit_transition(previous);
        previous
    }

    pub fn destroy(&mut self) {
        if self.state != LifecycleState::Destroyed {
            tracing::debug!(frame_id = %self.id, "frame destroyed");
        }
        self.state = LifecycleState::Destroyed;
        self.select_next = None;
    }

    fn emit_transition(&self, to_index: usize) {
        if let Some(listener) = &self.ctx.transitions {
            listener.on_transition(&FrameTransition {
                from_id: self.id.clone(),
                from_index: self.index,
                to_index,
                leaving: self.capabilities(),
            });
        }
    }
}

/// JS numbers arrive as floats; accept any non-negative integral value.
fn frame_index_from(value: &Value) -> Option<usize> {
    if let Some(n) = value.as_u64() {
        return usize::try_from(n).ok();
    }
    let f = value.as_f64()?;
    if f.is_finite() && f >= 0.0 && f.fract() == 0.0 {
        Some(f as usize)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::code::{CodeEvaluator, GenerateProperties, SelectNextFrame};
    use crate::collaborators::{Notifier, Persistence, Spawner, TransitionListener};
    use crate::types::PlayerConfig;
    use futures::executor::LocalPool;
    use futures::future::{self, LocalBoxFuture};
    use futures::FutureExt;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Copy, PartialEq, Eq)]
    pub enum SaveMode {
        Succeed,
        Fail,
        Hang,
    }

    pub struct MockPersistence {
        pub mode: SaveMode,
        pub saved: RefCell<Vec<(String, JsonMap)>>,
    }

    impl Persistence for MockPersistence {
        fn save(&self, frame_id: &str, payload: JsonMap) -> LocalBoxFuture<'static, Result<(), PlayerError>> {
            self.saved.borrow_mut().push((frame_id.to_string(), payload));
            match self.mode {
                SaveMode::Succeed => future::ready(Ok(())).boxed_local(),
                SaveMode::Fail => {
                    future::ready(Err(PlayerError::Persistence("503".into()))).boxed_local()
                }
                SaveMode::Hang => future::pending().boxed_local(),
            }
        }
    }

    #[derive(Default)]
    pub struct MockNotifier {
        pub warnings: RefCell<Vec<String>>,
    }

    impl Notifier for MockNotifier {
        fn persistent_warning(&self, message: &str) {
            self.warnings.borrow_mut().push(message.to_string());
        }
    }

    #[derive(Default)]
    pub struct MockTransitions {
        pub seen: RefCell<Vec<FrameTransition>>,
    }

    impl TransitionListener for MockTransitions {
        fn on_transition(&self, transition: &FrameTransition) {
            self.seen.borrow_mut().push(transition.clone());
        }
    }

    /// Returns canned callables keyed by source text.
    pub struct CannedEvaluator;

    impl CodeEvaluator for CannedEvaluator {
        fn compile_generate(&self, source: &str) -> Result<Box<dyn GenerateProperties>, String> {
            match source {
                "childName" => Ok(Box::new(|view: &SessionView| -> Result<Value, String> {
                    Ok(serde_json::json!({ "prompt": view.child["name"].clone() }))
                })),
                "notObject" => Ok(Box::new(|_: &SessionView| -> Result<Value, String> {
                    Ok(Value::from(7))
                })),
                _ => Err(format!("SyntaxError: {}", source)),
            }
        }

        fn compile_select(&self, source: &str) -> Result<Box<dyn SelectNextFrame>, String> {
            match source {
                "skipTwo" => Ok(Box::new(|args: &SelectArgs| -> Result<Value, String> {
                    Ok(Value::from(args.frame_index as f64 + 2.0))
                })),
                "text" => Ok(Box::new(|_: &SelectArgs| -> Result<Value, String> {
                    Ok(Value::from("next"))
                })),
                _ => Err(format!("SyntaxError: {}", source)),
            }
        }
    }

    pub struct Harness {
        pub pool: LocalPool,
        pub persistence: Rc<MockPersistence>,
        pub notifier: Rc<MockNotifier>,
        pub transitions: Rc<MockTransitions>,
        pub ctx: FrameContext,
    }

    impl Harness {
        pub fn new(mode: SaveMode) -> Self {
            let pool = LocalPool::new();
            let persistence = Rc::new(MockPersistence {
                mode,
                saved: RefCell::new(Vec::new()),
            });
            let notifier = Rc::new(MockNotifier::default());
            let transitions = Rc::new(MockTransitions::default());
            let spawner: Rc<dyn Spawner> = Rc::new(pool.spawner());
            let ctx = FrameContext::new(
                PlayerConfig::default(),
                persistence.clone(),
                notifier.clone(),
                spawner,
            )
            .with_evaluator(Rc::new(CannedEvaluator))
            .with_transitions(transitions.clone());
            Harness {
                pool,
                persistence,
                notifier,
                transitions,
                ctx,
            }
        }
    }
}
