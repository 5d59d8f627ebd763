// Browser host adapters: JS callbacks behind the collaborator traits, and the frame facade
// exported to JS. Everything crosses the boundary as JSON strings or plain JS values.
// See DESIGN.md: host bindings

use std::rc::Rc;

use futures::future::LocalBoxFuture;
use js_sys::{Array, Function, Promise, Reflect, JSON};
use serde::Serialize;
use serde_json::Value;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use crate::code::{CodeEvaluator, GenerateProperties, SelectArgs, SelectNextFrame, SessionView};
use crate::collaborators::{
    Capabilities, FrameContext, FrameTransition, Notifier, Persistence, Recorder, RecorderFailure, Spawner,
    TransitionListener,
};
use crate::error::PlayerError;
use crate::frames::InfantControlledFrame;
use crate::lifecycle::{FrameController, PlainFrame};
use crate::resolver::FrameSchema;
use crate::timing::ParentControlConfig;
use crate::types::{JsonMap, PlayerConfig, SessionRecord, Timestamp};

// =============================================================================
// JS <-> JSON
// =============================================================================

/// Best-effort message out of a thrown JS value.
pub(crate) fn describe(value: &JsValue) -> String {
    if let Some(s) = value.as_string() {
        return s;
    }
    if let Some(err) = value.dyn_ref::<js_sys::Error>() {
        return String::from(err.message());
    }
    format!("{:?}", value)
}

fn to_js(value: &Value) -> Result<JsValue, String> {
    let text = serde_json::to_string(value).map_err(|e| e.to_string())?;
    JSON::parse(&text).map_err(|e| describe(&e))
}

fn from_js(value: &JsValue) -> Result<Value, String> {
    if value.is_undefined() {
        return Ok(Value::Null);
    }
    let text: String = JSON::stringify(value).map_err(|e| describe(&e))?.into();
    serde_json::from_str(&text).map_err(|e| e.to_string())
}

fn method(target: &JsValue, name: &str) -> Result<Function, String> {
    Reflect::get(target, &JsValue::from_str(name))
        .map_err(|e| describe(&e))?
        .dyn_into::<Function>()
        .map_err(|_| format!("host object has no {} function", name))
}

fn optional_method(target: &JsValue, name: &str) -> Option<Function> {
    Reflect::get(target, &JsValue::from_str(name))
        .ok()
        .and_then(|v| v.dyn_into::<Function>().ok())
}

fn js_err(err: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, JsValue> {
    serde_json::to_string(value).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

fn parse<T: serde::de::DeserializeOwned>(what: &str, json: &str) -> Result<T, JsValue> {
    serde_json::from_str(json).map_err(|e| JsValue::from_str(&format!("Invalid {}: {}", what, e)))
}

/// A JS call that may return a promise; plain return values resolve immediately.
fn awaitable(result: Result<JsValue, JsValue>) -> Result<JsFuture, JsValue> {
    let value = result?;
    let promise = match value.dyn_into::<Promise>() {
        Ok(promise) => promise,
        Err(value) => Promise::resolve(&value),
    };
    Ok(JsFuture::from(promise))
}

// =============================================================================
// Collaborators
// =============================================================================

/// `save(frameId, payload)`, returning a promise.
pub struct JsPersistence {
    save: Function,
}

impl Persistence for JsPersistence {
    fn save(&self, frame_id: &str, payload: JsonMap) -> LocalBoxFuture<'static, Result<(), PlayerError>> {
        let pending = to_js(&Value::Object(payload))
            .map_err(PlayerError::Serialization)
            .and_then(|payload| {
                awaitable(self.save.call2(&JsValue::NULL, &JsValue::from_str(frame_id), &payload))
                    .map_err(|e| PlayerError::Persistence(describe(&e)))
            });
        Box::pin(async move {
            pending?
                .await
                .map(|_| ())
                .map_err(|e| PlayerError::Persistence(describe(&e)))
        })
    }
}

/// `warn(message)`.
pub struct JsNotifier {
    warn: Function,
}

impl Notifier for JsNotifier {
    fn persistent_warning(&self, message: &str) {
        if let Err(e) = self.warn.call1(&JsValue::NULL, &JsValue::from_str(message)) {
            tracing::error!(error = %describe(&e), "could not show warning");
        }
    }
}

/// Runs background work on the browser microtask queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct WasmSpawner;

impl Spawner for WasmSpawner {
    fn spawn_local(&self, future: LocalBoxFuture<'static, ()>) {
        wasm_bindgen_futures::spawn_local(future);
    }
}

/// `onTransition(transition)`.
pub struct JsTransitions {
    on_transition: Function,
}

impl TransitionListener for JsTransitions {
    fn on_transition(&self, transition: &FrameTransition) {
        let value = match serde_json::to_value(transition).map_err(|e| e.to_string()).and_then(|v| to_js(&v)) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, "could not encode frame transition");
                return;
            }
        };
        if let Err(e) = self.on_transition.call1(&JsValue::NULL, &value) {
            tracing::warn!(error = %describe(&e), "transition listener threw");
        }
    }
}

/// JS recorder object with `install()`, `record()`, `stop(timeoutMs)` and `time()`.
/// Rejections with `"noCameraAccess"` or `"timeout"` map onto the matching failures.
pub struct JsRecorder {
    handle: JsValue,
}

impl JsRecorder {
    fn invoke(&self, name: &str, args: &Array, timeout_ms: u64) -> LocalBoxFuture<'static, Result<(), RecorderFailure>> {
        let pending = method(&self.handle, name)
            .map_err(RecorderFailure::Other)
            .and_then(|f| awaitable(f.apply(&self.handle, args)).map_err(|e| recorder_failure(&e, timeout_ms)));
        Box::pin(async move {
            pending?.await.map(|_| ()).map_err(|e| recorder_failure(&e, timeout_ms))
        })
    }
}

fn recorder_failure(value: &JsValue, timeout_ms: u64) -> RecorderFailure {
    match value.as_string().as_deref() {
        Some("noCameraAccess") => RecorderFailure::NoCameraAccess,
        Some("timeout") => RecorderFailure::Timeout(timeout_ms),
        _ => RecorderFailure::Other(describe(value)),
    }
}

impl Recorder for JsRecorder {
    fn install(&self) -> LocalBoxFuture<'static, Result<(), RecorderFailure>> {
        self.invoke("install", &Array::new(), 0)
    }

    fn record(&self) -> LocalBoxFuture<'static, Result<(), RecorderFailure>> {
        self.invoke("record", &Array::new(), 0)
    }

    fn stop(&self, timeout_ms: u64) -> LocalBoxFuture<'static, Result<(), RecorderFailure>> {
        self.invoke("stop", &Array::of1(&JsValue::from_f64(timeout_ms as f64)), timeout_ms)
    }

    fn time(&self) -> Option<f64> {
        let f = optional_method(&self.handle, "time")?;
        f.call0(&self.handle).ok()?.as_f64()
    }
}

// =============================================================================
// Researcher code
// =============================================================================

/// Compiles researcher source with the page's JS engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsCodeEvaluator;

impl JsCodeEvaluator {
    fn compile(&self, source: &str) -> Result<Function, String> {
        js_sys::eval(&format!("({})", source))
            .map_err(|e| describe(&e))?
            .dyn_into::<Function>()
            .map_err(|_| "source does not evaluate to a function".to_string())
    }
}

struct JsGenerate(Function);
struct JsSelect(Function);

fn call_with(function: &Function, args: &[&Value]) -> Result<Value, String> {
    let array = Array::new();
    for arg in args {
        array.push(&to_js(arg)?);
    }
    let result = function.apply(&JsValue::NULL, &array).map_err(|e| describe(&e))?;
    from_js(&result)
}

impl GenerateProperties for JsGenerate {
    fn call(&self, args: &SessionView) -> Result<Value, String> {
        call_with(
            &self.0,
            &[&args.exp_data, &args.sequence, &args.child, &args.past_sessions, &args.conditions],
        )
    }
}

impl SelectNextFrame for JsSelect {
    fn call(&self, args: &SelectArgs) -> Result<Value, String> {
        let index = Value::from(args.frame_index);
        call_with(
            &self.0,
            &[
                &args.frames,
                &index,
                &args.frame_data,
                &args.session.exp_data,
                &args.session.sequence,
                &args.session.child,
                &args.session.past_sessions,
            ],
        )
    }
}

impl CodeEvaluator for JsCodeEvaluator {
    fn compile_generate(&self, source: &str) -> Result<Box<dyn GenerateProperties>, String> {
        Ok(Box::new(JsGenerate(self.compile(source)?)))
    }

    fn compile_select(&self, source: &str) -> Result<Box<dyn SelectNextFrame>, String> {
        Ok(Box::new(JsSelect(self.compile(source)?)))
    }
}

/// Build a frame context from a JS host object:
/// `{ save, warn, onTransition?, recorder?, allowCode? }`.
pub fn context_from_host(config: PlayerConfig, host: &JsValue) -> Result<FrameContext, JsValue> {
    let save = method(host, "save").map_err(js_err)?;
    let warn = method(host, "warn").map_err(js_err)?;
    let mut ctx = FrameContext::new(
        config,
        Rc::new(JsPersistence { save }),
        Rc::new(JsNotifier { warn }),
        Rc::new(WasmSpawner),
    );
    if let Some(on_transition) = optional_method(host, "onTransition") {
        ctx = ctx.with_transitions(Rc::new(JsTransitions { on_transition }));
    }
    let recorder = Reflect::get(host, &JsValue::from_str("recorder"))?;
    if recorder.is_object() {
        ctx = ctx.with_recorder(Rc::new(JsRecorder { handle: recorder }));
    }
    let allow_code = Reflect::get(host, &JsValue::from_str("allowCode"))?;
    if allow_code.as_bool().unwrap_or(false) {
        ctx = ctx.with_evaluator(Rc::new(JsCodeEvaluator));
    }
    Ok(ctx)
}

// =============================================================================
// Frame facade
// =============================================================================

enum Handle {
    Plain(FrameController),
    InfantControlled(Box<InfantControlledFrame>),
}

/// Result of a save or navigation, handed back to JS with the updated session.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Step {
    session: SessionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_index: Option<usize>,
}

/// One frame as seen from JS. Session state is passed in and returned as JSON.
#[wasm_bindgen]
pub struct WasmFrame {
    handle: Option<Handle>,
    parent_control: bool,
}

impl WasmFrame {
    pub(crate) fn new(schema: FrameSchema, frame_config: JsonMap, capabilities: Capabilities, ctx: FrameContext) -> Self {
        let behavior = PlainFrame {
            capabilities: Capabilities {
                parent_control: false,
                ..capabilities
            },
        };
        WasmFrame {
            handle: Some(Handle::Plain(FrameController::new(schema, frame_config, Box::new(behavior), ctx))),
            parent_control: capabilities.parent_control,
        }
    }

    fn controller(&self) -> Result<&FrameController, JsValue> {
        match &self.handle {
            Some(Handle::Plain(c)) => Ok(c),
            Some(Handle::InfantControlled(f)) => Ok(f.controller()),
            None => Err(JsValue::from_str("frame is no longer usable")),
        }
    }

    fn controller_mut(&mut self) -> Result<&mut FrameController, JsValue> {
        match &mut self.handle {
            Some(Handle::Plain(c)) => Ok(c),
            Some(Handle::InfantControlled(f)) => Ok(f.controller_mut()),
            None => Err(JsValue::from_str("frame is no longer usable")),
        }
    }

    fn infant(&mut self) -> Result<&mut InfantControlledFrame, JsValue> {
        match &mut self.handle {
            Some(Handle::InfantControlled(f)) => Ok(f),
            _ => Err(JsValue::from_str("frame does not use parent control")),
        }
    }
}

#[wasm_bindgen]
impl WasmFrame {
    pub fn id(&self) -> Result<String, JsValue> {
        Ok(self.controller()?.id().to_string())
    }

    /// Render at `index`. Returns whether the frame was reconfigured.
    pub fn attach(&mut self, index: usize, session_json: &str, now_ms: f64) -> Result<bool, JsValue> {
        let session: SessionRecord = parse("session", session_json)?;
        let now = Timestamp::from_millis(now_ms);
        match self.handle.take() {
            Some(Handle::Plain(mut controller)) => {
                let configured = controller.on_attach(index, &session, now);
                let configured = match configured {
                    Ok(configured) => configured,
                    Err(e) => {
                        self.handle = Some(Handle::Plain(controller));
                        return Err(js_err(e));
                    }
                };
                if !self.parent_control {
                    self.handle = Some(Handle::Plain(controller));
                    return Ok(configured);
                }
                if let Err(e) = ParentControlConfig::from_frame_config(controller.config()) {
                    self.handle = Some(Handle::Plain(controller));
                    return Err(js_err(e));
                }
                let frame = InfantControlledFrame::new(controller).map_err(js_err)?;
                self.handle = Some(Handle::InfantControlled(Box::new(frame)));
                Ok(configured)
            }
            Some(Handle::InfantControlled(mut frame)) => {
                let result = frame.attach(index, &session, now);
                self.handle = Some(Handle::InfantControlled(frame));
                result.map_err(js_err)
            }
            None => Err(JsValue::from_str("frame is no longer usable")),
        }
    }

    pub fn config(&self) -> Result<String, JsValue> {
        to_json(self.controller()?.config())
    }

    /// Soft validation problems from the last configuration, as strings.
    pub fn issues(&self) -> Result<String, JsValue> {
        let issues: Vec<String> = self.controller()?.issues().iter().map(ToString::to_string).collect();
        to_json(&issues)
    }

    pub fn record_event(&mut self, event_type: &str, extra_json: &str, now_ms: f64) -> Result<(), JsValue> {
        let extra: JsonMap = if extra_json.is_empty() {
            JsonMap::new()
        } else {
            parse("event data", extra_json)?
        };
        self.controller_mut()?
            .record_event(event_type, extra, Timestamp::from_millis(now_ms));
        Ok(())
    }

    pub fn set_data(&mut self, key: &str, value_json: &str) -> Result<(), JsValue> {
        let value: Value = parse("frame data", value_json)?;
        self.controller_mut()?.set_data(key, value);
        Ok(())
    }

    pub fn serialize(&self, now_ms: f64) -> Result<String, JsValue> {
        to_json(&self.controller()?.serialize(Timestamp::from_millis(now_ms)))
    }

    /// Returns `{ session, payload }`.
    pub fn save(&mut self, session_json: &str, now_ms: f64) -> Result<String, JsValue> {
        let mut session: SessionRecord = parse("session", session_json)?;
        let payload = self
            .controller_mut()?
            .save(&mut session, Timestamp::from_millis(now_ms));
        to_json(&Step {
            session,
            payload: Some(payload),
            next_index: None,
        })
    }

    /// Returns `{ session, nextIndex }`.
    pub fn advance(&mut self, frames_json: &str, session_json: &str, now_ms: f64) -> Result<String, JsValue> {
        let frames: Value = parse("frame list", frames_json)?;
        let mut session: SessionRecord = parse("session", session_json)?;
        let next = self
            .controller_mut()?
            .advance(&frames, &mut session, Timestamp::from_millis(now_ms))
            .map_err(js_err)?;
        to_json(&Step {
            session,
            payload: None,
            next_index: Some(next),
        })
    }

    /// Returns `{ session, nextIndex }`.
    pub fn retreat(&mut self, session_json: &str, now_ms: f64) -> Result<String, JsValue> {
        let mut session: SessionRecord = parse("session", session_json)?;
        let previous = self
            .controller_mut()?
            .retreat(&mut session, Timestamp::from_millis(now_ms));
        to_json(&Step {
            session,
            payload: None,
            next_index: Some(previous),
        })
    }

    pub fn destroy(&mut self) -> Result<(), JsValue> {
        self.controller_mut()?.destroy();
        Ok(())
    }

    /// Resolves once recording has started or the recorder reported a status.
    pub fn start_recording(&self) -> Result<Promise, JsValue> {
        let session = self.controller()?.recording().cloned();
        Ok(wasm_bindgen_futures::future_to_promise(async move {
            if let Some(session) = session {
                session.start().await;
                return Ok(JsValue::from_bool(session.is_recording()));
            }
            Ok(JsValue::from_bool(false))
        }))
    }

    pub fn stop_recording(&self) -> Result<Promise, JsValue> {
        let session = self.controller()?.recording().cloned();
        Ok(wasm_bindgen_futures::future_to_promise(async move {
            if let Some(session) = session {
                session.stop().await;
            }
            Ok(JsValue::UNDEFINED)
        }))
    }

    pub fn recorder_status(&self) -> Result<String, JsValue> {
        let status = self.controller()?.recording().map(|r| r.status());
        to_json(&status)
    }

    // -------------------------------------------------------------------------
    // Parent control
    // -------------------------------------------------------------------------

    pub fn start_parent_control(&mut self, now_ms: f64) -> Result<(), JsValue> {
        self.infant()?.start_parent_control(Timestamp::from_millis(now_ms));
        Ok(())
    }

    pub fn end_parent_control(&mut self, now_ms: f64) -> Result<(), JsValue> {
        self.infant()?.end_parent_control(Timestamp::from_millis(now_ms));
        Ok(())
    }

    /// Returns the trial outcome as JSON, or `"null"`.
    pub fn key_down(&mut self, key: &str, now_ms: f64) -> Result<String, JsValue> {
        let outcome = self.infant()?.key_down(key, Timestamp::from_millis(now_ms));
        to_json(&outcome)
    }

    pub fn key_up(&mut self, key: &str, now_ms: f64) -> Result<(), JsValue> {
        self.infant()?.key_up(key, Timestamp::from_millis(now_ms));
        Ok(())
    }

    pub fn mouse_down(&mut self, now_ms: f64) -> Result<(), JsValue> {
        self.infant()?.mouse_down(Timestamp::from_millis(now_ms));
        Ok(())
    }

    pub fn mouse_up(&mut self, now_ms: f64) -> Result<(), JsValue> {
        self.infant()?.mouse_up(Timestamp::from_millis(now_ms));
        Ok(())
    }

    /// When the host should call `on_timer`, in host milliseconds.
    pub fn pending_deadline_ms(&mut self) -> Result<Option<f64>, JsValue> {
        Ok(self.infant()?.tracker().pending_deadline().map(|d| d.due.as_millis()))
    }

    pub fn on_timer(&mut self, now_ms: f64) -> Result<String, JsValue> {
        let outcome = self.infant()?.on_timer(Timestamp::from_millis(now_ms));
        to_json(&outcome)
    }
}
