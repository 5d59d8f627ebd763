// exp_player_core: Rust/WASM engine for a browser webcam-experiment player.
// The host owns rendering, timers and I/O; the engine decides. Times arrive as host milliseconds.

mod code;
mod collaborators;
mod counterbalance;
mod error;
mod frames;
mod lifecycle;
mod playback;
mod recording;
mod resolver;
mod sequence;
mod timing;
mod types;
mod web;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use wasm_bindgen::prelude::*;

pub use code::{CodeEvaluator, GenerateProperties, NoEvaluator, SelectArgs, SelectNextFrame, SessionView};
pub use collaborators::{
    Capabilities, FrameContext, FrameTransition, Notifier, Persistence, Recorder, RecorderFailure, Spawner,
    TransitionListener,
};
pub use counterbalance::{Condition, CounterbalanceParams, Dimension, Expansion};
pub use error::{PlayerError, ValidationIssue};
pub use frames::InfantControlledFrame;
pub use lifecycle::{FrameBehavior, FrameController, LifecycleState, PlainFrame};
pub use playback::{LoopDecision, TestLoopCounter, WasmLoopCounter};
pub use recording::{RecorderStatus, RecordingSession};
pub use resolver::{FieldSpec, FieldType, FrameSchema, Resolution};
pub use sequence::{resolve_sequence, FrameInstanceConfig, StudyStructure};
pub use timing::{
    Deadline, LookawayState, LookawayTracker, LookawayType, ParentControlConfig, TimingEvent, TrialOutcome,
    WasmLookawayTracker,
};
pub use types::*;
pub use web::{JsCodeEvaluator, WasmFrame, WasmSpawner};

/// Initialize panic hook for better error messages in browser console.
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

#[derive(Serialize)]
struct ResolvedSequence {
    frames: Vec<FrameInstanceConfig>,
    session: SessionRecord,
}

/// Main player interface exposed to JavaScript.
#[wasm_bindgen]
pub struct Player {
    config: PlayerConfig,
    ctx: Option<FrameContext>,
}

#[wasm_bindgen]
impl Player {
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str) -> Result<Player, JsValue> {
        let config: PlayerConfig = serde_json::from_str(config_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid config: {}", e)))?;
        tracing::debug!(?config, "player created");
        Ok(Player { config, ctx: None })
    }

    /// Wire up the host callbacks: `{ save, warn, onTransition?, recorder?, allowCode? }`.
    pub fn connect(&mut self, host: JsValue) -> Result<(), JsValue> {
        self.ctx = Some(web::context_from_host(self.config.clone(), &host)?);
        Ok(())
    }

    /// Build a frame from its schema, researcher config, and capability flags (all JSON).
    pub fn create_frame(
        &self,
        schema_json: &str,
        frame_config_json: &str,
        capabilities_json: &str,
    ) -> Result<WasmFrame, JsValue> {
        let ctx = self
            .ctx
            .clone()
            .ok_or_else(|| JsValue::from_str("Player is not connected to a host"))?;
        let schema: FrameSchema = serde_json::from_str(schema_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid frame schema: {}", e)))?;
        let frame_config: JsonMap = serde_json::from_str(frame_config_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid frame config: {}", e)))?;
        let capabilities: Capabilities = serde_json::from_str(capabilities_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid capabilities: {}", e)))?;
        Ok(WasmFrame::new(schema, frame_config, capabilities, ctx))
    }

    /// Expand the study's randomizers. Returns `{ frames, session }` with conditions filled in.
    pub fn resolve_sequence(&self, structure_json: &str, session_json: &str, seed: u32) -> Result<String, JsValue> {
        let structure: StudyStructure = serde_json::from_str(structure_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid study structure: {}", e)))?;
        let mut session: SessionRecord = serde_json::from_str(session_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid session: {}", e)))?;
        let mut rng = StdRng::seed_from_u64(u64::from(seed));

        let frames = sequence::resolve_sequence(&structure, &mut session, &mut rng)
            .map_err(|e| JsValue::from_str(&e.to_string()))?;

        serde_json::to_string(&ResolvedSequence { frames, session })
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Loop counter for a test video, using the configured boundary.
    pub fn loop_counter(&self, test_count: u32) -> WasmLoopCounter {
        WasmLoopCounter::with_boundary(test_count, self.config.loop_boundary)
    }
}
