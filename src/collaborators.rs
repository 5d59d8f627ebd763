// Interfaces the engine consumes from its host: persistence, notices, the event loop,
// the webcam recorder, and the UI layer's frame-transition hook.
// See DESIGN.md: collaborators

use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::code::{CodeEvaluator, NoEvaluator};
use crate::error::PlayerError;
use crate::types::{JsonMap, PlayerConfig};

/// Stores a frame's payload. Safe for the caller to retry; the engine never retries.
pub trait Persistence {
    fn save(&self, frame_id: &str, payload: JsonMap) -> LocalBoxFuture<'static, Result<(), PlayerError>>;
}

/// User-visible notices.
pub trait Notifier {
    /// A notice that stays up until the participant dismisses it.
    fn persistent_warning(&self, message: &str);
}

/// The single-threaded event loop background work runs on.
pub trait Spawner {
    fn spawn_local(&self, future: LocalBoxFuture<'static, ()>);
}

impl Spawner for futures::executor::LocalSpawner {
    fn spawn_local(&self, future: LocalBoxFuture<'static, ()>) {
        if let Err(e) = LocalSpawnExt::spawn_local(self, future) {
            tracing::warn!(error = %e, "executor shut down, background task dropped");
        }
    }
}

/// Why a recorder call failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderFailure {
    #[error("camera access has not been granted")]
    NoCameraAccess,
    #[error("recorder timed out after {0} ms")]
    Timeout(u64),
    #[error("{0}")]
    Other(String),
}

/// Webcam recorder. Times are stream-relative seconds.
pub trait Recorder {
    fn install(&self) -> LocalBoxFuture<'static, Result<(), RecorderFailure>>;
    fn record(&self) -> LocalBoxFuture<'static, Result<(), RecorderFailure>>;
    fn stop(&self, timeout_ms: u64) -> LocalBoxFuture<'static, Result<(), RecorderFailure>>;
    fn time(&self) -> Option<f64>;
}

/// Cross-cutting behaviors a frame kind opts into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub recording: bool,
    pub fullscreen: bool,
    pub parent_control: bool,
}

impl Capabilities {
    pub fn union(self, other: Capabilities) -> Capabilities {
        Capabilities {
            recording: self.recording || other.recording,
            fullscreen: self.fullscreen || other.fullscreen,
            parent_control: self.parent_control || other.parent_control,
        }
    }
}

/// Emitted once per navigation. The UI layer resets fullscreen, CSS, and similar state here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTransition {
    pub from_id: String,
    pub from_index: usize,
    pub to_index: usize,
    pub leaving: Capabilities,
}

pub trait TransitionListener {
    fn on_transition(&self, transition: &FrameTransition);
}

/// Everything a frame controller needs from outside the engine.
#[derive(Clone)]
pub struct FrameContext {
    pub config: PlayerConfig,
    pub persistence: Rc<dyn Persistence>,
    pub notifier: Rc<dyn Notifier>,
    pub spawner: Rc<dyn Spawner>,
    pub evaluator: Rc<dyn CodeEvaluator>,
    pub recorder: Option<Rc<dyn Recorder>>,
    pub transitions: Option<Rc<dyn TransitionListener>>,
}

impl FrameContext {
    pub fn new(
        config: PlayerConfig,
        persistence: Rc<dyn Persistence>,
        notifier: Rc<dyn Notifier>,
        spawner: Rc<dyn Spawner>,
    ) -> Self {
        FrameContext {
            config,
            persistence,
            notifier,
            spawner,
            evaluator: Rc::new(NoEvaluator),
            recorder: None,
            transitions: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Rc<dyn CodeEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_recorder(mut self, recorder: Rc<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_transitions(mut self, listener: Rc<dyn TransitionListener>) -> Self {
        self.transitions = Some(listener);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::LocalPool;
    use std::cell::Cell;

    #[test]
    fn local_spawner_runs_background_work() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();

        Spawner::spawn_local(&spawner, Box::pin(async move { flag.set(true) }));
        assert!(!ran.get());
        pool.run_until_stalled();
        assert!(ran.get());
    }

    #[test]
    fn capabilities_union() {
        let a = Capabilities {
            recording: true,
            ..Capabilities::default()
        };
        let b = Capabilities {
            parent_control: true,
            ..Capabilities::default()
        };
        let both = a.union(b);
        assert!(both.recording && both.parent_control && !both.fullscreen);
    }

    #[test]
    fn recorder_failure_messages() {
        assert_eq!(RecorderFailure::Timeout(500).to_string(), "recorder timed out after 500 ms");
    }
}
