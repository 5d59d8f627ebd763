// Looping test-video bookkeeping. The replay boundary is a setting, not a constant.
// See DESIGN.md: Open Questions

use serde::{Deserialize, Serialize};
use wasm_bindgen::prelude::*;

use crate::types::LoopBoundary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopDecision {
    Replay,
    Finish,
}

/// Counts plays of a test video against `test_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestLoopCounter {
    test_count: u32,
    times_played: u32,
    boundary: LoopBoundary,
}

impl TestLoopCounter {
    pub fn new(test_count: u32, boundary: LoopBoundary) -> Self {
        TestLoopCounter {
            test_count,
            times_played: 0,
            boundary,
        }
    }

    pub fn times_played(&self) -> u32 {
        self.times_played
    }

    /// Call when the video reaches its end.
    pub fn video_stopped(&mut self) -> LoopDecision {
        self.times_played = self.times_played.saturating_add(1);
        let done = match self.boundary {
            LoopBoundary::Inclusive => self.times_played >= self.test_count,
            LoopBoundary::Exclusive => self.times_played > self.test_count,
        };
        if done {
            LoopDecision::Finish
        } else {
            LoopDecision::Replay
        }
    }
}

/// WASM-exposed loop counter for test videos.
#[wasm_bindgen]
pub struct WasmLoopCounter {
    inner: TestLoopCounter,
}

impl WasmLoopCounter {
    pub(crate) fn with_boundary(test_count: u32, boundary: LoopBoundary) -> WasmLoopCounter {
        WasmLoopCounter {
            inner: TestLoopCounter::new(test_count, boundary),
        }
    }
}

#[wasm_bindgen]
impl WasmLoopCounter {
    #[wasm_bindgen(constructor)]
    pub fn new(test_count: u32, exclusive: bool) -> WasmLoopCounter {
        let boundary = if exclusive {
            LoopBoundary::Exclusive
        } else {
            LoopBoundary::Inclusive
        };
        WasmLoopCounter::with_boundary(test_count, boundary)
    }

    /// True when the video should play again.
    pub fn video_stopped(&mut self) -> bool {
        self.inner.video_stopped() == LoopDecision::Replay
    }

    pub fn times_played(&self) -> u32 {
        self.inner.times_played()
    }
}
