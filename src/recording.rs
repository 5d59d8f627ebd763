// Recorder status tracking. Recorder failures become a status flag, never an error.
// See DESIGN.md: recording

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::collaborators::{Recorder, RecorderFailure};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", content = "message", rename_all = "camelCase")]
pub enum RecorderStatus {
    #[default]
    Idle,
    Installing,
    /// Waiting for the parent to grant camera access. Not a failure.
    AwaitingCameraAccess,
    Recording,
    Stopping,
    Stopped,
    Failed(String),
}

/// One frame's use of the webcam recorder.
#[derive(Clone)]
pub struct RecordingSession {
    recorder: Rc<dyn Recorder>,
    status: Rc<RefCell<RecorderStatus>>,
    stop_timeout_ms: u64,
}

impl RecordingSession {
    pub fn new(recorder: Rc<dyn Recorder>, stop_timeout_ms: u64) -> Self {
        RecordingSession {
            recorder,
            status: Rc::new(RefCell::new(RecorderStatus::Idle)),
            stop_timeout_ms,
        }
    }

    pub fn status(&self) -> RecorderStatus {
        self.status.borrow().clone()
    }

    pub fn is_recording(&self) -> bool {
        matches!(*self.status.borrow(), RecorderStatus::Recording)
    }

    /// Stream-relative time, if the recorder is running.
    pub fn time(&self) -> Option<f64> {
        if self.is_recording() {
            self.recorder.time()
        } else {
            None
        }
    }

    /// Install and start recording. Calling again after `AwaitingCameraAccess` retries.
    pub async fn start(&self) {
        self.set(RecorderStatus::Installing);
        if let Err(failure) = self.recorder.install().await {
            self.fail(failure);
            return;
        }
        match self.recorder.record().await {
            Ok(()) => self.set(RecorderStatus::Recording),
            Err(failure) => self.fail(failure),
        }
    }

    pub async fn stop(&self) {
        if !self.is_recording() {
            return;
        }
        self.set(RecorderStatus::Stopping);
        match self.recorder.stop(self.stop_timeout_ms).await {
            Ok(()) => self.set(RecorderStatus::Stopped),
            Err(failure) => self.fail(failure),
        }
    }

    fn set(&self, status: RecorderStatus) {
        tracing::debug!(?status, "recorder status");
        *self.status.borrow_mut() = status;
    }

    fn fail(&self, failure: RecorderFailure) {
        let status = match failure {
            RecorderFailure::NoCameraAccess => RecorderStatus::AwaitingCameraAccess,
            other => {
                tracing::warn!(error = %other, "recorder failed");
                RecorderStatus::Failed(other.to_string())
            }
        };
        self.set(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::future::{self, LocalBoxFuture};
    use futures::FutureExt;
    use std::cell::Cell;

    struct FakeRecorder {
        camera_allowed: Cell<bool>,
        stop_result: Result<(), RecorderFailure>,
    }

    impl Recorder for FakeRecorder {
        fn install(&self) -> LocalBoxFuture<'static, Result<(), RecorderFailure>> {
            let result = if self.camera_allowed.get() {
                Ok(())
            } else {
                Err(RecorderFailure::NoCameraAccess)
            };
            future::ready(result).boxed_local()
        }

        fn record(&self) -> LocalBoxFuture<'static, Result<(), RecorderFailure>> {
            future::ready(Ok(())).boxed_local()
        }

        fn stop(&self, timeout_ms: u64) -> LocalBoxFuture<'static, Result<(), RecorderFailure>> {
            let result = self.stop_result.clone().map_err(|_| RecorderFailure::Timeout(timeout_ms));
            future::ready(result).boxed_local()
        }

        fn time(&self) -> Option<f64> {
            Some(12.5)
        }
    }

    #[test]
    fn missing_camera_is_a_waiting_state() {
        let recorder = Rc::new(FakeRecorder {
            camera_allowed: Cell::new(false),
            stop_result: Ok(()),
        });
        let session = RecordingSession::new(recorder.clone(), 1_000);

        block_on(session.start());
        assert_eq!(session.status(), RecorderStatus::AwaitingCameraAccess);
        assert_eq!(session.time(), None);

        recorder.camera_allowed.set(true);
        block_on(session.start());
        assert!(session.is_recording());
        assert_eq!(session.time(), Some(12.5));
    }

    #[test]
    fn upload_timeout_becomes_failed_status() {
        let recorder = Rc::new(FakeRecorder {
            camera_allowed: Cell::new(true),
            stop_result: Err(RecorderFailure::Other("upload".into())),
        });
        let session = RecordingSession::new(recorder, 250);
        block_on(session.start());
        block_on(session.stop());
        assert_eq!(
            session.status(),
            RecorderStatus::Failed("recorder timed out after 250 ms".into())
        );
    }

    #[test]
    fn stop_without_recording_is_noop() {
        let recorder = Rc::new(FakeRecorder {
            camera_allowed: Cell::new(true),
            stop_result: Ok(()),
        });
        let session = RecordingSession::new(recorder, 250);
        block_on(session.stop());
        assert_eq!(session.status(), RecorderStatus::Idle);
    }
}
