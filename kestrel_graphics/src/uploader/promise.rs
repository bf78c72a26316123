use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::vulkan::resource::Image;

/// Upload failure reported through an [`ImagePromise`]. The renderer never
/// observes a partially-initialized image.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    #[error("failed to open image file: {0}")]
    Open(String),
    #[error("failed to read image header: {0}")]
    Header(String),
    #[error("failed to create destination image")]
    ImageCreation,
    #[error("failed to allocate staging memory")]
    StagingAllocation,
    #[error("failed to read image data")]
    Read,
    #[error("failed to record or submit upload commands")]
    Submission,
}

/// Single-writer, multi-reader upload result. The uploader worker writes
/// exactly once; readers poll `is_done` and then take the result.
pub struct ImagePromise {
    done: AtomicBool,
    result: Mutex<Option<Result<Image, UploadError>>>,
}

impl ImagePromise {
    pub(crate) fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            result: Mutex::new(None),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn fulfill(&self, image: Image) {
        self.complete(Ok(image));
    }

    pub(crate) fn fail(&self, error: UploadError) {
        self.complete(Err(error));
    }

    fn complete(&self, result: Result<Image, UploadError>) {
        let mut slot = self.result.lock();
        debug_assert!(slot.is_none(), "Promise completed twice");
        *slot = Some(result);
        self.done.store(true, Ordering::Release);
    }

    /// Takes the result out of the promise. Returns `None` while the upload
    /// is still in flight (or when the result was already taken).
    pub fn take_result(&self) -> Option<Result<Image, UploadError>> {
        if !self.is_done() {
            return None;
        }
        self.result.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_promise_returns_nothing() {
        let promise = ImagePromise::new();
        assert!(!promise.is_done());
        assert!(promise.take_result().is_none());
    }

    #[test]
    fn failed_promise_delivers_error_once() {
        let promise = ImagePromise::new();
        promise.fail(UploadError::Read);

        assert!(promise.is_done());
        assert!(matches!(promise.take_result(), Some(Err(UploadError::Read))));
        assert!(promise.take_result().is_none());
    }
}
