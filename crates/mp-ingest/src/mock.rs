use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::adapter::{EventSource, FrameStream, RawFrame};
use crate::error::Result;

/// An `EventSource` that replays a fixed, shared script of frames and
/// then idles, for deterministic adapter tests.
#[derive(Clone, Default)]
pub struct MockEventSource {
    script: Arc<Mutex<VecDeque<RawFrame>>>,
}

impl MockEventSource {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            script: Arc::new(Mutex::new(frames.into())),
        }
    }

    pub fn push(&self, frame: RawFrame) {
        self.script.lock().push_back(frame);
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn connect(&self) -> Result<Box<dyn FrameStream>> {
        Ok(Box::new(MockFrameStream {
            script: self.script.clone(),
        }))
    }
}

struct MockFrameStream {
    script: Arc<Mutex<VecDeque<RawFrame>>>,
}

#[async_trait]
impl FrameStream for MockFrameStream {
    async fn next_frame(&mut self) -> Option<Result<RawFrame>> {
        self.script.lock().pop_front().map(Ok)
    }
}
