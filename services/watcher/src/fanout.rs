//! Fan-out dispatcher: presents an ordered list of sinks as a single sink.

use crate::frame::DecodedFrame;
use crate::sink::{FrameError, FrameSink};
use async_trait::async_trait;
use tracing::debug;

/// Invokes each sink in construction order for every frame.
///
/// The first sink error aborts the remaining sinks for that frame and is
/// returned to the caller unchanged.
pub struct FanOut {
    name: String,
    sinks: Vec<Box<dyn FrameSink>>,
}

impl FanOut {
    pub fn new(sinks: Vec<Box<dyn FrameSink>>) -> Self {
        Self {
            name: "fan-out".to_string(),
            sinks,
        }
    }

    /// Append a sink after the existing ones.
    pub fn push(&mut self, sink: Box<dyn FrameSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Sink names in dispatch order.
    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl FrameSink for FanOut {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&mut self, frame: &DecodedFrame) -> Result<(), FrameError> {
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.process(frame).await {
                debug!(sink = %sink.name(), error = %e, "Sink failed, skipping remaining sinks for frame");
                return Err(e);
            }
        }
        Ok(())
    }
}
