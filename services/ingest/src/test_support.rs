use async_trait::async_trait;
use roadscan_pipeline::{CaptureEvent, EventPublisher, ProducerError};
use std::sync::Mutex;

/// Publisher that records events instead of sending them to Kafka
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(String, CaptureEvent)>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn published(&self) -> Vec<(String, CaptureEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, event: &CaptureEvent) -> Result<(), ProducerError> {
        if self.fail {
            return Err(ProducerError::SendError {
                topic: topic.to_string(),
                message: "broker unavailable".to_string(),
            });
        }
        self.events
            .lock()
            .unwrap()
            .push((topic.to_string(), event.clone()));
        Ok(())
    }
}
