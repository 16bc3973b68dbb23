//! Job Events
//!
//! In-process broadcast of job progress for downstream consumers (alerting,
//! live views). Publishing never fails: with no subscriber the event is
//! dropped.

use conveyor_core::domain::job::JobType;
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobEvent {
    /// Progress reported by the runner
    Update {
        job_id: i64,
        job_type: JobType,
        project_id: i64,
        entity_id: i64,
        done: bool,
        updates: Option<serde_json::Value>,
    },
    /// The job ended without a usable result
    Error {
        job_id: i64,
        job_type: JobType,
        project_id: i64,
        entity_id: i64,
        reason: String,
    },
    /// The runner stored an artifact
    Upload {
        job_id: i64,
        job_type: JobType,
        project_id: i64,
        entity_id: i64,
        key: String,
        size: usize,
    },
}

impl JobEvent {
    /// Topic name, `{job_type}.{kind}`
    pub fn topic(&self) -> String {
        match self {
            JobEvent::Update { job_type, .. } => format!("{job_type}.update"),
            JobEvent::Error { job_type, .. } => format!("{job_type}.error"),
            JobEvent::Upload { job_type, .. } => format!("{job_type}.upload"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: JobEvent) {
        tracing::debug!("Publishing event {}", event.topic());
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let event = JobEvent::Error {
            job_id: 1,
            job_type: JobType::LabAnalyze,
            project_id: 2,
            entity_id: 3,
            reason: "Timeout".to_string(),
        };
        bus.publish(event.clone());

        assert_eq!(rx.recv().await.unwrap(), event);
        assert_eq!(event.topic(), "LabAnalyze.error");
    }

    #[test]
    fn test_events_serialize_with_entity() {
        let event = JobEvent::Upload {
            job_id: 1,
            job_type: JobType::LabAnalyze,
            project_id: 2,
            entity_id: 3,
            key: "artifacts/2/report.json".to_string(),
            size: 2,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "upload");
        assert_eq!(value["entity_id"], 3);
        assert_eq!(value["size"], 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new().publish(JobEvent::Upload {
            job_id: 1,
            job_type: JobType::BundleAnalyze,
            project_id: 2,
            entity_id: 3,
            key: "stats.json".to_string(),
            size: 512,
        });
    }
}
