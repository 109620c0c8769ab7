//! Lifecycle events emitted by providers.
//!
//! Events go to whatever the caller hooked up at construction: a WebSocket
//! relay, a log, a database writer. The core neither knows nor waits.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::provider::ProviderKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ProviderEvent {
    EnvironmentCreated {
        provider: ProviderKind,
        environment_id: String,
    },
    EnvironmentDestroyed {
        provider: ProviderKind,
        environment_id: String,
    },
    ServiceCreated {
        repository_key: String,
        service: String,
    },
    ServiceReused {
        repository_key: String,
        service: String,
    },
    SessionCreated {
        provider: ProviderKind,
        session_id: String,
        environment_id: String,
    },
    SessionTerminated {
        provider: ProviderKind,
        session_id: String,
    },
    TaskStarted {
        session_id: String,
        command: String,
    },
    TaskCompleted {
        session_id: String,
        exit_code: i32,
        #[serde(with = "duration_ms")]
        duration: Duration,
    },
    TaskFailed {
        session_id: String,
        exit_code: Option<i32>,
        error: String,
        timed_out: bool,
    },
}

/// Where events go. Cloning shares the channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ProviderEvent>>,
}

impl EventSink {
    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A sink plus the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: ProviderEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_kebab_tag() {
        let event = ProviderEvent::SessionTerminated {
            provider: ProviderKind::Ecs,
            session_id: "s1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "session-terminated");
        assert_eq!(json["provider"], "ecs");

        let event = ProviderEvent::TaskCompleted {
            session_id: "s1".into(),
            exit_code: 0,
            duration: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["duration"], 1500);
    }

    #[tokio::test]
    async fn test_channel_delivers_and_ignores_dropped_receiver() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(ProviderEvent::TaskStarted {
            session_id: "s1".into(),
            command: "echo".into(),
        });
        assert!(matches!(rx.recv().await, Some(ProviderEvent::TaskStarted { .. })));

        drop(rx);
        sink.emit(ProviderEvent::TaskStarted {
            session_id: "s1".into(),
            command: "echo".into(),
        });
        EventSink::disabled().emit(ProviderEvent::TaskStarted {
            session_id: "s2".into(),
            command: "echo".into(),
        });
    }
}
