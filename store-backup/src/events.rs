//! Discrete domain events for UI consumers.
//!
//! Events serialize as `{"type": "backup:completed", "payload": {...}}`.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::catalog::BackupTrigger;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum BackupEvent {
    #[serde(rename = "backup:started", rename_all = "camelCase")]
    BackupStarted { attempt_id: String, trigger: BackupTrigger },

    #[serde(rename = "backup:completed", rename_all = "camelCase")]
    BackupCompleted { backup_id: String, size_bytes: u64 },

    #[serde(rename = "backup:failed", rename_all = "camelCase")]
    BackupFailed { attempt_id: String, error: String },

    #[serde(rename = "backup:uploaded", rename_all = "camelCase")]
    BackupUploaded { backup_id: String, remote_ref: String },

    #[serde(rename = "backup:upload-failed", rename_all = "camelCase")]
    BackupUploadFailed { backup_id: String, error: String },

    #[serde(rename = "retention:pruned", rename_all = "camelCase")]
    RetentionPruned { removed: Vec<String> },

    #[serde(rename = "restore:staged", rename_all = "camelCase")]
    RestoreStaged { backup_id: String },

    #[serde(rename = "restore:applied", rename_all = "camelCase")]
    RestoreApplied { backup_id: String },

    #[serde(rename = "restore:aborted", rename_all = "camelCase")]
    RestoreAborted { reason: String },

    #[serde(rename = "restore:cleared", rename_all = "camelCase")]
    RestoreCleared {
        descriptor_removed: bool,
        staging_entries_removed: usize,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is normal (CLI runs).
    pub fn emit(&self, event: BackupEvent) {
        tracing::debug!(?event, "Emitting event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(BackupEvent::RestoreStaged {
            backup_id: "b1".into(),
        });

        match rx.recv().await.unwrap() {
            BackupEvent::RestoreStaged { backup_id } => assert_eq!(backup_id, "b1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        EventBus::new().emit(BackupEvent::RetentionPruned { removed: vec![] });
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(BackupEvent::BackupCompleted {
            backup_id: "b2".into(),
            size_bytes: 10,
        })
        .unwrap();
        assert_eq!(json["type"], "backup:completed");
        assert_eq!(json["payload"]["backupId"], "b2");
        assert_eq!(json["payload"]["sizeBytes"], 10);
    }
}
