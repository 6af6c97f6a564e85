//! Best-effort audit trail.
//!
//! Entries go through a bounded channel to a background writer. Recording
//! never blocks and never fails the caller: a full or closed channel, or a
//! failed write, is reported as an [`AuditError`] in the logs only.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::errors::AuditError;
use crate::store::DbHandle;

pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub build_id: Option<String>,
    pub user_id: Option<String>,
    pub action: String,
    pub detail: Value,
    pub created_at: String,
}

impl AuditEntry {
    pub fn new(action: &str, build_id: &str, user_id: &str, detail: Value) -> Self {
        Self {
            build_id: Some(build_id.to_string()),
            user_id: Some(user_id.to_string()),
            action: action.to_string(),
            detail,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditSink {
    /// Start the background writer.
    pub fn spawn(db: DbHandle, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEntry>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let action = entry.action.clone();
                let result = db
                    .call(move |db| {
                        db.insert_audit(
                            entry.build_id.as_deref(),
                            entry.user_id.as_deref(),
                            &entry.action,
                            &entry.detail,
                            &entry.created_at,
                        )
                    })
                    .await;
                if let Err(e) = result {
                    warn!(%action, error = %AuditError::Write(e), "Audit entry lost");
                }
            }
        });
        (Self { tx: Some(tx) }, handle)
    }

    /// A sink that drops everything silently.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn try_record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        tx.try_send(entry).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AuditError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => AuditError::ChannelClosed,
        })
    }

    pub fn record(&self, entry: AuditEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.try_record(entry) {
            warn!(%action, error = %e, "Audit entry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::BuildDb;

    #[tokio::test]
    async fn test_entries_are_written_in_background() {
        let db = DbHandle::new(BuildDb::new_in_memory().unwrap());
        let (sink, handle) = AuditSink::spawn(db.clone(), 8);
        sink.record(AuditEntry::new(
            "build_admitted",
            "b1",
            "u1",
            serde_json::json!({"model": "m"}),
        ));
        drop(sink);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        let records = db.call(|db| db.list_audit("b1")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_full_channel_reports_error_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = AuditSink { tx: Some(tx) };
        let entry = AuditEntry::new("a", "b", "u", Value::Null);
        sink.try_record(entry.clone()).unwrap();
        assert!(matches!(sink.try_record(entry), Err(AuditError::ChannelFull)));
    }

    #[tokio::test]
    async fn test_closed_channel_reports_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = AuditSink { tx: Some(tx) };
        let err = sink
            .try_record(AuditEntry::new("a", "b", "u", Value::Null))
            .unwrap_err();
        assert!(matches!(err, AuditError::ChannelClosed));
    }

    #[test]
    fn test_disabled_sink_accepts_everything() {
        let sink = AuditSink::disabled();
        assert!(sink.try_record(AuditEntry::new("a", "b", "u", Value::Null)).is_ok());
    }
}
