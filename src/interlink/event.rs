use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::ExecutionType;

/// A control operation addressed to one execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterlinkEventKind {
    Cancel {
        user: Option<String>,
        reason: Option<String>,
    },
    Pause {
        user: Option<String>,
    },
    Resume {
        user: Option<String>,
        #[serde(default)]
        ignore_current_status: bool,
    },
    /// Carries the attempt it expects so a replay after a restart is stale
    RestartStage {
        stage_id: String,
        expected_attempt: u32,
    },
    PatchStage {
        stage_id: String,
        context: Map<String, JsonValue>,
    },
    Delete,
}

impl InterlinkEventKind {
    pub fn tag(&self) -> &'static str {
        match self {
            InterlinkEventKind::Cancel { .. } => "CANCEL",
            InterlinkEventKind::Pause { .. } => "PAUSE",
            InterlinkEventKind::Resume { .. } => "RESUME",
            InterlinkEventKind::RestartStage { .. } => "RESTART_STAGE",
            InterlinkEventKind::PatchStage { .. } => "PATCH_STAGE",
            InterlinkEventKind::Delete => "DELETE",
        }
    }

    /// Whether applying the event twice leaves the same state as applying it once
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, InterlinkEventKind::RestartStage { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterlinkEvent {
    pub kind: InterlinkEventKind,
    pub execution_type: ExecutionType,
    pub execution_id: String,
    /// Owning partition, filled in just before publishing
    pub partition: Option<String>,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub fingerprint: String,
}

impl InterlinkEvent {
    pub fn new(
        kind: InterlinkEventKind,
        execution_type: ExecutionType,
        execution_id: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            execution_type,
            execution_id: execution_id.into(),
            partition: None,
            published_at,
            fingerprint: String::new(),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn fingerprinted(mut self, fingerprinter: &dyn Fingerprinter) -> Self {
        self.fingerprint = fingerprinter.fingerprint(&self);
        self
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: JsonValue) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::MalformedEvent(e.to_string()))
    }
}

/// Derives the duplicate-suppression key of an event
///
/// Publisher and subscribers must be configured identically; the key is
/// recomputed on receipt and compared against the one carried by the event.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, event: &InterlinkEvent) -> String;
}

/// SHA-256 over kind, target, partition, payload and a coarse time bucket
///
/// Requests for the same operation published within one bucket share a
/// fingerprint.
#[derive(Debug, Clone)]
pub struct Sha256Fingerprinter {
    bucket: Duration,
}

impl Sha256Fingerprinter {
    pub fn new(bucket: Duration) -> Self {
        Self {
            bucket: bucket.max(Duration::from_millis(1)),
        }
    }

    fn bucket_of(&self, published_at: DateTime<Utc>) -> i64 {
        published_at
            .timestamp_millis()
            .div_euclid(self.bucket.as_millis() as i64)
    }
}

impl Fingerprinter for Sha256Fingerprinter {
    fn fingerprint(&self, event: &InterlinkEvent) -> String {
        // serde_json maps are ordered by key, so the payload encoding is canonical
        let payload = serde_json::to_string(&event.kind).unwrap_or_default();

        let mut hasher = Sha256::new();
        for part in [
            event.kind.tag(),
            execution_type_tag(event.execution_type),
            event.execution_id.as_str(),
            event.partition.as_deref().unwrap_or(""),
            payload.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.bucket_of(event.published_at).to_be_bytes());

        format!("{:x}", hasher.finalize())
    }
}

fn execution_type_tag(execution_type: ExecutionType) -> &'static str {
    match execution_type {
        ExecutionType::Pipeline => "PIPELINE",
        ExecutionType::Orchestration => "ORCHESTRATION",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn cancel_at(published_at: DateTime<Utc>) -> InterlinkEvent {
        InterlinkEvent::new(
            InterlinkEventKind::Cancel {
                user: Some("alice".to_string()),
                reason: None,
            },
            ExecutionType::Pipeline,
            "e1",
            published_at,
        )
        .with_partition("p1")
    }

    #[test]
    fn test_same_bucket_same_fingerprint() {
        let fingerprinter = Sha256Fingerprinter::new(Duration::from_secs(10));
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let a = fingerprinter.fingerprint(&cancel_at(t0));
        let b = fingerprinter.fingerprint(&cancel_at(t0 + chrono::Duration::seconds(9)));
        let c = fingerprinter.fingerprint(&cancel_at(t0 + chrono::Duration::seconds(10)));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_payload_and_partition_change_fingerprint() {
        let fingerprinter = Sha256Fingerprinter::new(Duration::from_secs(10));
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let base = cancel_at(t0);

        let other_partition = base.clone().with_partition("p2");
        let mut other_payload = base.clone();
        other_payload.kind = InterlinkEventKind::Cancel {
            user: Some("bob".to_string()),
            reason: None,
        };

        let fp = fingerprinter.fingerprint(&base);
        assert_ne!(fp, fingerprinter.fingerprint(&other_partition));
        assert_ne!(fp, fingerprinter.fingerprint(&other_payload));
    }

    #[test]
    fn test_wire_format_and_malformed_payloads() {
        let event = cancel_at(Utc::now()).fingerprinted(&Sha256Fingerprinter::new(Duration::from_secs(10)));
        let wire = event.to_json().unwrap();

        assert_eq!(wire["kind"]["type"], json!("CANCEL"));
        assert_eq!(wire["execution_type"], json!("PIPELINE"));
        assert_eq!(InterlinkEvent::from_json(wire).unwrap(), event);

        let err = InterlinkEvent::from_json(json!({"kind": {"type": "EXPLODE"}})).unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
    }

    #[test]
    fn test_only_restart_is_non_idempotent() {
        let restart = InterlinkEventKind::RestartStage {
            stage_id: "s1".to_string(),
            expected_attempt: 1,
        };
        assert!(!restart.is_idempotent());
        assert!(InterlinkEventKind::Delete.is_idempotent());
        assert!(InterlinkEventKind::Pause { user: None }.is_idempotent());
    }
}
