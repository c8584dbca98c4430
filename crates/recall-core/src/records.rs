//! Record types stored by the memory engine.
//!
//! Two record families share the same lifecycle: created by a mutation,
//! immutable once written, removed only by capacity eviction or an
//! explicit delete entry. Both are tagged structures with required fields
//! validated before anything touches the WAL.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Accept timestamps up to one day in the future (clock skew tolerance).
pub const MAX_TIMESTAMP_SKEW_MS: u64 = 24 * 60 * 60 * 1000;

/// Process-local counter so ids minted in the same millisecond stay unique.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock time as epoch milliseconds.
#[must_use]
pub fn epoch_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

fn mint_id(prefix: &str, timestamp_ms: u64) -> String {
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{timestamp_ms}_{n:04}")
}

/// Speaker role of a dialogue record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// Which record family an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Dialogue,
    Decision,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dialogue => "dialogue",
            Self::Decision => "decision",
        }
    }
}

/// One turn of agent conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueRecord {
    /// Unique identity, time-derived and monotonic within a process.
    pub id: String,
    /// Owning user/session identifier.
    pub user_id: String,
    /// Speaker role.
    pub role: Role,
    /// Message body.
    pub content: String,
    /// Creation time, epoch milliseconds.
    pub timestamp_ms: u64,
    /// Free-form caller metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl DialogueRecord {
    /// Build a record with a freshly minted id and current timestamp.
    #[must_use]
    pub fn new(user_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        let timestamp_ms = epoch_ms();
        Self {
            id: mint_id("dlg", timestamp_ms),
            user_id: user_id.into(),
            role,
            content: content.into(),
            timestamp_ms,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry (builder style).
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check required fields and size ceilings before any durable write.
    pub fn validate(&self, max_content_bytes: usize) -> Result<()> {
        validate_common("dialogue", &self.id, &self.content, self.timestamp_ms, max_content_bytes)?;
        if self.user_id.trim().is_empty() {
            return Err(Error::validation("dialogue user_id must not be empty"));
        }
        Ok(())
    }
}

/// A decision the agent committed to, with the context that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Unique identity, time-derived and monotonic within a process.
    pub id: String,
    /// Situation the decision was made in.
    pub context: String,
    /// What was decided.
    pub outcome: String,
    /// Creation time, epoch milliseconds.
    pub timestamp_ms: u64,
    /// Free-form caller metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl DecisionRecord {
    /// Build a record with a freshly minted id and current timestamp.
    #[must_use]
    pub fn new(context: impl Into<String>, outcome: impl Into<String>) -> Self {
        let timestamp_ms = epoch_ms();
        Self {
            id: mint_id("dcn", timestamp_ms),
            context: context.into(),
            outcome: outcome.into(),
            timestamp_ms,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry (builder style).
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check required fields and size ceilings before any durable write.
    pub fn validate(&self, max_content_bytes: usize) -> Result<()> {
        validate_common("decision", &self.id, &self.outcome, self.timestamp_ms, max_content_bytes)?;
        if self.context.trim().is_empty() {
            return Err(Error::validation("decision context must not be empty"));
        }
        if self.context.len() > max_content_bytes {
            return Err(Error::validation(format!(
                "decision context exceeds size ceiling ({} > {max_content_bytes} bytes)",
                self.context.len()
            )));
        }
        Ok(())
    }
}

/// The agent's persistent profile: free-form fields merged across
/// updates. There is exactly one per store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub fields: BTreeMap<String, Value>,
    /// Time of the last applied update, epoch milliseconds. Zero when the
    /// profile has never been written.
    pub updated_at_ms: u64,
}

/// One logged profile mutation. Fields merge into the existing profile;
/// keys present here overwrite, absent keys are untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub fields: BTreeMap<String, Value>,
    /// Update time, epoch milliseconds. Carried in the log so replay
    /// reproduces `updated_at_ms` exactly.
    pub timestamp_ms: u64,
}

impl ProfileUpdate {
    /// Build an update carrying the current timestamp.
    #[must_use]
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self {
            fields,
            timestamp_ms: epoch_ms(),
        }
    }

    /// Check shape and size ceilings before any durable write.
    pub fn validate(&self, max_content_bytes: usize) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::validation("profile update must set at least one field"));
        }
        let serialized = serde_json::to_vec(&self.fields)?;
        if serialized.len() > max_content_bytes {
            return Err(Error::validation(format!(
                "profile update exceeds size ceiling ({} > {max_content_bytes} bytes)",
                serialized.len()
            )));
        }
        let horizon = epoch_ms().saturating_add(MAX_TIMESTAMP_SKEW_MS);
        if self.timestamp_ms > horizon {
            return Err(Error::validation(format!(
                "profile update timestamp {} is too far in the future",
                self.timestamp_ms
            )));
        }
        Ok(())
    }
}

fn validate_common(
    kind: &str,
    id: &str,
    body: &str,
    timestamp_ms: u64,
    max_content_bytes: usize,
) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::validation(format!("{kind} id must not be empty")));
    }
    if body.trim().is_empty() {
        return Err(Error::validation(format!("{kind} body must not be empty")));
    }
    if body.len() > max_content_bytes {
        return Err(Error::validation(format!(
            "{kind} body exceeds size ceiling ({} > {max_content_bytes} bytes)",
            body.len()
        )));
    }
    let horizon = epoch_ms().saturating_add(MAX_TIMESTAMP_SKEW_MS);
    if timestamp_ms > horizon {
        return Err(Error::validation(format!(
            "{kind} timestamp {timestamp_ms} is too far in the future"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 10 * 1024;

    #[test]
    fn minted_ids_are_unique() {
        let a = DialogueRecord::new("u1", Role::User, "hello");
        let b = DialogueRecord::new("u1", Role::User, "hello");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("dlg_"));
    }

    #[test]
    fn valid_records_pass() {
        let d = DialogueRecord::new("u1", Role::Assistant, "hi there");
        d.validate(MAX).unwrap();

        let c = DecisionRecord::new("user greeted us", "greet back");
        c.validate(MAX).unwrap();
    }

    #[test]
    fn empty_content_rejected() {
        let mut d = DialogueRecord::new("u1", Role::User, "x");
        d.content = "   ".to_string();
        assert!(matches!(d.validate(MAX), Err(Error::Validation(_))));
    }

    #[test]
    fn empty_user_id_rejected() {
        let mut d = DialogueRecord::new("", Role::User, "x");
        d.user_id = String::new();
        assert!(matches!(d.validate(MAX), Err(Error::Validation(_))));
    }

    #[test]
    fn oversized_content_rejected() {
        let d = DialogueRecord::new("u1", Role::User, "y".repeat(MAX + 1));
        let err = d.validate(MAX).unwrap_err();
        assert!(err.to_string().contains("size ceiling"));
    }

    #[test]
    fn far_future_timestamp_rejected() {
        let mut d = DialogueRecord::new("u1", Role::User, "x");
        d.timestamp_ms = epoch_ms() + MAX_TIMESTAMP_SKEW_MS + 60_000;
        assert!(matches!(d.validate(MAX), Err(Error::Validation(_))));
    }

    #[test]
    fn blank_decision_context_rejected() {
        let mut c = DecisionRecord::new("real context", "choose A");
        c.context = "   ".to_string();
        assert!(matches!(c.validate(MAX), Err(Error::Validation(_))));
    }

    #[test]
    fn profile_update_requires_fields() {
        let empty = ProfileUpdate::new(BTreeMap::new());
        assert!(matches!(empty.validate(MAX), Err(Error::Validation(_))));

        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Value::String("ada".to_string()));
        ProfileUpdate::new(fields).validate(MAX).unwrap();
    }

    #[test]
    fn oversized_profile_update_rejected() {
        let mut fields = BTreeMap::new();
        fields.insert("bio".to_string(), Value::String("y".repeat(MAX + 1)));
        let update = ProfileUpdate::new(fields);
        assert!(update.validate(MAX).unwrap_err().to_string().contains("size ceiling"));
    }

    #[test]
    fn serde_roundtrip_preserves_metadata() {
        let d = DialogueRecord::new("u1", Role::System, "boot")
            .with_metadata("source", Value::String("startup".to_string()));
        let json = serde_json::to_string(&d).unwrap();
        let back: DialogueRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn role_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(RecordKind::Decision.as_str(), "decision");
    }
}
