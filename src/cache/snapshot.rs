//! Immutable trigger snapshots.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::trigger::{TriggerId, TriggerRecord, TriggerRow};

/// An atomically published, immutable view of the active trigger set.
///
/// Snapshots are shared as `Arc<TriggerSnapshot>` and replaced wholesale on
/// every refresh; nothing mutates one after publication.
#[derive(Debug)]
pub struct TriggerSnapshot {
    generation: u64,
    fingerprint: blake3::Hash,
    loaded_at: DateTime<Utc>,
    triggers: Vec<Arc<TriggerRecord>>,
    skipped: usize,
}

impl TriggerSnapshot {
    /// The empty snapshot published before the first refresh.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_parts(0, &[], Vec::new(), 0)
    }

    pub(crate) fn from_parts(
        generation: u64,
        rows: &[TriggerRow],
        triggers: Vec<Arc<TriggerRecord>>,
        skipped: usize,
    ) -> Self {
        Self {
            generation,
            fingerprint: fingerprint(rows),
            loaded_at: Utc::now(),
            triggers,
            skipped,
        }
    }

    /// Monotonic refresh counter; later snapshots have larger generations.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Stable hash of the rows this snapshot was built from.
    #[must_use]
    pub const fn fingerprint(&self) -> &blake3::Hash {
        &self.fingerprint
    }

    /// When the rows were read.
    #[must_use]
    pub const fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Compiled triggers in store order.
    #[must_use]
    pub fn triggers(&self) -> &[Arc<TriggerRecord>] {
        &self.triggers
    }

    /// Number of rows dropped because they failed to compile.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }

    /// Number of active triggers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Whether there are no active triggers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Look up a trigger by id.
    #[must_use]
    pub fn get(&self, id: TriggerId) -> Option<&Arc<TriggerRecord>> {
        self.triggers.iter().find(|t| t.id == id)
    }
}

/// Hash of the row contents, excluding `last_fired_at` so that cooldown
/// bookkeeping alone does not look like a trigger-set change.
fn fingerprint(rows: &[TriggerRow]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for row in rows {
        hasher.update(row.id.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(row.pattern.as_bytes());
        hasher.update(&[0]);
        hasher.update(format!("{:?}", row.kind).as_bytes());
        hasher.update(&[0]);
        hasher.update(row.response_text.as_deref().unwrap_or_default().as_bytes());
        hasher.update(&[0]);
        hasher.update(row.alert_mapping.as_deref().unwrap_or_default().as_bytes());
        hasher.update(&[0]);
        hasher.update(&row.cooldown_minutes.to_le_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::NewTrigger;

    #[test]
    fn fingerprint_ignores_last_fired() {
        let mut row = NewTrigger::reply("a", "b").into_row(TriggerId::new());
        let before = fingerprint(std::slice::from_ref(&row));
        row.last_fired_at = 99.0;
        assert_eq!(before, fingerprint(std::slice::from_ref(&row)));
        row.pattern = "c".to_string();
        assert_ne!(before, fingerprint(std::slice::from_ref(&row)));
    }

    #[test]
    fn empty_snapshot_is_generation_zero() {
        let snap = TriggerSnapshot::empty();
        assert_eq!(snap.generation(), 0);
        assert!(snap.is_empty());
    }
}
