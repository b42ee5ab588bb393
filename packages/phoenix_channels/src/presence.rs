//! Client-side presence reconciliation.
//!
//! Servers publish a full `presence_state` snapshot on join and incremental
//! `presence_diff` payloads afterwards. Both are maps from a member key to an
//! entry holding one meta per connection, each tagged with a `phx_ref`. The
//! functions here are pure: they take the current state by reference and
//! return the next one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::Payload;

/// Event carrying a full snapshot.
pub const PRESENCE_STATE: &str = "presence_state";
/// Event carrying joins and leaves since the last snapshot or diff.
pub const PRESENCE_DIFF: &str = "presence_diff";

/// One connection of a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub phx_ref: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Payload>,
}

impl PresenceMeta {
    pub fn new(phx_ref: impl Into<String>) -> Self {
        Self {
            phx_ref: phx_ref.into(),
            fields: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceEntry {
    #[serde(default)]
    pub metas: Vec<PresenceMeta>,
    /// Anything else the server attached to the member.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Payload>,
}

impl PresenceEntry {
    fn refs(&self) -> impl Iterator<Item = &str> {
        self.metas.iter().map(|meta| meta.phx_ref.as_str())
    }

    fn has_ref(&self, phx_ref: &str) -> bool {
        self.refs().any(|r| r == phx_ref)
    }

    /// Same entry carrying only `metas`.
    fn with_metas(&self, metas: Vec<PresenceMeta>) -> Self {
        Self {
            metas,
            extra: self.extra.clone(),
        }
    }
}

/// Member key to entry, iterated in key order.
pub type PresenceState = BTreeMap<String, PresenceEntry>;

/// Parse a `presence_state` payload.
pub fn state_from_payload(payload: &Payload) -> Result<PresenceState, serde_json::Error> {
    PresenceState::deserialize(payload)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceState,
    #[serde(default)]
    pub leaves: PresenceState,
}

impl PresenceDiff {
    /// Parse a `presence_diff` payload.
    pub fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// Classify the difference between two snapshots. Keys only in `old` leave
/// with all their metas, keys only in `new` join with all theirs, and for
/// shared keys only metas whose `phx_ref` differs are classified.
pub fn diff_states(old: &PresenceState, new: &PresenceState) -> PresenceDiff {
    let mut diff = PresenceDiff::default();

    for (key, entry) in old {
        if !new.contains_key(key) {
            diff.leaves.insert(key.clone(), entry.clone());
        }
    }

    for (key, new_entry) in new {
        let Some(current) = old.get(key) else {
            diff.joins.insert(key.clone(), new_entry.clone());
            continue;
        };
        let joined: Vec<PresenceMeta> = new_entry
            .metas
            .iter()
            .filter(|meta| !current.has_ref(&meta.phx_ref))
            .cloned()
            .collect();
        let left: Vec<PresenceMeta> = current
            .metas
            .iter()
            .filter(|meta| !new_entry.has_ref(&meta.phx_ref))
            .cloned()
            .collect();
        if !joined.is_empty() {
            diff.joins.insert(key.clone(), new_entry.with_metas(joined));
        }
        if !left.is_empty() {
            diff.leaves.insert(key.clone(), current.with_metas(left));
        }
    }

    diff
}

/// Reconcile `state` with a full snapshot, reporting the changes through the
/// callbacks exactly as [`sync_diff`] does.
pub fn sync_state(
    state: &PresenceState,
    new_state: &PresenceState,
    on_join: impl FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    on_leave: impl FnMut(&str, &PresenceEntry, &PresenceEntry),
) -> PresenceState {
    let diff = diff_states(state, new_state);
    sync_diff(state, &diff, on_join, on_leave)
}

/// Apply a diff.
///
/// Joins are applied first. A join for a known key prepends the new metas to
/// the current ones; `on_join(key, current, joined)` sees the entry as it was
/// before. Leaves then drop metas by `phx_ref`; `on_leave(key, remaining,
/// left)` sees what is left, and a key with no metas left is removed. Leaves
/// for unknown keys are ignored.
pub fn sync_diff(
    state: &PresenceState,
    diff: &PresenceDiff,
    mut on_join: impl FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    mut on_leave: impl FnMut(&str, &PresenceEntry, &PresenceEntry),
) -> PresenceState {
    let mut next = state.clone();

    for (key, joined) in &diff.joins {
        let current = next.get(key).cloned();
        let merged = match &current {
            Some(current) => {
                let metas = joined
                    .metas
                    .iter()
                    .chain(current.metas.iter())
                    .cloned()
                    .collect();
                joined.with_metas(metas)
            }
            None => joined.clone(),
        };
        next.insert(key.clone(), merged);
        on_join(key, current.as_ref(), joined);
    }

    for (key, left) in &diff.leaves {
        let Some(current) = next.get_mut(key) else {
            continue;
        };
        current.metas.retain(|meta| !left.has_ref(&meta.phx_ref));
        on_leave(key, current, left);
        if current.metas.is_empty() {
            next.remove(key);
        }
    }

    next
}

/// Map every member through `chooser`, in key order.
pub fn list<T>(state: &PresenceState, mut chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
    state
        .iter()
        .map(|(key, entry)| chooser(key, entry))
        .collect()
}
