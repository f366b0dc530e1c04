//! Round-robin rotation rules
//!
//! The queue is scoped by `(activity name, group-set hash)`. Selection picks
//! the active user with the lowest assignment count (ties broken by user
//! id), bumps that count, and resets every active count to zero once all
//! active users have been picked at least once since the last reset.
//!
//! These functions are pure. Stores call them inside whatever atomic
//! section they provide (a serializable transaction for PostgreSQL, a write
//! lock for the in-memory store).

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies one rotation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub activity_name: String,
    pub group_set_hash: String,
}

impl QueueKey {
    pub fn new(activity_name: impl Into<String>, group_set_hash: impl Into<String>) -> Self {
        Self {
            activity_name: activity_name.into(),
            group_set_hash: group_set_hash.into(),
        }
    }
}

/// One user's slot in a rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRobinEntry {
    pub activity_name: String,
    pub group_set_hash: String,
    pub user_id: String,
    pub assignment_count: i64,
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub groups: Vec<String>,
}

impl RoundRobinEntry {
    pub fn new(key: &QueueKey, user_id: impl Into<String>, groups: &[String]) -> Self {
        Self {
            activity_name: key.activity_name.clone(),
            group_set_hash: key.group_set_hash.clone(),
            user_id: user_id.into(),
            assignment_count: 0,
            last_assigned_at: None,
            is_active: true,
            groups: groups.to_vec(),
        }
    }
}

/// Who was picked and whether the pick closed a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRobinSelection {
    pub user_id: String,
    /// The picked user's count right after the increment (before any reset)
    pub assignment_count: i64,
    pub round_reset: bool,
}

/// Changes made by a membership sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub reactivated: Vec<String>,
    pub deactivated: Vec<String>,
    pub unchanged: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.reactivated.is_empty() && self.deactivated.is_empty()
    }
}

/// Canonical groups: trimmed, deduplicated, sorted
pub fn normalize_groups<S: AsRef<str>>(groups: &[S]) -> Vec<String> {
    groups
        .iter()
        .map(|g| g.as_ref().trim())
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Stable hash of a group combination, independent of order and duplicates
pub fn group_set_hash<S: AsRef<str>>(groups: &[S]) -> String {
    let mut hasher = Sha256::new();
    for group in normalize_groups(groups) {
        hasher.update(group.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Pick the next user and apply the increment and reset rules in place
///
/// Returns `None` when the rotation has no active users.
pub fn select_next(
    entries: &mut [RoundRobinEntry],
    now: DateTime<Utc>,
) -> Option<RoundRobinSelection> {
    let picked = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_active)
        .min_by(|(_, a), (_, b)| {
            a.assignment_count
                .cmp(&b.assignment_count)
                .then_with(|| a.user_id.cmp(&b.user_id))
        })
        .map(|(idx, _)| idx)?;

    let entry = &mut entries[picked];
    entry.assignment_count += 1;
    entry.last_assigned_at = Some(now);
    let selection_count = entry.assignment_count;
    let user_id = entry.user_id.clone();

    let round_complete = entries
        .iter()
        .filter(|e| e.is_active)
        .all(|e| e.assignment_count > 0);

    if round_complete {
        for entry in entries.iter_mut().filter(|e| e.is_active) {
            entry.assignment_count = 0;
        }
    }

    Some(RoundRobinSelection {
        user_id,
        assignment_count: selection_count,
        round_reset: round_complete,
    })
}

/// Reconcile a rotation with the authoritative membership list
///
/// Departed users are deactivated with their count kept. New users join
/// with a zero count; returning users are reactivated with the count they
/// left with. Users still eligible are not touched.
pub fn sync_entries(
    entries: &mut Vec<RoundRobinEntry>,
    key: &QueueKey,
    groups: &[String],
    current_user_ids: &[String],
) -> SyncReport {
    let eligible: BTreeSet<&str> = current_user_ids.iter().map(String::as_str).collect();
    let mut report = SyncReport::default();

    let known: HashMap<String, usize> = entries
        .iter()
        .enumerate()
        .map(|(idx, e)| (e.user_id.clone(), idx))
        .collect();

    for entry in entries.iter_mut() {
        let should_be_active = eligible.contains(entry.user_id.as_str());
        match (entry.is_active, should_be_active) {
            (true, false) => {
                entry.is_active = false;
                report.deactivated.push(entry.user_id.clone());
            }
            (false, true) => {
                entry.is_active = true;
                entry.groups = groups.to_vec();
                report.reactivated.push(entry.user_id.clone());
            }
            (true, true) => report.unchanged += 1,
            (false, false) => {}
        }
    }

    for user_id in eligible {
        if !known.contains_key(user_id) {
            entries.push(RoundRobinEntry::new(key, user_id, groups));
            report.added.push(user_id.to_string());
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> QueueKey {
        QueueKey::new("AdminReview", group_set_hash(&["appraisers"]))
    }

    fn rotation(counts: &[(&str, i64)]) -> Vec<RoundRobinEntry> {
        let key = key();
        counts
            .iter()
            .map(|(user, count)| RoundRobinEntry {
                assignment_count: *count,
                ..RoundRobinEntry::new(&key, *user, &["appraisers".to_string()])
            })
            .collect()
    }

    #[test]
    fn test_group_set_hash_ignores_order_and_duplicates() {
        let a = group_set_hash(&["senior", "appraisers"]);
        let b = group_set_hash(&["appraisers", " senior ", "appraisers"]);
        let c = group_set_hash(&["appraisers"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_each_user_selected_once_per_round() {
        let mut entries = rotation(&[("carol", 0), ("alice", 0), ("bob", 0)]);
        let now = Utc::now();

        let picks: Vec<String> = (0..3)
            .map(|_| select_next(&mut entries, now).unwrap().user_id)
            .collect();

        assert_eq!(picks, vec!["alice", "bob", "carol"]);
        assert!(entries.iter().all(|e| e.assignment_count == 0));
    }

    #[test]
    fn test_saturated_round_resets_every_count() {
        let mut entries = rotation(&[("alice", 1), ("bob", 1), ("carol", 1)]);

        let selection = select_next(&mut entries, Utc::now()).unwrap();

        assert_eq!(selection.user_id, "alice");
        assert_eq!(selection.assignment_count, 2);
        assert!(selection.round_reset);
        assert!(entries.iter().all(|e| e.assignment_count == 0));
    }

    #[test]
    fn test_no_reset_while_someone_is_unpicked() {
        let mut entries = rotation(&[("alice", 0), ("bob", 0), ("carol", 0)]);

        let selection = select_next(&mut entries, Utc::now()).unwrap();

        assert!(!selection.round_reset);
        assert_eq!(entries[0].assignment_count, 1);
        assert!(entries[0].last_assigned_at.is_some());
    }

    #[test]
    fn test_inactive_users_are_skipped_and_ignored_by_reset() {
        let mut entries = rotation(&[("alice", 5), ("bob", 0), ("carol", 0)]);
        entries[0].is_active = false;

        let first = select_next(&mut entries, Utc::now()).unwrap();
        assert_eq!(first.user_id, "bob");
        assert!(!first.round_reset);

        let second = select_next(&mut entries, Utc::now()).unwrap();
        assert_eq!(second.user_id, "carol");
        assert!(second.round_reset);

        // Inactive history survives the reset
        assert_eq!(entries[0].assignment_count, 5);
        assert_eq!(entries[1].assignment_count, 0);
        assert_eq!(entries[2].assignment_count, 0);
    }

    #[test]
    fn test_empty_rotation_selects_nobody() {
        let mut entries = rotation(&[("alice", 0)]);
        entries[0].is_active = false;
        assert!(select_next(&mut entries, Utc::now()).is_none());
        assert!(select_next(&mut [], Utc::now()).is_none());
    }

    #[test]
    fn test_sync_adds_deactivates_and_reactivates() {
        let key = key();
        let groups = vec!["appraisers".to_string()];
        let mut entries = rotation(&[("alice", 3), ("bob", 2)]);
        entries[1].is_active = false;

        let report = sync_entries(
            &mut entries,
            &key,
            &groups,
            &["bob".to_string(), "dave".to_string()],
        );

        assert_eq!(report.deactivated, vec!["alice"]);
        assert_eq!(report.reactivated, vec!["bob"]);
        assert_eq!(report.added, vec!["dave"]);
        assert_eq!(report.unchanged, 0);

        let alice = entries.iter().find(|e| e.user_id == "alice").unwrap();
        assert!(!alice.is_active);
        assert_eq!(alice.assignment_count, 3);

        let bob = entries.iter().find(|e| e.user_id == "bob").unwrap();
        assert!(bob.is_active);
        assert_eq!(bob.assignment_count, 2);

        let dave = entries.iter().find(|e| e.user_id == "dave").unwrap();
        assert_eq!(dave.assignment_count, 0);
    }

    #[test]
    fn test_sync_is_idempotent() {
        let key = key();
        let groups = vec!["appraisers".to_string()];
        let users = vec!["alice".to_string(), "bob".to_string()];
        let mut entries = Vec::new();

        sync_entries(&mut entries, &key, &groups, &users);
        entries[0].assignment_count = 1;
        let second = sync_entries(&mut entries, &key, &groups, &users);

        assert!(second.is_noop());
        assert_eq!(second.unchanged, 2);
        assert_eq!(entries[0].assignment_count, 1);
    }
}
