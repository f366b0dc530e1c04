//! Group membership lookup

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::RwLock;

#[derive(Debug, thiserror::Error)]
#[error("user directory unavailable: {0}")]
pub struct DirectoryError(pub String);

/// Source of truth for which users belong to which groups
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// Users belonging to any of the groups, sorted and deduplicated
    async fn users_in_groups(&self, groups: &[String]) -> Result<Vec<String>, DirectoryError>;
}

/// Directory backed by an in-process map
///
/// Used by tests and by the worker binary, which loads memberships from
/// its configuration.
#[derive(Debug, Default)]
pub struct StaticUserDirectory {
    groups: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups<I, G, U>(groups: I) -> Self
    where
        I: IntoIterator<Item = (G, Vec<U>)>,
        G: Into<String>,
        U: Into<String>,
    {
        let directory = Self::new();
        for (group, users) in groups {
            let group = group.into();
            for user in users {
                directory.add_member(group.clone(), user);
            }
        }
        directory
    }

    pub fn add_member(&self, group: impl Into<String>, user_id: impl Into<String>) {
        self.groups
            .write()
            .entry(group.into())
            .or_default()
            .insert(user_id.into());
    }

    pub fn remove_member(&self, group: &str, user_id: &str) {
        if let Some(members) = self.groups.write().get_mut(group) {
            members.remove(user_id);
        }
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn users_in_groups(&self, groups: &[String]) -> Result<Vec<String>, DirectoryError> {
        let map = self.groups.read();
        let users: BTreeSet<String> = groups
            .iter()
            .filter_map(|g| map.get(g))
            .flat_map(|members| members.iter().cloned())
            .collect();
        Ok(users.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_union_of_groups_is_sorted_and_unique() {
        let directory = StaticUserDirectory::from_groups([
            ("appraisers", vec!["carol", "alice"]),
            ("senior", vec!["alice", "bob"]),
        ]);

        let users = directory
            .users_in_groups(&["appraisers".into(), "senior".into(), "ghosts".into()])
            .await
            .unwrap();
        assert_eq!(users, vec!["alice", "bob", "carol"]);

        directory.remove_member("senior", "bob");
        let users = directory.users_in_groups(&["senior".into()]).await.unwrap();
        assert_eq!(users, vec!["alice"]);
    }
}
