// Worker configuration loaded from the environment

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};

use appraisal_workflow::maintenance::{MembershipSyncConfig, RetentionConfig};
use appraisal_workflow::messaging::OutboxDispatcherConfig;

/// Everything the worker needs to start
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string; required by [`crate::Worker::start`]
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub dispatcher: OutboxDispatcherConfig,
    pub retention: RetentionConfig,
    pub membership_sync: MembershipSyncConfig,
    /// Static group memberships (`GROUP_MEMBERS={"appraisers":["alice","bob"]}`)
    pub group_members: BTreeMap<String, Vec<String>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            dispatcher: OutboxDispatcherConfig::default(),
            retention: RetentionConfig::default(),
            membership_sync: MembershipSyncConfig::default(),
            group_members: BTreeMap::new(),
        }
    }
}

impl WorkerConfig {
    /// Read the configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let parse = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .with_context(|| format!("{key} must be a non-negative integer, got `{raw}`"))
                })
                .transpose()
        };

        let mut dispatcher = defaults.dispatcher;
        if let Some(size) = parse("OUTBOX_BATCH_SIZE")? {
            dispatcher.batch_size = (size as usize).max(1);
        }
        if let Some(ms) = parse("OUTBOX_POLL_INTERVAL_MS")? {
            dispatcher.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse("OUTBOX_LEASE_SECS")? {
            dispatcher.lease = Duration::from_secs(secs);
        }

        let mut retention = defaults.retention;
        if let Some(days) = parse("RETENTION_DAYS")? {
            retention = retention.with_retention(Duration::from_secs(days * 24 * 60 * 60));
        }
        if let Some(size) = parse("RETENTION_BATCH_SIZE")? {
            retention = retention.with_batch_size(size as usize);
        }
        if let Some(secs) = parse("RETENTION_INTERVAL_SECS")? {
            retention = retention.with_interval(Duration::from_secs(secs));
        }

        let mut membership_sync = defaults.membership_sync;
        if let Some(secs) = parse("MEMBERSHIP_SYNC_INTERVAL_SECS")? {
            membership_sync = membership_sync.with_interval(Duration::from_secs(secs));
        }

        let group_members = match lookup("GROUP_MEMBERS") {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .context("GROUP_MEMBERS must be a JSON object of group -> [user ids]")?,
            _ => BTreeMap::new(),
        };

        let max_connections = match parse("DATABASE_MAX_CONNECTIONS")? {
            Some(n) => u32::try_from(n).context("DATABASE_MAX_CONNECTIONS is too large")?,
            None => defaults.max_connections,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_connections,
            dispatcher,
            retention,
            membership_sync,
            group_members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = WorkerConfig::from_lookup(|_| None).unwrap();

        assert!(config.database_url.is_none());
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.dispatcher.batch_size, 100);
        assert_eq!(config.retention.retention, Duration::from_secs(7 * 24 * 60 * 60));
        assert!(config.group_members.is_empty());
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/appraisals"),
            ("OUTBOX_BATCH_SIZE", "25"),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
            ("RETENTION_DAYS", "2"),
            ("MEMBERSHIP_SYNC_INTERVAL_SECS", "60"),
            ("GROUP_MEMBERS", r#"{"appraisers": ["alice", "bob"]}"#),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/appraisals"));
        assert_eq!(config.dispatcher.batch_size, 25);
        assert_eq!(config.dispatcher.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retention.retention, Duration::from_secs(2 * 24 * 60 * 60));
        assert_eq!(config.membership_sync.interval, Duration::from_secs(60));
        assert_eq!(config.group_members["appraisers"], ["alice", "bob"]);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "many")])).unwrap_err();
        assert!(err.to_string().contains("OUTBOX_BATCH_SIZE"));

        let err = WorkerConfig::from_lookup(lookup(&[("GROUP_MEMBERS", "[1, 2]")])).unwrap_err();
        assert!(err.to_string().contains("GROUP_MEMBERS"));
    }
}
