//! Persisted definition cache record.
//!
//! The bridge survives Manager outages by persisting the last successfully
//! fetched definitions through the host's configuration store. The record is
//! keyed by manager endpoint and channel id so a cache written under one
//! configuration is never replayed under another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definitions::{InstanceDescriptor, RuleDescriptor, VariableDescriptor};

/// Bumped whenever the persisted shape changes; readers discard mismatches.
pub const CACHE_VERSION: u32 = 2;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CacheRecord {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub manager_endpoint: String,
    pub channel_id: String,
    pub channel_name: String,
    pub instances: Vec<InstanceDescriptor>,
    pub variables: Vec<VariableDescriptor>,
    pub rules: Vec<RuleDescriptor>,
}

impl CacheRecord {
    /// True when the record was written under the given configuration and by
    /// a compatible build.
    pub fn matches(&self, manager_endpoint: &str, channel_id: &str) -> bool {
        self.version == CACHE_VERSION
            && self.manager_endpoint == manager_endpoint
            && self.channel_id == channel_id
    }

    /// Human description of how stale the record is, e.g. "2 minutes ago".
    pub fn age(&self, now: DateTime<Utc>) -> String {
        let secs = (now - self.timestamp).num_seconds().max(0);
        if secs < 60 {
            plural(secs, "second")
        } else if secs < 3600 {
            plural(secs / 60, "minute")
        } else if secs < 86_400 {
            plural(secs / 3600, "hour")
        } else {
            plural(secs / 86_400, "day")
        }
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;

    fn record() -> CacheRecord {
        CacheRecord {
            version: CACHE_VERSION,
            timestamp: Utc::now(),
            manager_endpoint: "10.0.0.1:8000".into(),
            channel_id: "CH1".into(),
            channel_name: "News".into(),
            instances: vec![],
            variables: vec![],
            rules: vec![],
        }
    }

    #[test]
    fn round_trips_through_json() {
        let record = record();
        let raw = serde_json::to_string(&record).unwrap();
        let loaded: CacheRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn matches_requires_version_and_keys() {
        let record = record();
        assert!(record.matches("10.0.0.1:8000", "CH1"));
        assert!(!record.matches("10.0.0.1:8001", "CH1"));
        assert!(!record.matches("10.0.0.1:8000", "CH2"));

        let stale = CacheRecord {
            version: CACHE_VERSION - 1,
            ..record
        };
        assert!(!stale.matches("10.0.0.1:8000", "CH1"));
    }

    #[test]
    fn age_reads_naturally() {
        let now = Utc::now();
        let mut record = record();

        record.timestamp = now - TimeDelta::seconds(1);
        assert_eq!(record.age(now), "1 second ago");
        record.timestamp = now - TimeDelta::seconds(125);
        assert_eq!(record.age(now), "2 minutes ago");
        record.timestamp = now - TimeDelta::hours(5);
        assert_eq!(record.age(now), "5 hours ago");
        record.timestamp = now - TimeDelta::days(3);
        assert_eq!(record.age(now), "3 days ago");

        // A clock that ran backwards never reports a negative age.
        record.timestamp = now + TimeDelta::seconds(30);
        assert_eq!(record.age(now), "0 seconds ago");
    }
}
