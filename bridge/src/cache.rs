//! Definition-cache management.
//!
//! Wraps the single persisted [`CacheRecord`] for the configured Manager
//! endpoint. The serialized form round-trips through the host's config
//! store; [`DefinitionCache::take_serialized`] yields a new serialization
//! only when the content actually changed, so the orchestrator never writes
//! (or logs) redundantly.

use adit_types::{
    CacheRecord, InstanceDescriptor, RuleDescriptor, VariableDescriptor, CACHE_VERSION,
};
use chrono::Utc;

pub struct DefinitionCache {
    manager_endpoint: String,
    persisted: Option<CacheRecord>,
    dirty: bool,
}

impl DefinitionCache {
    /// Adopt the raw persisted blob from configuration. Undecodable content
    /// counts as no cache.
    pub fn new(raw: &str, manager_endpoint: &str) -> Self {
        Self {
            manager_endpoint: manager_endpoint.to_string(),
            persisted: serde_json::from_str(raw).ok(),
            dirty: false,
        }
    }

    /// The cached record for `channel_id`, if one is present and was written
    /// under the current configuration by a compatible build. An invalid
    /// record is discarded so the store comes clean on the next write.
    pub fn load(&mut self, channel_id: &str) -> Option<CacheRecord> {
        let record = self.persisted.as_ref()?;
        if record.matches(&self.manager_endpoint, channel_id) {
            self.persisted.clone()
        } else {
            tracing::debug!(
                cached_endpoint = %record.manager_endpoint,
                cached_channel = %record.channel_id,
                version = record.version,
                "discarding definition cache written under a different configuration",
            );
            self.persisted = None;
            self.dirty = true;
            None
        }
    }

    /// Remember the current definitions. No-op when every blob matches what
    /// is already persisted, which also leaves the timestamp alone.
    pub fn save(
        &mut self,
        channel_id: &str,
        channel_name: &str,
        instances: &[InstanceDescriptor],
        variables: &[VariableDescriptor],
        rules: &[RuleDescriptor],
    ) {
        if let Some(prev) = &self.persisted {
            if prev.version == CACHE_VERSION
                && prev.manager_endpoint == self.manager_endpoint
                && prev.channel_id == channel_id
                && prev.channel_name == channel_name
                && prev.instances == instances
                && prev.variables == variables
                && prev.rules == rules
            {
                return;
            }
        }
        self.persisted = Some(CacheRecord {
            version: CACHE_VERSION,
            timestamp: Utc::now(),
            manager_endpoint: self.manager_endpoint.clone(),
            channel_id: channel_id.to_string(),
            channel_name: channel_name.to_string(),
            instances: instances.to_vec(),
            variables: variables.to_vec(),
            rules: rules.to_vec(),
        });
        self.dirty = true;
    }

    pub fn clear(&mut self) {
        if self.persisted.take().is_some() {
            self.dirty = true;
        }
    }

    /// The serialized form to persist, when it changed since the last call.
    pub fn take_serialized(&mut self) -> Option<String> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        let raw = match &self.persisted {
            Some(record) => serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string()),
            None => "{}".to_string(),
        };
        Some(raw)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    const ENDPOINT: &str = "10.0.0.1:8000";

    fn instance() -> InstanceDescriptor {
        InstanceDescriptor {
            id: "i1".into(),
            name: "adit-1".into(),
            description: String::new(),
            ip_address: "10.0.0.2".into(),
            api_port: 8001,
            control_port: 9091,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut cache = DefinitionCache::new("{}", ENDPOINT);
        assert!(cache.load("CH1").is_none());
        assert!(cache.take_serialized().is_none());

        cache.save("CH1", "News", &[instance()], &[], &[]);
        let raw = cache.take_serialized().expect("first save persists");

        // A restart adopts the persisted blob and finds the record again.
        let mut reloaded = DefinitionCache::new(&raw, ENDPOINT);
        let record = reloaded.load("CH1").expect("cache hit");
        assert_eq!(record.channel_name, "News");
        assert_eq!(record.instances, vec![instance()]);
    }

    #[test]
    fn identical_save_does_not_rewrite() {
        let mut cache = DefinitionCache::new("{}", ENDPOINT);
        cache.save("CH1", "News", &[instance()], &[], &[]);
        assert!(cache.take_serialized().is_some());

        cache.save("CH1", "News", &[instance()], &[], &[]);
        assert!(cache.take_serialized().is_none());

        let mut changed = vec![instance()];
        changed[0].name = "adit-1b".into();
        cache.save("CH1", "News", &changed, &[], &[]);
        assert!(cache.take_serialized().is_some());
    }

    #[test]
    fn mismatched_configuration_clears_on_load() {
        let mut cache = DefinitionCache::new("{}", ENDPOINT);
        cache.save("CH1", "News", &[instance()], &[], &[]);
        let raw = cache.take_serialized().unwrap();

        // Same blob, different manager endpoint: the record is discarded
        // and the discard is persisted.
        let mut other = DefinitionCache::new(&raw, "10.0.0.9:8000");
        assert!(other.load("CH1").is_none());
        assert_eq!(other.take_serialized().as_deref(), Some("{}"));

        // Same manager, different channel.
        let mut other = DefinitionCache::new(&raw, ENDPOINT);
        assert!(other.load("CH2").is_none());
        assert_eq!(other.take_serialized().as_deref(), Some("{}"));
    }

    #[test]
    fn version_mismatch_clears_on_load() {
        let mut cache = DefinitionCache::new("{}", ENDPOINT);
        cache.save("CH1", "News", &[instance()], &[], &[]);
        let raw = cache.take_serialized().unwrap();

        let mut doctored: serde_json::Value = serde_json::from_str(&raw).unwrap();
        doctored["version"] = serde_json::json!(CACHE_VERSION + 1);
        let mut cache = DefinitionCache::new(&doctored.to_string(), ENDPOINT);
        assert!(cache.load("CH1").is_none());
    }

    #[test]
    fn garbage_counts_as_no_cache() {
        let mut cache = DefinitionCache::new("definitely not json", ENDPOINT);
        assert!(cache.load("CH1").is_none());
        // Nothing was persisted, so there is nothing to clear.
        assert!(cache.take_serialized().is_none());
    }

    #[test]
    fn clear_is_persisted_once() {
        let mut cache = DefinitionCache::new("{}", ENDPOINT);
        cache.save("CH1", "News", &[instance()], &[], &[]);
        cache.take_serialized().unwrap();

        cache.clear();
        assert_eq!(cache.take_serialized().as_deref(), Some("{}"));
        cache.clear();
        assert!(cache.take_serialized().is_none());
    }
}
