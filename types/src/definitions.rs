//! Wire-format descriptors served by the Manager REST API.

use serde::{Deserialize, Serialize};

/// A channel known to the Manager.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChannelDescriptor {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// A variable defined for a channel. Values are pushed by the primary
/// Instance over the control transport; the Manager only serves the
/// definitions.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct VariableDescriptor {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// A messaging rule exactly as the Manager serves it. The interesting part
/// of the rule definition lives in an embedded JSON string.
#[derive(Clone, Debug, Deserialize)]
pub struct RawRule {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "JSON", default)]
    pub json: String,
}

#[derive(Deserialize)]
struct EmbeddedRule {
    #[serde(rename = "RuleType")]
    rule_type: i64,
}

const MANUAL_RULE_TYPE: i64 = 1;

impl RawRule {
    /// A rule is invocable from the console only when its embedded JSON
    /// carries `RuleType == 1`. A rule whose embedded JSON does not decode
    /// is excluded rather than failing the whole fetch.
    pub fn as_manual(&self) -> Option<RuleDescriptor> {
        let embedded: EmbeddedRule = serde_json::from_str(&self.json).ok()?;
        (embedded.rule_type == MANUAL_RULE_TYPE).then(|| RuleDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
        })
    }
}

/// A manual messaging rule, after filtering.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RuleDescriptor {
    pub id: String,
    pub name: String,
}

/// An Instance registration as served by the Manager.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InstanceDescriptor {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "APIPortNumber")]
    pub api_port: u16,
    #[serde(rename = "ControlInterfacePortNumber")]
    pub control_port: u16,
}

/// One channel's worth of definitions, refreshed atomically per poll cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DefinitionSet {
    pub channels: Vec<ChannelDescriptor>,
    pub variables: Vec<VariableDescriptor>,
    pub rules: Vec<RuleDescriptor>,
}

impl DefinitionSet {
    /// Name of a channel id, when the Manager listed it.
    pub fn channel_name(&self, id: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.as_str())
    }
}

/// Canonical serialized form used for change detection. Externally visible
/// notifications fire only when this differs from the previous cycle's.
pub fn fingerprint<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn instance_descriptor_decodes_manager_shape() {
        let body = r#"{
            "ID": "a3a24714-b177-4b29-a1b6-e3d2fdfb0ec1",
            "Name": "adit-1",
            "Description": "rack 4",
            "IPAddress": "10.0.0.2",
            "APIPortNumber": 8001,
            "ControlInterfacePortNumber": 9091
        }"#;
        let desc: InstanceDescriptor = serde_json::from_str(body).unwrap();
        assert_eq!(desc.name, "adit-1");
        assert_eq!(desc.api_port, 8001);
        assert_eq!(desc.control_port, 9091);
    }

    #[test]
    fn missing_description_defaults_to_empty() {
        let body = r#"{
            "ID": "i1",
            "Name": "adit-1",
            "IPAddress": "10.0.0.2",
            "APIPortNumber": 8001,
            "ControlInterfacePortNumber": 9091
        }"#;
        let desc: InstanceDescriptor = serde_json::from_str(body).unwrap();
        assert_eq!(desc.description, "");
    }

    #[test]
    fn manual_rule_filter() {
        let manual = RawRule {
            id: "r1".into(),
            name: "break in".into(),
            json: r#"{"RuleType":1,"Priority":3}"#.into(),
        };
        let scheduled = RawRule {
            id: "r2".into(),
            name: "overnight".into(),
            json: r#"{"RuleType":2}"#.into(),
        };
        let corrupt = RawRule {
            id: "r3".into(),
            name: "broken".into(),
            json: "{not json".into(),
        };
        assert_eq!(
            manual.as_manual(),
            Some(RuleDescriptor {
                id: "r1".into(),
                name: "break in".into()
            })
        );
        assert_eq!(scheduled.as_manual(), None);
        assert_eq!(corrupt.as_manual(), None);
    }

    #[test]
    fn fingerprint_is_order_sensitive() {
        let a = vec![
            VariableDescriptor {
                id: "v1".into(),
                name: "score".into(),
            },
            VariableDescriptor {
                id: "v2".into(),
                name: "clock".into(),
            },
        ];
        let mut b = a.clone();
        b.reverse();
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
    }
}
