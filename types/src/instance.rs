//! Per-Instance connection records and status payloads.

use std::fmt;

use serde::{Deserialize, Deserializer};

use crate::definitions::InstanceDescriptor;

/// Control-transport state for a single Instance.
///
/// Legal transitions are `Disconnected → Connecting → {Connected |
/// Disconnected}` and `Connected → Disconnected`; the supervisor never
/// re-enters `Connecting` without passing through `Disconnected`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Registry-owned view of one Instance.
///
/// The connection supervisor exclusively owns the transport and its timers;
/// this record mirrors the supervisor's reported connection state plus the
/// results of the most recent status poll.
#[derive(Clone, Debug)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub ip_address: String,
    pub api_port: u16,
    pub control_port: u16,
    pub conn_state: ConnState,
    /// Last `Primary` flag returned by the status endpoint; `None` until the
    /// first successful poll.
    pub reported_primary: Option<bool>,
    pub last_status_code: Option<i64>,
    pub status_poll_failures: u32,
}

impl InstanceRecord {
    pub fn new(desc: &InstanceDescriptor) -> Self {
        Self {
            id: desc.id.clone(),
            name: desc.name.clone(),
            description: desc.description.clone(),
            ip_address: desc.ip_address.clone(),
            api_port: desc.api_port,
            control_port: desc.control_port,
            conn_state: ConnState::default(),
            reported_primary: None,
            last_status_code: None,
            status_poll_failures: 0,
        }
    }

    /// An Instance is healthy iff its control transport is currently
    /// connected. Status-poll failures never affect this.
    pub fn healthy(&self) -> bool {
        self.conn_state == ConnState::Connected
    }

    /// Refresh the Manager-mutable metadata in place, leaving connection
    /// state and poll counters alone.
    pub fn update_metadata(&mut self, desc: &InstanceDescriptor) {
        self.name.clone_from(&desc.name);
        self.description.clone_from(&desc.description);
        self.ip_address.clone_from(&desc.ip_address);
        self.api_port = desc.api_port;
        self.control_port = desc.control_port;
    }
}

/// Decoded `/status` response.
///
/// Instance builds disagree on the payload shape: some serve the status code
/// flat (`{"Status": 3, "Primary": true}`) and some nested
/// (`{"Status": {"Status": 3, ...}, "Primary": true}`). Both decode to the
/// same semantic pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceStatus {
    pub status_code: i64,
    pub primary: bool,
}

#[derive(Deserialize)]
struct RawInstanceStatus {
    #[serde(rename = "Status")]
    status: RawStatusCode,
    #[serde(rename = "Primary")]
    primary: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStatusCode {
    Flat(i64),
    Nested {
        #[serde(rename = "Status")]
        status: i64,
    },
}

impl<'de> Deserialize<'de> for InstanceStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawInstanceStatus::deserialize(deserializer)?;
        let status_code = match raw.status {
            RawStatusCode::Flat(code) => code,
            RawStatusCode::Nested { status } => status,
        };
        Ok(Self {
            status_code,
            primary: raw.primary,
        })
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn desc() -> InstanceDescriptor {
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
    fn healthy_follows_conn_state() {
        let mut record = InstanceRecord::new(&desc());
        assert!(!record.healthy());
        record.conn_state = ConnState::Connecting;
        assert!(!record.healthy());
        record.conn_state = ConnState::Connected;
        assert!(record.healthy());

        // A failing status poll leaves health alone.
        record.status_poll_failures += 1;
        assert!(record.healthy());
    }

    #[test]
    fn metadata_update_preserves_connection_state() {
        let mut record = InstanceRecord::new(&desc());
        record.conn_state = ConnState::Connected;
        record.reported_primary = Some(true);

        let mut renamed = desc();
        renamed.name = "adit-1b".into();
        renamed.control_port = 9092;
        record.update_metadata(&renamed);

        assert_eq!(record.name, "adit-1b");
        assert_eq!(record.control_port, 9092);
        assert_eq!(record.conn_state, ConnState::Connected);
        assert_eq!(record.reported_primary, Some(true));
    }

    #[test]
    fn status_decodes_flat_shape() {
        let status: InstanceStatus =
            serde_json::from_str(r#"{"Status": 3, "Primary": true}"#).unwrap();
        assert_eq!(
            status,
            InstanceStatus {
                status_code: 3,
                primary: true
            }
        );
    }

    #[test]
    fn status_decodes_nested_shape() {
        let status: InstanceStatus = serde_json::from_str(
            r#"{"Status": {"Status": 5, "Detail": "standby"}, "Primary": false, "Uptime": 120}"#,
        )
        .unwrap();
        assert_eq!(
            status,
            InstanceStatus {
                status_code: 5,
                primary: false
            }
        );
    }

    #[test]
    fn status_rejects_missing_primary() {
        assert!(serde_json::from_str::<InstanceStatus>(r#"{"Status": 3}"#).is_err());
    }
}
