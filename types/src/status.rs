//! Host-facing status model.

use std::fmt;

/// Coarse status reported to the host console.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusLevel {
    Ok,
    Warning,
    Disconnected,
    BadConfig,
    Connecting,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Disconnected => "disconnected",
            Self::BadConfig => "badConfig",
            Self::Connecting => "connecting",
        };
        f.write_str(s)
    }
}

/// A problem currently affecting the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Issue {
    ManagerUnreachable,
    NoChannelSelected,
    NoInstancesRegistered,
    NoInstancesConnected,
    NoPrimaryElected,
}

impl Issue {
    fn describe(&self) -> &'static str {
        match self {
            Self::ManagerUnreachable => "Manager unreachable",
            Self::NoChannelSelected => "No channel selected",
            Self::NoInstancesRegistered => "No instances registered",
            Self::NoInstancesConnected => "No instances connected",
            Self::NoPrimaryElected => "No primary instance elected",
        }
    }

    /// Issues that resolve on their own once transports finish connecting.
    fn transient(&self) -> bool {
        matches!(self, Self::NoInstancesConnected | Self::NoPrimaryElected)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeStatus {
    pub level: StatusLevel,
    pub message: String,
}

impl BridgeStatus {
    pub fn bad_config(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::BadConfig,
            message: message.into(),
        }
    }

    /// Collapse the current issue set into a host status. `primary` carries
    /// the elected Instance's name and id for the all-good message.
    ///
    /// `disconnected` is reserved for the doubly-bad case: the Manager is
    /// unreachable AND no Instance connection survives. Issues that only
    /// reflect in-progress connections map to `connecting` as long as some
    /// Instance is registered.
    pub fn from_issues(issues: &[Issue], registered: usize, primary: Option<(&str, &str)>) -> Self {
        if issues.is_empty() {
            let message = match primary {
                Some((name, id)) => format!("Primary: '{name}' ({id})"),
                None => "OK".to_string(),
            };
            return Self {
                level: StatusLevel::Ok,
                message,
            };
        }

        let unreachable = issues.contains(&Issue::ManagerUnreachable);
        let none_connected = issues.contains(&Issue::NoInstancesConnected);
        let level = if unreachable && none_connected {
            StatusLevel::Disconnected
        } else if registered > 0 && issues.iter().all(Issue::transient) {
            StatusLevel::Connecting
        } else {
            StatusLevel::Warning
        };

        let message = issues
            .iter()
            .map(Issue::describe)
            .collect::<Vec<_>>()
            .join("; ");
        Self { level, message }
    }
}
