//! Bridge configuration.

use std::time::Duration;

use clap::Parser;
use uuid::Uuid;

use crate::utils::parse_duration;

/// Configuration for the bridge engine.
///
/// Every option can come from the command line or the environment; an
/// embedding host may equally well fill this in from its own configuration
/// store. The Manager host and port are required for the engine to start;
/// everything else has a working default.
#[derive(Clone, Debug, Parser)]
pub struct Options {
    /// Host name or address of the AdIT Manager.
    #[clap(long, env = "ADIT_MANAGER_HOST")]
    pub manager_host: Option<String>,

    /// TCP port of the Manager REST API.
    #[clap(long, env = "ADIT_MANAGER_PORT")]
    pub manager_port: Option<u16>,

    /// Channel to operate; unset means no channel selected.
    #[clap(long, env = "ADIT_CHANNEL_ID")]
    pub channel_id: Option<String>,

    /// Identity this console presents to Instances, used as the URL path
    /// when opening control transports. Generated and persisted through the
    /// host on first start when unset.
    #[clap(long, env = "ADIT_CONTROL_INTERFACE_ID")]
    pub control_interface_id: Option<Uuid>,

    /// Raise debug-level logging.
    #[clap(long, env = "ADIT_VERBOSE")]
    pub verbose: bool,

    /// Serialized definition cache, as previously persisted through the
    /// host. `{}` means no cache.
    #[clap(long, env = "ADIT_DEFINITION_CACHE", default_value = "{}")]
    pub definition_cache: String,

    /// Manager poll period.
    #[clap(
        long,
        env = "ADIT_MANAGER_POLL_INTERVAL",
        default_value = "5s",
        value_parser = parse_duration,
    )]
    pub manager_poll_interval: Duration,

    /// Instance status poll period.
    #[clap(
        long,
        env = "ADIT_STATUS_POLL_INTERVAL",
        default_value = "1s",
        value_parser = parse_duration,
    )]
    pub status_poll_interval: Duration,

    /// Control-transport heartbeat period.
    #[clap(
        long,
        env = "ADIT_HEARTBEAT_INTERVAL",
        default_value = "30s",
        value_parser = parse_duration,
    )]
    pub heartbeat_interval: Duration,

    /// Timeout for Manager HTTP requests.
    #[clap(
        long,
        env = "ADIT_MANAGER_HTTP_TIMEOUT",
        default_value = "2s",
        value_parser = parse_duration,
    )]
    pub manager_http_timeout: Duration,

    /// Timeout for Instance status requests.
    #[clap(
        long,
        env = "ADIT_INSTANCE_HTTP_TIMEOUT",
        default_value = "2s",
        value_parser = parse_duration,
    )]
    pub instance_http_timeout: Duration,

    /// Deadline for a control transport to finish connecting.
    #[clap(
        long,
        env = "ADIT_CONNECT_TIMEOUT",
        default_value = "5s",
        value_parser = parse_duration,
    )]
    pub connect_timeout: Duration,

    /// Deadline for a pong after a ping.
    #[clap(
        long,
        env = "ADIT_PONG_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration,
    )]
    pub pong_timeout: Duration,

    /// Delay before reopening a dropped control transport.
    #[clap(
        long,
        env = "ADIT_RECONNECT_DELAY",
        default_value = "3s",
        value_parser = parse_duration,
    )]
    pub reconnect_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self::parse_from(std::iter::empty::<String>())
    }
}

impl Options {
    /// `host:port` of the Manager, when both are configured.
    pub fn manager_endpoint(&self) -> Option<String> {
        let host = self.manager_host.as_deref()?;
        let port = self.manager_port?;
        Some(format!("{host}:{port}"))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_documented_timings() {
        let opt = Options::default();
        assert_eq!(opt.manager_poll_interval, Duration::from_secs(5));
        assert_eq!(opt.status_poll_interval, Duration::from_secs(1));
        assert_eq!(opt.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(opt.manager_http_timeout, Duration::from_secs(2));
        assert_eq!(opt.instance_http_timeout, Duration::from_secs(2));
        assert_eq!(opt.connect_timeout, Duration::from_secs(5));
        assert_eq!(opt.pong_timeout, Duration::from_secs(10));
        assert_eq!(opt.reconnect_delay, Duration::from_secs(3));
        assert_eq!(opt.definition_cache, "{}");
        assert_eq!(opt.manager_endpoint(), None);
    }

    #[test]
    fn manager_endpoint_requires_both_parts() {
        let mut opt = Options::default();
        opt.manager_host = Some("10.0.0.1".into());
        assert_eq!(opt.manager_endpoint(), None);
        opt.manager_port = Some(8000);
        assert_eq!(opt.manager_endpoint().as_deref(), Some("10.0.0.1:8000"));
    }

    #[test]
    fn cli_overrides_parse() {
        let opt = Options::parse_from([
            "bridge",
            "--manager-host",
            "10.0.0.1",
            "--manager-port",
            "8000",
            "--channel-id",
            "CH1",
            "--manager-poll-interval",
            "250ms",
        ]);
        assert_eq!(opt.manager_host.as_deref(), Some("10.0.0.1"));
        assert_eq!(opt.channel_id.as_deref(), Some("CH1"));
        assert_eq!(opt.manager_poll_interval, Duration::from_millis(250));
    }
}
