use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::EngineError;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_NETWORK_CHANGE_POLL_INTERVAL: Duration = Duration::from_millis(15_000);
pub const DEFAULT_STATE_EXPIRATION_INTERVAL: Duration = Duration::from_millis(120_000);
pub const DEFAULT_STATE_HEARTBEAT_WINDOW: Duration = Duration::from_millis(30_000);
pub const DEFAULT_FAST_POLLING_DURATION: Duration = Duration::from_millis(10_000);
pub const DEFAULT_FAST_POLLING_RATE: Duration = Duration::from_millis(1_500);
pub const DEFAULT_SLOW_POLLING_RATE: Duration = Duration::from_millis(5_000);
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_millis(8_000);

/// One ICE server entry; STUN entries normally carry no credentials.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, credential: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Rewrites a session description before it leaves this process.
#[derive(Clone)]
pub struct SdpTransform(Arc<dyn Fn(&str) -> String + Send + Sync>);

impl SdpTransform {
    pub fn new(transform: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(transform))
    }

    pub fn apply(&self, sdp: &str) -> String {
        (self.0)(sdp)
    }
}

impl fmt::Debug for SdpTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SdpTransform(..)")
    }
}

/// Per-connection knobs handed to the connector for every new peer.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub data_channel_label: String,
    pub ordered: bool,
    pub ice_disconnected_timeout: Duration,
    pub ice_failed_timeout: Duration,
    pub ice_keepalive_interval: Duration,
    pub sdp_transform: Option<SdpTransform>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            data_channel_label: "data".to_string(),
            ordered: true,
            ice_disconnected_timeout: Duration::from_secs(3),
            ice_failed_timeout: Duration::from_secs(10),
            ice_keepalive_interval: Duration::from_millis(500),
            sdp_transform: None,
        }
    }
}

/// Caller hook applied to a fresh copy of [`ConnectionOptions`] each time a
/// connection object is built, renegotiations included.
#[derive(Clone)]
pub struct ConnectionCustomizer(Arc<dyn Fn(&mut ConnectionOptions) + Send + Sync>);

impl ConnectionCustomizer {
    pub fn new(customize: impl Fn(&mut ConnectionOptions) + Send + Sync + 'static) -> Self {
        Self(Arc::new(customize))
    }

    pub fn apply(&self, options: &mut ConnectionOptions) {
        (self.0)(options)
    }
}

impl fmt::Debug for ConnectionCustomizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionCustomizer(..)")
    }
}

#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Base URL of the HTTP relay. Required unless a relay client is injected.
    pub worker_url: Option<Url>,
    pub stun_ice_servers: Vec<IceServerConfig>,
    pub turn_ice_servers: Vec<IceServerConfig>,
    pub network_change_poll_interval: Duration,
    pub state_expiration_interval: Duration,
    pub state_heartbeat_window: Duration,
    pub fast_polling_duration: Duration,
    pub fast_polling_rate: Duration,
    pub slow_polling_rate: Duration,
    /// Quiet time after which the scheduler idles. `None` disables idling.
    pub idle_polling_after: Option<Duration>,
    /// Poll rate while idle. `None` suspends polling until new activity.
    pub idle_polling_rate: Option<Duration>,
    pub relay_timeout: Duration,
    pub connection_options: ConnectionOptions,
    pub connection_customizer: Option<ConnectionCustomizer>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            worker_url: None,
            stun_ice_servers: vec![IceServerConfig::new(DEFAULT_STUN_SERVER)],
            turn_ice_servers: Vec::new(),
            network_change_poll_interval: DEFAULT_NETWORK_CHANGE_POLL_INTERVAL,
            state_expiration_interval: DEFAULT_STATE_EXPIRATION_INTERVAL,
            state_heartbeat_window: DEFAULT_STATE_HEARTBEAT_WINDOW,
            fast_polling_duration: DEFAULT_FAST_POLLING_DURATION,
            fast_polling_rate: DEFAULT_FAST_POLLING_RATE,
            slow_polling_rate: DEFAULT_SLOW_POLLING_RATE,
            idle_polling_after: None,
            idle_polling_rate: None,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
            connection_options: ConnectionOptions::default(),
            connection_customizer: None,
        }
    }
}

impl EngineOptions {
    /// Defaults overlaid with any `RENDEZVOUS_*` environment variables.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut options = Self::default();

        if let Some(raw) = env_string("RENDEZVOUS_WORKER_URL") {
            options.worker_url = Some(parse_worker_url(&raw)?);
        }
        if let Some(raw) = env_string("RENDEZVOUS_STUN_SERVERS") {
            options.stun_ice_servers = split_urls(&raw).map(IceServerConfig::new).collect();
        }
        if let Some(raw) = env_string("RENDEZVOUS_TURN_SERVERS") {
            let username = env_string("RENDEZVOUS_TURN_USERNAME");
            let credential = env_string("RENDEZVOUS_TURN_CREDENTIAL");
            options.turn_ice_servers = split_urls(&raw)
                .map(|url| IceServerConfig {
                    urls: vec![url.to_string()],
                    username: username.clone(),
                    credential: credential.clone(),
                })
                .collect();
        }

        let durations = [
            (
                "RENDEZVOUS_NETWORK_CHANGE_POLL_INTERVAL_MS",
                &mut options.network_change_poll_interval,
            ),
            (
                "RENDEZVOUS_STATE_EXPIRATION_INTERVAL_MS",
                &mut options.state_expiration_interval,
            ),
            (
                "RENDEZVOUS_STATE_HEARTBEAT_WINDOW_MS",
                &mut options.state_heartbeat_window,
            ),
            (
                "RENDEZVOUS_FAST_POLLING_DURATION_MS",
                &mut options.fast_polling_duration,
            ),
            ("RENDEZVOUS_FAST_POLLING_RATE_MS", &mut options.fast_polling_rate),
            ("RENDEZVOUS_SLOW_POLLING_RATE_MS", &mut options.slow_polling_rate),
            ("RENDEZVOUS_RELAY_TIMEOUT_MS", &mut options.relay_timeout),
        ];
        for (name, slot) in durations {
            if let Some(value) = env_millis(name)? {
                *slot = value;
            }
        }
        if let Some(value) = env_millis("RENDEZVOUS_IDLE_POLLING_AFTER_MS")? {
            options.idle_polling_after = Some(value);
        }
        if let Some(value) = env_millis("RENDEZVOUS_IDLE_POLLING_RATE_MS")? {
            options.idle_polling_rate = Some(value);
        }

        Ok(options)
    }

    pub fn with_worker_url(mut self, raw: &str) -> Result<Self, EngineError> {
        self.worker_url = Some(parse_worker_url(raw)?);
        Ok(self)
    }

    pub fn with_idle_polling(mut self, after: Duration, rate: Option<Duration>) -> Self {
        self.idle_polling_after = Some(after);
        self.idle_polling_rate = rate;
        self
    }

    pub fn with_connection_customizer(
        mut self,
        customize: impl Fn(&mut ConnectionOptions) + Send + Sync + 'static,
    ) -> Self {
        self.connection_customizer = Some(ConnectionCustomizer::new(customize));
        self
    }

    pub fn with_sdp_transform(
        mut self,
        transform: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.connection_options.sdp_transform = Some(SdpTransform::new(transform));
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let positive = [
            ("networkChangePollIntervalMs", self.network_change_poll_interval),
            ("stateExpirationIntervalMs", self.state_expiration_interval),
            ("fastPollingDurationMs", self.fast_polling_duration),
            ("fastPollingRateMs", self.fast_polling_rate),
            ("slowPollingRateMs", self.slow_polling_rate),
            ("relayTimeoutMs", self.relay_timeout),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(EngineError::InvalidArgument(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.state_heartbeat_window >= self.state_expiration_interval {
            return Err(EngineError::InvalidArgument(
                "stateHeartbeatWindowMs must be smaller than stateExpirationIntervalMs".into(),
            ));
        }
        if matches!(self.idle_polling_rate, Some(rate) if rate.is_zero()) {
            return Err(EngineError::InvalidArgument(
                "idlePollingRateMs must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }

    /// Longest gap allowed between two publishes of our own record.
    pub fn heartbeat_interval(&self) -> Duration {
        self.state_expiration_interval
            .saturating_sub(self.state_heartbeat_window)
    }

    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.stun_ice_servers
            .iter()
            .chain(self.turn_ice_servers.iter())
            .map(IceServerConfig::to_rtc)
            .collect()
    }
}

fn parse_worker_url(raw: &str) -> Result<Url, EngineError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash)
        .map_err(|err| EngineError::InvalidArgument(format!("invalid workerUrl '{raw}': {err}")))
}

fn split_urls(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|url| !url.is_empty())
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_millis(name: &str) -> Result<Option<Duration>, EngineError> {
    let Some(raw) = env_string(name) else {
        return Ok(None);
    };
    raw.parse::<u64>()
        .map(|millis| Some(Duration::from_millis(millis)))
        .map_err(|err| {
            EngineError::InvalidArgument(format!(
                "{name} must be a whole number of milliseconds, got '{raw}': {err}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not interleave.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn defaults_match_documented_values() {
        let options = EngineOptions::default();
        assert_eq!(options.fast_polling_rate, Duration::from_millis(1_500));
        assert_eq!(options.slow_polling_rate, Duration::from_millis(5_000));
        assert_eq!(options.fast_polling_duration, Duration::from_millis(10_000));
        assert_eq!(options.heartbeat_interval(), Duration::from_millis(90_000));
        assert!(options.idle_polling_after.is_none());
        assert!(options.idle_polling_rate.is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn heartbeat_window_must_fit_inside_expiration() {
        let options = EngineOptions {
            state_heartbeat_window: Duration::from_secs(200),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn customizer_leaves_base_options_alone() {
        let options = EngineOptions::default().with_connection_customizer(|opts| {
            opts.data_channel_label = "chat".into();
            opts.ordered = false;
        });
        let customizer = options.connection_customizer.clone().expect("customizer set");
        let mut built = options.connection_options.clone();
        customizer.apply(&mut built);
        assert_eq!(built.data_channel_label, "chat");
        assert!(!built.ordered);
        assert_eq!(options.connection_options.data_channel_label, "data");
    }

    #[test]
    fn worker_url_gains_trailing_slash() {
        let options = EngineOptions::default()
            .with_worker_url("https://relay.example.com/p2p")
            .expect("valid url");
        let url = options.worker_url.expect("url set");
        assert_eq!(url.as_str(), "https://relay.example.com/p2p/");
    }

    #[test]
    fn from_env_overrides_rates_and_servers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("RENDEZVOUS_FAST_POLLING_RATE_MS", "250");
            env::set_var("RENDEZVOUS_TURN_SERVERS", "turn:a.example:3478, turn:b.example:3478");
            env::set_var("RENDEZVOUS_TURN_USERNAME", "user");
            env::set_var("RENDEZVOUS_TURN_CREDENTIAL", "secret");
        }
        let options = EngineOptions::from_env().expect("env options");
        unsafe {
            env::remove_var("RENDEZVOUS_FAST_POLLING_RATE_MS");
            env::remove_var("RENDEZVOUS_TURN_SERVERS");
            env::remove_var("RENDEZVOUS_TURN_USERNAME");
            env::remove_var("RENDEZVOUS_TURN_CREDENTIAL");
        }
        assert_eq!(options.fast_polling_rate, Duration::from_millis(250));
        assert_eq!(options.turn_ice_servers.len(), 2);
        assert_eq!(options.turn_ice_servers[1].urls, vec!["turn:b.example:3478"]);
        assert_eq!(options.turn_ice_servers[0].username.as_deref(), Some("user"));
        assert_eq!(options.ice_servers().len(), 3);
    }

    #[test]
    fn from_env_rejects_bad_worker_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("RENDEZVOUS_WORKER_URL", "not a url");
        }
        let result = EngineOptions::from_env();
        unsafe {
            env::remove_var("RENDEZVOUS_WORKER_URL");
        }
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn from_env_rejects_malformed_durations() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("RENDEZVOUS_SLOW_POLLING_RATE_MS", "abc");
        }
        let result = EngineOptions::from_env();
        unsafe {
            env::remove_var("RENDEZVOUS_SLOW_POLLING_RATE_MS");
        }
        match result {
            Err(EngineError::InvalidArgument(message)) => {
                assert!(message.contains("RENDEZVOUS_SLOW_POLLING_RATE_MS"), "{message}");
            }
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }
}
