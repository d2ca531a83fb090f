//! Transport tunables and the parameter provider they are read from.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use tunnel_wire::{CHUNK_HEADER_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE};

use crate::error::{Result, TransportError};

/// Opaque read-only key/value source for transport parameters
pub trait ParameterProvider {
    /// Raw value for `key`, if set
    fn get(&self, key: &str) -> Option<String>;
}

impl ParameterProvider for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Item ceiling per outbound queue
    pub max_queued_items: usize,
    /// Byte ceiling per outbound queue
    pub max_queued_bytes: usize,
    /// Ceiling for a single message, both directions
    pub max_message_size: usize,
    /// Packing stops once a packet exceeds this size
    pub recommended_packet_size: usize,
    /// Payload bytes per wire chunk
    pub chunk_size: usize,
    /// Bound for opening a connection including its handshake
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Default message deadline, and bound for one physical send
    #[serde(with = "duration_str")]
    pub send_timeout: Duration,
    /// Default deadline for invocation replies
    #[serde(with = "duration_str")]
    pub invocation_timeout: Duration,
    /// Close long-lived connections without traffic for this long
    #[serde(with = "opt_duration_str")]
    pub close_after_inactivity: Option<Duration>,
    /// Ping long-lived connections that sent nothing for this long
    #[serde(with = "duration_str")]
    pub ping_interval: Duration,
    /// Period of the housekeeping sweep
    #[serde(with = "duration_str")]
    pub housekeeping_interval: Duration,
    /// Reconnection attempts before giving up
    pub reconnect_max_tries: u32,
    /// Pause between reconnection attempts
    #[serde(with = "duration_str")]
    pub reconnect_interval: Duration,
    /// Overall bound for one reconnection
    #[serde(with = "duration_str")]
    pub reconnect_deadline: Duration,
    /// How long the HTTP server parks a listener poll
    #[serde(with = "duration_str")]
    pub listener_timeout: Duration,
    /// TCP send buffer size
    pub tcp_send_buffer: Option<u32>,
    /// TCP receive buffer size
    pub tcp_recv_buffer: Option<u32>,
    /// Disable Nagle on TCP sockets
    pub tcp_nodelay: bool,
    /// Reuse HTTP connections between requests
    pub http_keep_alive: bool,
    /// Request path served by the HTTP server
    pub http_path: String,
    /// Security session name handed to the factory
    pub security_session: Option<String>,
    /// Lease granted to peers on every contact
    #[serde(with = "duration_str")]
    pub peer_lease: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_queued_items: 10_000,
            max_queued_bytes: 64 * 1024 * 1024, // 64 MiB
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            recommended_packet_size: 64 * 1024,
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            invocation_timeout: Duration::from_secs(60),
            close_after_inactivity: Some(Duration::from_secs(600)),
            ping_interval: Duration::from_secs(30),
            housekeeping_interval: Duration::from_secs(1),
            reconnect_max_tries: 5,
            reconnect_interval: Duration::from_millis(500),
            reconnect_deadline: Duration::from_secs(30),
            listener_timeout: Duration::from_secs(20),
            tcp_send_buffer: None,
            tcp_recv_buffer: None,
            tcp_nodelay: true,
            http_keep_alive: true,
            http_path: "/tunnel".to_string(),
            security_session: None,
            peer_lease: Duration::from_secs(300),
        }
    }
}

impl TransportConfig {
    /// Read named parameters over the defaults
    pub fn from_provider(provider: &dyn ParameterProvider) -> Result<Self> {
        let mut config = Self::default();

        read_parsed(provider, "MaxQueuedItems", &mut config.max_queued_items)?;
        read_parsed(provider, "MaxQueuedBytes", &mut config.max_queued_bytes)?;
        read_parsed(provider, "MaxMessageSize", &mut config.max_message_size)?;
        read_parsed(provider, "RecommendedPacketSize", &mut config.recommended_packet_size)?;
        read_parsed(provider, "ChunkSize", &mut config.chunk_size)?;
        read_duration(provider, "ConnectTimeout", &mut config.connect_timeout)?;
        read_duration(provider, "SendTimeout", &mut config.send_timeout)?;
        read_duration(provider, "InvocationTimeout", &mut config.invocation_timeout)?;
        if let Some(raw) = provider.get("CloseAfterInactivity") {
            config.close_after_inactivity = parse_opt_duration("CloseAfterInactivity", &raw)?;
        }
        read_duration(provider, "PingInterval", &mut config.ping_interval)?;
        read_duration(provider, "HousekeepingInterval", &mut config.housekeeping_interval)?;
        read_parsed(provider, "ReconnectMaxTries", &mut config.reconnect_max_tries)?;
        read_duration(provider, "ReconnectInterval", &mut config.reconnect_interval)?;
        read_duration(provider, "ReconnectDeadline", &mut config.reconnect_deadline)?;
        read_duration(provider, "ListenerTimeout", &mut config.listener_timeout)?;
        if let Some(raw) = provider.get("TcpSendBuffer") {
            config.tcp_send_buffer = Some(parse_value("TcpSendBuffer", &raw)?);
        }
        if let Some(raw) = provider.get("TcpReceiveBuffer") {
            config.tcp_recv_buffer = Some(parse_value("TcpReceiveBuffer", &raw)?);
        }
        read_parsed(provider, "TcpNoDelay", &mut config.tcp_nodelay)?;
        read_parsed(provider, "HttpKeepAlive", &mut config.http_keep_alive)?;
        if let Some(path) = provider.get("HttpPath") {
            config.http_path = path;
        }
        if let Some(name) = provider.get("SecuritySession") {
            config.security_session = Some(name).filter(|name| !name.is_empty());
        }
        read_duration(provider, "PeerLease", &mut config.peer_lease)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(TransportError::Config("chunk size must be positive".into()));
        }
        if self.recommended_packet_size <= CHUNK_HEADER_SIZE {
            return Err(TransportError::Config(format!(
                "recommended packet size {} does not fit a chunk header",
                self.recommended_packet_size
            )));
        }
        if self.max_queued_items == 0 || self.max_queued_bytes == 0 {
            return Err(TransportError::Config("queue ceilings must be positive".into()));
        }
        if self.max_message_size > self.max_queued_bytes {
            return Err(TransportError::Config(format!(
                "max message size {} exceeds the queue byte ceiling {}",
                self.max_message_size, self.max_queued_bytes
            )));
        }
        if self.housekeeping_interval.is_zero() {
            return Err(TransportError::Config("housekeeping interval must be positive".into()));
        }
        if !self.http_path.starts_with('/') {
            return Err(TransportError::Config(format!(
                "http path {:?} must start with '/'",
                self.http_path
            )));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| TransportError::Config(format!("{key}: cannot parse {raw:?}")))
}

fn parse_opt_duration(key: &str, raw: &str) -> Result<Option<Duration>> {
    match raw.trim() {
        "" | "never" | "0" => Ok(None),
        value => humantime::parse_duration(value)
            .map(Some)
            .map_err(|err| TransportError::Config(format!("{key}: {err}"))),
    }
}

fn read_parsed<T: std::str::FromStr>(provider: &dyn ParameterProvider, key: &str, slot: &mut T) -> Result<()> {
    if let Some(raw) = provider.get(key) {
        *slot = parse_value(key, &raw)?;
        debug!(key, value = %raw, "transport parameter set");
    }
    Ok(())
}

fn read_duration(provider: &dyn ParameterProvider, key: &str, slot: &mut Duration) -> Result<()> {
    if let Some(raw) = provider.get(key) {
        *slot = humantime::parse_duration(raw.trim())
            .map_err(|err| TransportError::Config(format!("{key}: {err}")))?;
        debug!(key, value = %raw, "transport parameter set");
    }
    Ok(())
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_str(&humantime::format_duration(*value).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(raw) if raw == "never" => Ok(None),
            Some(raw) => humantime::parse_duration(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        TransportConfig::default().validate().unwrap();
    }

    #[test]
    fn test_named_keys_override_defaults() {
        let config = TransportConfig::from_provider(&provider(&[
            ("MaxQueuedItems", "16"),
            ("ConnectTimeout", "250ms"),
            ("CloseAfterInactivity", "never"),
            ("TcpReceiveBuffer", "65536"),
            ("SecuritySession", "psk"),
        ]))
        .unwrap();

        assert_eq!(config.max_queued_items, 16);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.close_after_inactivity, None);
        assert_eq!(config.tcp_recv_buffer, Some(65536));
        assert_eq!(config.security_session.as_deref(), Some("psk"));
        assert_eq!(config.send_timeout, TransportConfig::default().send_timeout);
    }

    #[test]
    fn test_unparsable_value_is_config_error() {
        let err = TransportConfig::from_provider(&provider(&[("PingInterval", "soon")])).unwrap_err();
        assert!(matches!(err, TransportError::Config(msg) if msg.starts_with("PingInterval")));
    }

    #[test]
    fn test_validate_rejects_tiny_packets() {
        let err = TransportConfig::from_provider(&provider(&[("RecommendedPacketSize", "4")])).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn test_yaml_durations() {
        let config: TransportConfig = serde_yaml::from_str(
            "send_timeout: 2s\nclose_after_inactivity: 1m\nmax_queued_items: 8\n",
        )
        .unwrap();
        assert_eq!(config.send_timeout, Duration::from_secs(2));
        assert_eq!(config.close_after_inactivity, Some(Duration::from_secs(60)));
        assert_eq!(config.max_queued_items, 8);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
