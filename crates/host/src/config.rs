use std::time::Duration;

use micro_host_http::protocol::DEFAULT_INITIAL_WINDOW_SIZE;
use serde::Deserialize;

/// Tunables shared by every connection a host serves.
///
/// Deserializable so it can sit inside a larger configuration file; every
/// field falls back to its default when missing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// initial capacity of the HTTP/1.1 read buffer, in bytes; also how much
    /// pipelined input is buffered while an exchange is in flight
    pub read_buffer_size: usize,
    /// keep HTTP/1.1 calls running when the client shuts down its write side
    /// mid-exchange, instead of treating that as a closed connection
    pub half_close: bool,
    /// request body chunks buffered before the transport stops reading
    pub body_channel_capacity: usize,
    /// response body chunks buffered before a streaming writer waits
    pub response_channel_capacity: usize,
    pub push_enabled: bool,
    /// open HTTP/2 streams above this are refused
    pub max_concurrent_streams: usize,
    /// receive window of each HTTP/2 stream, in bytes; must match what the
    /// framing layer advertises in `SETTINGS`
    pub initial_window_size: u32,
    /// answer frames for unknown streams with `RST_STREAM(STREAM_CLOSED)`
    /// instead of only logging them
    pub reset_unknown_streams: bool,
    pub send_date: bool,
    /// cancel calls still running after this many milliseconds
    pub call_timeout_ms: Option<u64>,
}

impl HostConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8 * 1024,
            half_close: false,
            body_channel_capacity: 16,
            response_channel_capacity: 16,
            push_enabled: true,
            max_concurrent_streams: 100,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            reset_unknown_streams: false,
            send_date: true,
            call_timeout_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: HostConfig = serde_json::from_str(r#"{ "push_enabled": false, "call_timeout_ms": 1500 }"#).unwrap();

        assert!(!config.push_enabled);
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.max_concurrent_streams, 100);
        assert_eq!(config.read_buffer_size, 8 * 1024);
        assert!(!config.half_close);
    }

    #[test]
    fn empty_document_is_default() {
        let config: HostConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.call_timeout(), None);
    }
}
