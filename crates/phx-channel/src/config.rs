//! Socket configuration.

use crate::error::ChannelError;
use std::time::Duration;
use url::Url;

/// Protocol version appended to the socket URL as `vsn`.
pub const DEFAULT_VSN: &str = "2.0.0";

/// Configuration for a socket connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Serializer version sent as the `vsn` query parameter.
    pub vsn: String,

    /// Extra query parameters (e.g., an auth token).
    pub params: Vec<(String, String)>,

    /// First message ref handed out by each channel; also its join ref.
    pub ref_seed: u64,

    /// Heartbeat interval. `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,

    /// Capacity of the outbound command queue.
    pub outbound_buffer: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            vsn: DEFAULT_VSN.to_string(),
            params: Vec::new(),
            ref_seed: 1,
            heartbeat_interval: Some(Duration::from_secs(30)),
            outbound_buffer: 1024,
        }
    }
}

impl SocketConfig {
    /// Create a new socket config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the serializer version.
    pub fn vsn(mut self, vsn: impl Into<String>) -> Self {
        self.vsn = vsn.into();
        self
    }

    /// Add a query parameter to the connect URL.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Set the ref seed.
    pub fn ref_seed(mut self, seed: u64) -> Self {
        self.ref_seed = seed;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Disable heartbeats.
    pub fn no_heartbeat(mut self) -> Self {
        self.heartbeat_interval = None;
        self
    }

    /// Set the outbound queue capacity.
    pub fn outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = capacity.max(1);
        self
    }

    /// Build the URL to connect to from a base address.
    ///
    /// Accepts `ws://`/`wss://` URLs as well as `http://`/`https://`, which are
    /// mapped to their WebSocket schemes. Existing query parameters are kept.
    pub fn endpoint_url(&self, address: &str) -> Result<Url, ChannelError> {
        let mut url = Url::parse(address)?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ChannelError::InvalidUrl(format!(
                    "unsupported scheme: {}",
                    other
                )));
            }
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(ChannelError::InvalidUrl(address.to_string()));
        }

        {
            let mut query = url.query_pairs_mut();
            for (key, value) in &self.params {
                query.append_pair(key, value);
            }
            query.append_pair("vsn", &self.vsn);
        }

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_config_builder() {
        let config = SocketConfig::new()
            .param("token", "abc")
            .ref_seed(5)
            .heartbeat_interval(Duration::from_secs(10))
            .outbound_buffer(0);

        assert_eq!(config.params, vec![("token".to_string(), "abc".to_string())]);
        assert_eq!(config.ref_seed, 5);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.outbound_buffer, 1);
        assert!(config.no_heartbeat().heartbeat_interval.is_none());
    }

    #[test]
    fn test_endpoint_url_appends_vsn() {
        let url = SocketConfig::new()
            .endpoint_url("ws://localhost:4000/socket/websocket?token=t")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:4000/socket/websocket?token=t&vsn=2.0.0"
        );
    }

    #[test]
    fn test_endpoint_url_maps_http_scheme() {
        let url = SocketConfig::new()
            .param("user", "gauravji")
            .endpoint_url("https://example.com/socket/websocket")
            .unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.query(), Some("user=gauravji&vsn=2.0.0"));
    }

    #[test]
    fn test_endpoint_url_rejects_other_schemes() {
        assert!(matches!(
            SocketConfig::new().endpoint_url("ftp://example.com"),
            Err(ChannelError::InvalidUrl(_))
        ));
        assert!(SocketConfig::new().endpoint_url("not a url").is_err());
    }
}
