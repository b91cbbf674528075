//! Server configuration parameters.

use serde::{Deserialize, Serialize};

/// Policy for the pixel-comparing update filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompareMode {
    /// Never compare; forward every dirty hint as-is.
    Off,
    /// Always compare pixels against the retained snapshot.
    On,
    /// Compare only while at least one connected client asks for it.
    PerClient,
}

/// Tunable parameters of the session coordinator.
///
/// Timeouts are in seconds and a value of 0 disables the timer in
/// question. Defaults match the original server's shipping values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Terminate after this many seconds without client input. 0 disables.
    pub max_idle_time: u32,
    /// Terminate this many seconds after the last client disconnects
    /// (also counts from start-up if nobody ever connects). 0 disables.
    pub max_disconnection_time: u32,
    /// Terminate this many seconds after the first client connects,
    /// regardless of activity. 0 disables.
    pub max_connection_time: u32,
    /// Target framebuffer update rate, in frames per second.
    pub frame_rate: u32,
    /// Never allow more than one client at a time.
    pub never_shared: bool,
    /// When a non-shared connection arrives, disconnect the existing
    /// clients rather than refusing the newcomer.
    pub disconnect_clients: bool,
    /// Ask the desktop backend to approve every new connection.
    pub query_connect: bool,
    /// Accept clipboard content from clients.
    pub accept_cut_text: bool,
    /// Offer clipboard content to clients.
    pub send_cut_text: bool,
    /// Accept keyboard events from clients.
    pub accept_key_events: bool,
    /// Accept pointer events from clients.
    pub accept_pointer_events: bool,
    /// Allow clients to request framebuffer resizes.
    pub accept_set_desktop_size: bool,
    /// When to run the pixel comparer over dirty regions.
    pub compare_fb: CompareMode,
    /// Authentication failures from one address before it is blacklisted.
    pub blacklist_threshold: u32,
    /// Initial blacklist block window in seconds; doubles with every
    /// further failure.
    pub blacklist_timeout: u32,
    /// Keysym substitutions applied to incoming key events, as a
    /// comma-separated list of `0xA->0xB` pairs. Empty disables remapping.
    pub remap_keys: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_idle_time: 0,
            max_disconnection_time: 0,
            max_connection_time: 0,
            frame_rate: 60,
            never_shared: false,
            disconnect_clients: true,
            query_connect: false,
            accept_cut_text: true,
            send_cut_text: true,
            accept_key_events: true,
            accept_pointer_events: true,
            accept_set_desktop_size: true,
            compare_fb: CompareMode::On,
            blacklist_threshold: 5,
            blacklist_timeout: 10,
            remap_keys: String::new(),
        }
    }
}

impl ServerConfig {
    /// Milliseconds between frame ticks at the configured rate.
    #[must_use]
    pub fn frame_interval_ms(&self) -> u64 {
        1000 / u64::from(self.frame_rate.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_shipping_values() {
        let config = ServerConfig::default();
        assert_eq!(config.max_idle_time, 0);
        assert_eq!(config.frame_rate, 60);
        assert!(config.disconnect_clients);
        assert!(!config.never_shared);
        assert_eq!(config.compare_fb, CompareMode::On);
        assert_eq!(config.blacklist_threshold, 5);
    }

    #[test]
    fn test_frame_interval() {
        let mut config = ServerConfig::default();
        assert_eq!(config.frame_interval_ms(), 16);
        config.frame_rate = 25;
        assert_eq!(config.frame_interval_ms(), 40);
    }

    #[test]
    fn test_round_trips_through_serde() {
        let config = ServerConfig {
            max_idle_time: 300,
            compare_fb: CompareMode::PerClient,
            ..ServerConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_idle_time, 300);
        assert_eq!(back.compare_fb, CompareMode::PerClient);
    }
}
