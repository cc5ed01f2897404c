use tracing::info;

use crate::relay::RelayConfig;

// ---------------------------------------------------------------------------
// Server configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `MEET_`.  Defaults are suitable for local development.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP listener to.
    pub bind_addr: String,
    /// Public hostname, advertised as the NAT 1:1 address in ICE candidates.
    pub public_host: String,

    // ── ICE ─────────────────────────────────────────────────────────────
    /// STUN server URLs used by the server-side ICE agent.
    pub stun_urls: Vec<String>,
    /// Minimum UDP port for WebRTC ICE candidates (0 = OS picks).
    pub udp_port_min: u16,
    /// Maximum UDP port for WebRTC ICE candidates (0 = OS picks).
    pub udp_port_max: u16,

    // ── Relay ───────────────────────────────────────────────────────────
    /// Per-subscriber packet buffer for relayed video tracks.
    pub relay_video_buffer: usize,
    /// Per-subscriber packet buffer for relayed audio tracks.
    pub relay_audio_buffer: usize,
    /// Seconds between keyframe requests on inbound video (0 = disabled).
    pub keyframe_interval_secs: u64,

    // ── Limits ───────────────────────────────────────────────────────────
    /// Maximum number of rooms that can exist simultaneously.
    pub max_rooms: usize,

    // ── HTTP ─────────────────────────────────────────────────────────────
    pub allowed_origins: String,
    /// Directory holding the web client (served for unmatched paths).
    pub static_dir: String,

    // ── Logging ──────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            public_host: "localhost".into(),
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            udp_port_min: 0,
            udp_port_max: 0,
            relay_video_buffer: 300,
            relay_audio_buffer: 100,
            keyframe_interval_secs: 3,
            max_rooms: 100,
            allowed_origins: "*".into(),
            static_dir: "./web".into(),
            log_level: "info".into(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading.
        let _ = dotenvy::dotenv();

        let defaults = Config::default();

        let config = Config {
            bind_addr: env_or("MEET_BIND_ADDR", &defaults.bind_addr),
            public_host: env_or("MEET_PUBLIC_HOST", &defaults.public_host),
            stun_urls: env_csv("MEET_STUN_URLS", &defaults.stun_urls),
            udp_port_min: env_parse("MEET_UDP_PORT_MIN", defaults.udp_port_min),
            udp_port_max: env_parse("MEET_UDP_PORT_MAX", defaults.udp_port_max),
            relay_video_buffer: env_parse("MEET_RELAY_VIDEO_BUFFER", defaults.relay_video_buffer),
            relay_audio_buffer: env_parse("MEET_RELAY_AUDIO_BUFFER", defaults.relay_audio_buffer),
            keyframe_interval_secs: env_parse(
                "MEET_KEYFRAME_INTERVAL_SECS",
                defaults.keyframe_interval_secs,
            ),
            max_rooms: env_parse("MEET_MAX_ROOMS", defaults.max_rooms),
            allowed_origins: env_or("MEET_ALLOWED_ORIGINS", &defaults.allowed_origins),
            static_dir: env_or("MEET_STATIC_DIR", &defaults.static_dir),
            log_level: env_or("MEET_LOG_LEVEL", &defaults.log_level),
        };

        config.log_summary();
        config
    }

    /// Relay buffer sizing derived from this configuration.  Buffers are
    /// never smaller than one packet.
    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            video_buffer: self.relay_video_buffer.max(1),
            audio_buffer: self.relay_audio_buffer.max(1),
        }
    }

    /// The IP advertised in ICE host candidates.  NAT 1:1 mapping requires an
    /// address, so `localhost` is translated.
    pub fn nat_ip(&self) -> String {
        if self.public_host == "localhost" {
            "127.0.0.1".to_string()
        } else {
            self.public_host.clone()
        }
    }

    fn log_summary(&self) {
        info!("──── meet-sfu configuration ────");
        info!("  bind_addr          : {}", self.bind_addr);
        info!("  public_host        : {}", self.public_host);
        info!("  stun_urls          : {:?}", self.stun_urls);
        info!("  udp_ports          : {}-{}", self.udp_port_min, self.udp_port_max);
        info!(
            "  relay_buffers      : video={} audio={}",
            self.relay_video_buffer, self.relay_audio_buffer
        );
        info!("  keyframe_interval  : {}s", self.keyframe_interval_secs);
        info!("  max_rooms          : {}", self.max_rooms);
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  static_dir         : {}", self.static_dir);
        info!("  log_level          : {}", self.log_level);
        info!("────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_csv(key: &str, defaults: &[String]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => split_csv(&v),
        _ => defaults.to_vec(),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_public_stun() {
        let config = Config::default();
        assert_eq!(config.stun_urls.len(), 1);
        assert!(config.stun_urls[0].starts_with("stun:"));
        assert_eq!(config.relay_video_buffer, 300);
        assert_eq!(config.relay_audio_buffer, 100);
    }

    #[test]
    fn localhost_maps_to_loopback_for_nat() {
        let mut config = Config::default();
        assert_eq!(config.nat_ip(), "127.0.0.1");

        config.public_host = "203.0.113.7".into();
        assert_eq!(config.nat_ip(), "203.0.113.7");
    }

    #[test]
    fn relay_buffers_never_zero() {
        let config = Config {
            relay_video_buffer: 0,
            relay_audio_buffer: 0,
            ..Config::default()
        };
        let relay = config.relay();
        assert_eq!(relay.video_buffer, 1);
        assert_eq!(relay.audio_buffer, 1);
    }

    #[test]
    fn csv_skips_blank_entries() {
        let urls = split_csv(" stun:a:3478 ,, stun:b:3478 ,");
        assert_eq!(urls, vec!["stun:a:3478", "stun:b:3478"]);
    }
}
