//! Environment-driven configuration.
//!
//! All knobs come from the process environment; defaults match the hosted
//! Mezon gateway. Nothing here touches the network.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Connection settings for the chat gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bot_id: i64,
    pub bot_token: String,
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    /// Realtime socket endpoint. Starts equal to the auth endpoint and is
    /// replaced when the auth response redirects via `api_url`.
    pub socket_host: String,
    pub socket_port: u16,
    pub socket_use_ssl: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_id_raw = require_env("BOT_ID")?;
        let bot_id = bot_id_raw
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidEnv {
                var: "BOT_ID",
                value: bot_id_raw,
            })?;
        let bot_token = require_env("BOT_TOKEN")?;

        let host = env_or("MEZON_HOST", "gw.mezon.ai");
        let port_raw = env_or("MEZON_PORT", "443");
        let port = port_raw.parse::<u16>().map_err(|_| ConfigError::InvalidEnv {
            var: "MEZON_PORT",
            value: port_raw,
        })?;
        let use_ssl = env_or("MEZON_USE_SSL", "true") != "false";

        Ok(Self {
            bot_id,
            bot_token,
            socket_host: host.clone(),
            socket_port: port,
            socket_use_ssl: use_ssl,
            host,
            port,
            use_ssl,
        })
    }

    fn is_default_port(&self) -> bool {
        (self.use_ssl && self.port == 443) || (!self.use_ssl && self.port == 80)
    }

    pub fn auth_endpoint(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        if self.is_default_port() {
            format!("{scheme}://{}/v2/apps/authenticate/token", self.host)
        } else {
            format!(
                "{scheme}://{}:{}/v2/apps/authenticate/token",
                self.host, self.port
            )
        }
    }

    pub fn websocket_endpoint(&self, token: &str) -> String {
        let scheme = if self.socket_use_ssl { "wss" } else { "ws" };
        let authority = if self.is_default_port() {
            self.socket_host.clone()
        } else {
            format!("{}:{}", self.socket_host, self.socket_port)
        };
        format!(
            "{scheme}://{authority}/ws?lang=en&status={}&token={}&format=protobuf",
            encode_uri_component("true"),
            encode_uri_component(token),
        )
    }
}

/// Percent-encode a query value the way `encodeURIComponent` does.
pub fn encode_uri_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => out.push(byte as char),
            b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// Face detection + submission settings.
#[derive(Debug, Clone)]
pub struct FaceConfig {
    pub enabled: bool,
    pub cascade_path: String,
    pub min_face_size: u32,
    pub jpeg_quality: u8,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cascade_path: "haarcascade_frontalface_default.xml".into(),
            min_face_size: 80,
            jpeg_quality: 90,
        }
    }
}

/// Prompt audio file locations.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub enabled: bool,
    pub welcome_path: String,
    pub checkin_success_path: String,
    pub checkin_fail_path: String,
    pub background_music_path: Option<String>,
    pub background_music_enabled: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            welcome_path: "./audio/welcome.ogg".into(),
            checkin_success_path: "./audio/checkin-success.ogg".into(),
            checkin_fail_path: "./audio/checkin-failed.ogg".into(),
            background_music_path: Some("./audio/background.ogg".into()),
            background_music_enabled: false,
        }
    }
}

/// Frame-capture loop deadlines and limits.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub capture_timeout: Duration,
    pub pli_timeout: Duration,
    pub capture_interval: Duration,
    pub max_attempts: u32,
    pub sample_buffer_max: u16,
    /// Pause between ICE candidates re-emitted from the local SDP.
    pub ice_from_sdp_pacing: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_secs(90),
            pli_timeout: Duration::from_secs(10),
            capture_interval: Duration::from_secs(1),
            max_attempts: 5,
            sample_buffer_max: 128,
            ice_from_sdp_pacing: Duration::from_millis(100),
        }
    }
}

/// Decode and detection sizing.
#[derive(Debug, Clone)]
pub struct DimensionConfig {
    pub max_decode_width: u32,
    pub max_decode_height: u32,
    pub detection_width: u32,
    pub skip_detection_resize: bool,
    pub expand_ratio: f64,
}

impl Default for DimensionConfig {
    fn default() -> Self {
        Self {
            max_decode_width: 640,
            max_decode_height: 480,
            detection_width: 320,
            skip_detection_resize: false,
            expand_ratio: 0.2,
        }
    }
}

/// Reconnect backoff. Injectable so tests can pin the schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt: doubling from `initial`,
    /// capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt {
            delay = (delay * 2).min(self.max);
            if delay == self.max {
                break;
            }
        }
        delay.min(self.max)
    }
}

fn require_env(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnv(var)),
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_product_curve() {
        let policy = RetryPolicy::default();
        let seconds: Vec<u64> = (1..=10).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(seconds, vec![5, 10, 20, 40, 60, 60, 60, 60, 60, 60]);
    }

    #[test]
    fn auth_endpoint_hides_default_port() {
        let config = GatewayConfig {
            bot_id: 1,
            bot_token: "t".into(),
            host: "gw.mezon.ai".into(),
            port: 443,
            use_ssl: true,
            socket_host: "gw.mezon.ai".into(),
            socket_port: 443,
            socket_use_ssl: true,
        };
        assert_eq!(
            config.auth_endpoint(),
            "https://gw.mezon.ai/v2/apps/authenticate/token"
        );

        let plain = GatewayConfig {
            use_ssl: false,
            port: 7350,
            ..config
        };
        assert_eq!(
            plain.auth_endpoint(),
            "http://gw.mezon.ai:7350/v2/apps/authenticate/token"
        );
    }

    #[test]
    fn websocket_endpoint_escapes_token() {
        let config = GatewayConfig {
            bot_id: 1,
            bot_token: "t".into(),
            host: "gw.mezon.ai".into(),
            port: 443,
            use_ssl: true,
            socket_host: "rt.mezon.ai".into(),
            socket_port: 443,
            socket_use_ssl: true,
        };
        let url = config.websocket_endpoint("a b+c");
        assert!(url.starts_with("wss://rt.mezon.ai/ws?"));
        assert!(url.contains("token=a%20b%2Bc"));
        assert!(url.ends_with("format=protobuf"));
    }

    #[test]
    fn uri_component_encoding_keeps_unreserved_marks() {
        assert_eq!(encode_uri_component("a~b*c'd(e)f"), "a~b*c'd(e)f");
        assert_eq!(encode_uri_component("a/b?c=d"), "a%2Fb%3Fc%3Dd");
    }
}
