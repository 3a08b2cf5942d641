//! Bot authentication against the platform's HTTP endpoint.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use super::{GatewayClient, GatewayError};

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub refresh_token: String,
    pub created: bool,
}

#[derive(Serialize)]
struct AuthRequest {
    account: AuthAccount,
}

#[derive(Serialize)]
struct AuthAccount {
    appid: String,
    token: String,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    created: bool,
    #[serde(default)]
    api_url: String,
}

impl GatewayClient {
    /// Exchange the bot credentials for a session token. When the response
    /// carries an `api_url`, the realtime socket endpoint is switched to it.
    pub(crate) async fn authenticate(&self) -> Result<(), GatewayError> {
        info!("authenticating bot");
        let (endpoint, body, basic) = {
            let config = self.config.read();
            let body = AuthRequest {
                account: AuthAccount {
                    appid: config.bot_id.to_string(),
                    token: config.bot_token.clone(),
                },
            };
            let basic = BASE64.encode(format!("{}:", config.bot_token));
            (config.auth_endpoint(), body, basic)
        };

        let response = self
            .http
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Basic {basic}"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            warn!(status = status.as_u16(), body = %text, "authentication rejected");
            return Err(GatewayError::Auth(format!(
                "status {}: {text}",
                status.as_u16()
            )));
        }

        let parsed: AuthResponse = serde_json::from_str(&text)
            .map_err(|err| GatewayError::Auth(format!("bad auth response: {err}")))?;
        if parsed.token.is_empty() {
            return Err(GatewayError::Auth("no session token received".into()));
        }

        if !parsed.api_url.is_empty() {
            if let Some((host, port, use_ssl)) = parse_api_url(&parsed.api_url) {
                info!(host, port, use_ssl, "switching realtime endpoint");
                let mut config = self.config.write();
                config.socket_host = host;
                config.socket_port = port;
                config.socket_use_ssl = use_ssl;
            }
        }

        *self.session.write() = Some(AuthSession {
            token: parsed.token,
            refresh_token: parsed.refresh_token,
            created: parsed.created,
        });
        info!("bot authenticated");
        Ok(())
    }
}

/// Parse `[scheme://]host[:port][/]` into socket endpoint parts. SSL follows
/// the scheme; the port defaults to 443/80 accordingly.
pub(crate) fn parse_api_url(api_url: &str) -> Option<(String, u16, bool)> {
    let use_ssl = api_url.starts_with("https://");
    let stripped = api_url
        .trim_start_matches("https://")
        .trim_start_matches("http://");

    let mut parts = stripped.splitn(2, ':');
    let host = parts.next().unwrap_or_default().trim_end_matches('/');
    if host.is_empty() {
        return None;
    }
    let port = match parts.next() {
        Some(raw) => raw.trim_end_matches('/').parse::<u16>().ok()?,
        None => {
            if use_ssl {
                443
            } else {
                80
            }
        }
    };
    Some((host.to_string(), port, use_ssl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_parses_scheme_host_port() {
        assert_eq!(
            parse_api_url("https://rt.mezon.ai:8443/"),
            Some(("rt.mezon.ai".into(), 8443, true))
        );
        assert_eq!(
            parse_api_url("http://10.0.0.5"),
            Some(("10.0.0.5".into(), 80, false))
        );
        assert_eq!(
            parse_api_url("rt.mezon.ai"),
            Some(("rt.mezon.ai".into(), 80, false))
        );
        assert_eq!(
            parse_api_url("https://rt.mezon.ai/"),
            Some(("rt.mezon.ai".into(), 443, true))
        );
    }

    #[test]
    fn api_url_rejects_garbage() {
        assert_eq!(parse_api_url(""), None);
        assert_eq!(parse_api_url("https://"), None);
        assert_eq!(parse_api_url("https://host:notaport"), None);
    }
}
