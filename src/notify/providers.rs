//! Notification providers: SMTP email and HTTP push.
//!
//! Providers receive an already-decrypted config object and a built
//! payload; they own transport concerns only.

use anyhow::{Context, Result};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::info;

use super::ssrf::validate_outbound_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Default,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub priority: Priority,
}

// Good-enough RFC 5322 shape check; the SMTP server has the final word.
static RECIPIENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

fn config_str<'a>(config: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .with_context(|| format!("channel config is missing '{key}'"))
}

pub async fn send_email(config: &serde_json::Value, payload: &NotificationPayload) -> Result<()> {
    let host = config_str(config, "host")?;
    let port = config
        .get("port")
        .and_then(|v| v.as_u64())
        .unwrap_or(587) as u16;
    let secure = config.get("secure").and_then(|v| v.as_bool()).unwrap_or(false);
    let from = config_str(config, "from")?;
    let to = config_str(config, "to")?;
    let user = config.get("user").and_then(|v| v.as_str()).unwrap_or("");
    let pass = config.get("pass").and_then(|v| v.as_str()).unwrap_or("");

    let from_mailbox: Mailbox = from
        .parse()
        .with_context(|| format!("invalid sender address {from:?}"))?;

    let mut builder = Message::builder().from(from_mailbox).subject(&payload.title);
    let mut recipients = 0;
    for recipient in to.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !RECIPIENT.is_match(recipient) {
            anyhow::bail!("invalid recipient address {recipient:?}");
        }
        builder = builder.to(recipient
            .parse::<Mailbox>()
            .with_context(|| format!("invalid recipient address {recipient:?}"))?);
        recipients += 1;
    }
    if recipients == 0 {
        anyhow::bail!("channel config has no recipients");
    }

    let email = builder.body(payload.body.clone())?;

    // Implicit TLS is an SMTPS-port-only thing; anything else speaks
    // STARTTLS when asked and plaintext otherwise.
    let transport = if secure && port == 465 {
        AsyncSmtpTransport::<Tokio1Executor>::relay(host)?.port(port)
    } else if secure {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?.port(port)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(port)
    };
    let transport = if user.is_empty() {
        transport
    } else {
        transport.credentials(Credentials::new(user.to_string(), pass.to_string()))
    };

    transport.build().send(email).await?;
    info!("Email notification sent via {host}:{port} ({recipients} recipients)");
    Ok(())
}

pub async fn send_http_push(
    client: &reqwest::Client,
    config: &serde_json::Value,
    payload: &NotificationPayload,
) -> Result<()> {
    let base_url = config_str(config, "base_url")?;
    let topic = config_str(config, "topic")?;
    let url = format!("{}/{}", base_url.trim_end_matches('/'), topic);

    // Checked at save time too, but DNS may have changed since.
    validate_outbound_url(&url).await?;

    let mut request = client.post(&url).json(payload);
    if let Some(token) = config.get("auth_token").and_then(|v| v.as_str()) {
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        anyhow::bail!("push endpoint returned HTTP {}", response.status());
    }
    info!("Push notification delivered to {url}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_shape_check() {
        assert!(RECIPIENT.is_match("ops@example.com"));
        assert!(RECIPIENT.is_match("first.last+tag@mail.example.co.uk"));
        assert!(!RECIPIENT.is_match("not-an-address"));
        assert!(!RECIPIENT.is_match("missing@tld"));
        assert!(!RECIPIENT.is_match("two@@example.com"));
        assert!(!RECIPIENT.is_match("spaces in@example.com"));
    }

    #[test]
    fn config_str_rejects_missing_and_blank() {
        let config = serde_json::json!({"host": "smtp.example.com", "from": "  "});
        assert!(config_str(&config, "host").is_ok());
        assert!(config_str(&config, "from").is_err());
        assert!(config_str(&config, "to").is_err());
    }

    #[tokio::test]
    async fn push_refuses_internal_urls_before_sending() {
        let client = reqwest::Client::new();
        let config = serde_json::json!({"base_url": "http://10.0.0.5", "topic": "fleet"});
        let payload = NotificationPayload {
            title: "t".into(),
            body: "b".into(),
            priority: Priority::Default,
        };
        assert!(send_http_push(&client, &config, &payload).await.is_err());
    }
}
