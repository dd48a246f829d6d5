//! Generic webhook notification channel.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Channel, ChannelContext, ChannelKind, ChannelSettings, parse_settings};
use crate::locale;
use crate::notifiable::Notifiable;
use crate::notification::Envelope;
use crate::{Error, Result};

const CHANNEL: &str = "webhook";

/// Webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Fallback URL when the notifiable has no `webhook` route.
    #[serde(default)]
    pub url: Option<String>,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Authentication type.
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    /// Bearer token authentication.
    Bearer { token: String },
    /// Basic authentication.
    Basic { username: String, password: String },
    /// Custom header authentication.
    Header { name: String, value: String },
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            url: None,
            method: default_method(),
            headers: Vec::new(),
            auth: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// Posts notification payloads to an HTTP endpoint.
pub struct WebhookChannel {
    settings: WebhookSettings,
    method: Method,
    client: Client,
}

fn parse_method(method: &str) -> Result<Method> {
    match method.trim().to_uppercase().as_str() {
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        other => Err(Error::config(format!(
            "Unsupported webhook method '{}'",
            other
        ))),
    }
}

impl WebhookChannel {
    /// Fails on an HTTP method other than POST, PUT or PATCH.
    ///
    /// `client` is used as given; the timeout is applied per request.
    pub fn new(settings: WebhookSettings, client: Client) -> Result<Self> {
        let method = parse_method(&settings.method)?;
        Ok(Self {
            settings,
            method,
            client,
        })
    }

    fn resolve_url(&self, notifiable: &Notifiable) -> Result<String> {
        notifiable
            .route_for(CHANNEL)
            .and_then(|route| route.as_str().map(str::to_string))
            .or_else(|| self.settings.url.clone())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::missing_routing(CHANNEL))
    }

    fn check_credentials(&self) -> Result<()> {
        match &self.settings.auth {
            Some(WebhookAuth::Bearer { token }) if token.trim().is_empty() => {
                Err(Error::missing_credential(CHANNEL, "token"))
            }
            Some(WebhookAuth::Basic { username, .. }) if username.is_empty() => {
                Err(Error::missing_credential(CHANNEL, "username"))
            }
            _ => Ok(()),
        }
    }

    /// Build the request headers.
    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.settings.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        if let Some(auth) = &self.settings.auth {
            match auth {
                WebhookAuth::Bearer { token } => {
                    if let Ok(value) = format!("Bearer {}", token).parse() {
                        headers.insert(reqwest::header::AUTHORIZATION, value);
                    }
                }
                WebhookAuth::Header { name, value } => {
                    if let (Ok(name), Ok(value)) = (
                        name.parse::<reqwest::header::HeaderName>(),
                        value.parse::<reqwest::header::HeaderValue>(),
                    ) {
                        headers.insert(name, value);
                    }
                }
                // Applied on the request builder.
                WebhookAuth::Basic { .. } => {}
            }
        }

        headers
    }

    /// Build the JSON payload.
    fn build_payload(&self, notifiable: &Notifiable, envelope: &Envelope) -> Value {
        let notification = envelope.notification();
        let data = notification
            .to_channel(notifiable, CHANNEL)
            .unwrap_or_else(|| notification.to_array(notifiable));
        json!({
            "id": envelope.id(),
            "type": envelope.type_name(),
            "locale": locale::current(),
            "notifiable": {
                "model": notifiable.model(),
                "key": notifiable.key(),
            },
            "data": data,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    async fn send(&self, notifiable: &Notifiable, envelope: &Envelope) -> Result<Option<Value>> {
        let url = self.resolve_url(notifiable)?;
        self.check_credentials()?;

        let payload = self.build_payload(notifiable, envelope);
        let headers = self.build_headers();

        let mut request = self
            .client
            .request(self.method.clone(), &url)
            .timeout(Duration::from_secs(self.settings.timeout_secs))
            .headers(headers)
            .json(&payload);

        if let Some(WebhookAuth::Basic { username, password }) = &self.settings.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));

        if !status.is_success() {
            warn!("Webhook failed: {} - {}", status, body);
            return Err(Error::service_error(
                CHANNEL,
                json!({ "status": status.as_u16(), "body": body }),
            ));
        }

        debug!(url = %url, "Webhook notification sent");
        Ok(Some(json!({ "status": status.as_u16(), "body": body })))
    }
}

impl ChannelKind for WebhookChannel {
    fn build(context: &ChannelContext, settings: &ChannelSettings) -> Result<Self> {
        let settings = parse_settings::<WebhookSettings>(CHANNEL, settings)?;
        Self::new(settings, context.http.clone())
    }
}
