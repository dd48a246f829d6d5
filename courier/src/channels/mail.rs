//! Email notification channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::{Channel, ChannelContext, ChannelKind, ChannelSettings, parse_settings};
use crate::locale;
use crate::notifiable::Notifiable;
use crate::notification::{Address, Attachment, Envelope, MailMessage};
use crate::Result;

/// Mail channel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailSettings {
    /// Sender address used when the message does not set one.
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default)]
    pub from_name: Option<String>,
    /// Prepended to every subject, e.g. "[courier]".
    #[serde(default)]
    pub subject_prefix: Option<String>,
}

/// A fully rendered email ready for a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMail {
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub from: Option<Address>,
    pub reply_to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub attachments: Vec<Attachment>,
    /// Template requested by the message, rendered by the transport.
    pub view: Option<String>,
    pub view_data: Map<String, Value>,
    /// Locale active while the mail was rendered.
    pub locale: String,
}

/// Outbound mail transport.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Hand the mail over; the returned value is the transport's receipt.
    async fn deliver(&self, mail: &OutgoingMail) -> Result<Value>;
}

/// Transport that only logs outgoing mail.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(&self, mail: &OutgoingMail) -> Result<Value> {
        info!(
            to = ?mail.to,
            subject = %mail.subject,
            locale = %mail.locale,
            "Mail delivered to log transport"
        );
        Ok(json!({ "transport": "log", "to": mail.to }))
    }
}

/// Renders `Notification::to_mail` and hands it to a [`MailTransport`].
pub struct MailChannel {
    settings: MailSettings,
    transport: Arc<dyn MailTransport>,
}

impl MailChannel {
    pub fn new(settings: MailSettings, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            settings,
            transport,
        }
    }

    /// Recipient addresses for `notifiable`.
    fn recipients(&self, notifiable: &Notifiable) -> Vec<String> {
        match notifiable {
            Notifiable::Anonymous(anonymous) => anonymous
                .route_for("mail")
                .map(addresses_from_route)
                .unwrap_or_default(),
            Notifiable::Entity(entity) => {
                if let Some(route) = entity.route_notification_for("mail") {
                    let addresses = addresses_from_route(&route);
                    if !addresses.is_empty() {
                        return addresses;
                    }
                }
                entity
                    .to_data()
                    .get("email")
                    .and_then(Value::as_str)
                    .filter(|email| !email.is_empty())
                    .map(|email| vec![email.to_string()])
                    .unwrap_or_default()
            }
        }
    }

    fn build_subject(&self, message: &MailMessage, envelope: &Envelope) -> String {
        let subject = message
            .subject
            .clone()
            .unwrap_or_else(|| default_subject(envelope.type_name()));
        match self.settings.subject_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{} {}", prefix, subject),
            _ => subject,
        }
    }

    fn build_mail(&self, message: MailMessage, to: Vec<String>, envelope: &Envelope) -> OutgoingMail {
        let subject = self.build_subject(&message, envelope);
        let from = message.from.clone().or_else(|| {
            self.settings
                .from_address
                .clone()
                .map(|address| Address::new(address, self.settings.from_name.clone()))
        });
        OutgoingMail {
            to,
            subject,
            text: message.render_text(),
            html: message.render_html(),
            from,
            reply_to: message.reply_to,
            cc: message.cc,
            bcc: message.bcc,
            attachments: message.attachments,
            view: message.view,
            view_data: message.view_data,
            locale: locale::current(),
        }
    }
}

fn addresses_from_route(route: &Value) -> Vec<String> {
    match route {
        Value::String(address) if !address.is_empty() => vec![address.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        // `{address: display name}`
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// `app::notifications::InvoicePaid` -> `Invoice Paid`.
fn default_subject(type_name: &str) -> String {
    let short = type_name.rsplit("::").next().unwrap_or(type_name);
    let mut subject = String::with_capacity(short.len() + 4);
    for (i, ch) in short.chars().enumerate() {
        if i > 0 && ch.is_uppercase() {
            subject.push(' ');
        }
        subject.push(ch);
    }
    subject
}

#[async_trait]
impl Channel for MailChannel {
    async fn send(&self, notifiable: &Notifiable, envelope: &Envelope) -> Result<Option<Value>> {
        let Some(message) = envelope.notification().to_mail(notifiable) else {
            debug!(notifiable = %notifiable.label(), "No mail message; skipping");
            return Ok(None);
        };

        let recipients = self.recipients(notifiable);
        if recipients.is_empty() {
            debug!(notifiable = %notifiable.label(), "No mail recipients; skipping");
            return Ok(None);
        }

        let mail = self.build_mail(message, recipients, envelope);
        let receipt = self.transport.deliver(&mail).await?;
        debug!(subject = %mail.subject, "Mail notification sent");
        Ok(Some(receipt))
    }
}

impl ChannelKind for MailChannel {
    fn build(context: &ChannelContext, settings: &ChannelSettings) -> Result<Self> {
        let settings = parse_settings::<MailSettings>("mail", settings)?;
        Ok(Self::new(settings, Arc::clone(&context.mailer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifiable::{AnonymousNotifiable, EntityRecord};
    use crate::notification::Notification;
    use crate::testing::MemoryTransport;

    struct InvoicePaid {
        with_mail: bool,
    }

    impl Notification for InvoicePaid {
        fn via(&self, _notifiable: &Notifiable) -> Vec<String> {
            vec!["mail".to_string()]
        }

        fn to_mail(&self, _notifiable: &Notifiable) -> Option<MailMessage> {
            self.with_mail
                .then(|| MailMessage::new().greeting("Hello").line("Your invoice was paid."))
        }
    }

    fn channel(transport: Arc<MemoryTransport>) -> MailChannel {
        let settings = MailSettings {
            from_address: Some("noreply@example.com".to_string()),
            subject_prefix: Some("[shop]".to_string()),
            ..Default::default()
        };
        MailChannel::new(settings, transport)
    }

    #[test]
    fn test_default_subject() {
        assert_eq!(default_subject("app::notifications::InvoicePaid"), "Invoice Paid");
        assert_eq!(default_subject("Welcome"), "Welcome");
    }

    #[test]
    fn test_addresses_from_route() {
        assert_eq!(addresses_from_route(&json!("a@example.com")), vec!["a@example.com"]);
        assert_eq!(
            addresses_from_route(&json!(["a@example.com", "b@example.com"])),
            vec!["a@example.com", "b@example.com"]
        );
        assert_eq!(
            addresses_from_route(&json!({"ops@example.com": "Ops"})),
            vec!["ops@example.com"]
        );
        assert!(addresses_from_route(&json!(null)).is_empty());
    }

    #[tokio::test]
    async fn test_sends_to_entity_email() {
        let transport = Arc::new(MemoryTransport::new());
        let channel = channel(transport.clone());
        let user = Notifiable::from(EntityRecord::new("Users", "1").field("email", "ada@example.com"));

        let envelope = Envelope::new(InvoicePaid { with_mail: true });
        let receipt = locale::scope(Some("fr".to_string()), channel.send(&user, &envelope))
            .await
            .unwrap();
        assert!(receipt.is_some());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["ada@example.com"]);
        assert_eq!(sent[0].subject, "[shop] Invoice Paid");
        assert_eq!(sent[0].locale, "fr");
        assert_eq!(sent[0].from.as_ref().unwrap().address, "noreply@example.com");
        assert!(sent[0].text.contains("Your invoice was paid."));
    }

    #[tokio::test]
    async fn test_no_message_or_no_recipient_is_none() {
        let transport = Arc::new(MemoryTransport::new());
        let channel = channel(transport.clone());

        let user = Notifiable::from(EntityRecord::new("Users", "1").field("email", "ada@example.com"));
        let none = channel
            .send(&user, &Envelope::new(InvoicePaid { with_mail: false }))
            .await
            .unwrap();
        assert!(none.is_none());

        let nobody = Notifiable::from(AnonymousNotifiable::new());
        let none = channel
            .send(&nobody, &Envelope::new(InvoicePaid { with_mail: true }))
            .await
            .unwrap();
        assert!(none.is_none());
        assert!(transport.sent().is_empty());
    }
}
