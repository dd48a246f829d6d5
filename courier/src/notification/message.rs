//! Message builders returned by notifications for the built-in channels.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// Visual level of a mail message.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MailLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl MailLevel {
    /// Accent colour used by the HTML rendering.
    pub fn color(&self) -> &'static str {
        match self {
            Self::Info => "#3498db",
            Self::Success => "#2ecc71",
            Self::Warning => "#f39c12",
            Self::Error => "#e74c3c",
        }
    }
}

/// An address with an optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Address {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }
}

/// A file attached to a mail message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub file: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Mail content produced by `Notification::to_mail`.
///
/// Lines added before `action` become intro lines, lines added after it
/// become outro lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub subject: Option<String>,
    pub view: Option<String>,
    pub view_data: Map<String, Value>,
    pub level: MailLevel,
    pub greeting: Option<String>,
    pub salutation: Option<String>,
    pub intro_lines: Vec<String>,
    pub outro_lines: Vec<String>,
    pub action_text: Option<String>,
    pub action_url: Option<String>,
    pub from: Option<Address>,
    pub reply_to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub attachments: Vec<Attachment>,
}

impl MailMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Render through a named template instead of the default layout.
    pub fn view(mut self, view: impl Into<String>, data: Map<String, Value>) -> Self {
        self.view = Some(view.into());
        self.view_data = data;
        self
    }

    pub fn level(mut self, level: MailLevel) -> Self {
        self.level = level;
        self
    }

    pub fn success(self) -> Self {
        self.level(MailLevel::Success)
    }

    pub fn warning(self) -> Self {
        self.level(MailLevel::Warning)
    }

    pub fn error(self) -> Self {
        self.level(MailLevel::Error)
    }

    pub fn greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    pub fn salutation(mut self, salutation: impl Into<String>) -> Self {
        self.salutation = Some(salutation.into());
        self
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        if self.action_text.is_none() {
            self.intro_lines.push(line.into());
        } else {
            self.outro_lines.push(line.into());
        }
        self
    }

    pub fn line_if(self, condition: bool, line: impl Into<String>) -> Self {
        if condition { self.line(line) } else { self }
    }

    pub fn action(mut self, text: impl Into<String>, url: impl Into<String>) -> Self {
        self.action_text = Some(text.into());
        self.action_url = Some(url.into());
        self
    }

    pub fn from(mut self, address: impl Into<String>, name: Option<String>) -> Self {
        self.from = Some(Address::new(address, name));
        self
    }

    pub fn reply_to(mut self, address: impl Into<String>, name: Option<String>) -> Self {
        self.reply_to.push(Address::new(address, name));
        self
    }

    pub fn cc(mut self, address: impl Into<String>, name: Option<String>) -> Self {
        self.cc.push(Address::new(address, name));
        self
    }

    pub fn bcc(mut self, address: impl Into<String>, name: Option<String>) -> Self {
        self.bcc.push(Address::new(address, name));
        self
    }

    pub fn attach(mut self, file: impl Into<String>, options: Map<String, Value>) -> Self {
        self.attachments.push(Attachment {
            file: file.into(),
            options,
        });
        self
    }

    /// Plain-text body.
    pub fn render_text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(greeting) = &self.greeting {
            parts.push(greeting.clone());
        }
        parts.extend(self.intro_lines.iter().cloned());
        if let (Some(text), Some(url)) = (&self.action_text, &self.action_url) {
            parts.push(format!("{}: {}", text, url));
        }
        parts.extend(self.outro_lines.iter().cloned());
        if let Some(salutation) = &self.salutation {
            parts.push(salutation.clone());
        }
        parts.join("\n\n")
    }

    /// HTML body using the default layout.
    pub fn render_html(&self) -> String {
        let paragraphs = |lines: &[String]| {
            lines
                .iter()
                .map(|line| format!("        <p>{}</p>\n", escape_html(line)))
                .collect::<String>()
        };

        let greeting = self
            .greeting
            .as_deref()
            .map(|g| format!("        <h2>{}</h2>\n", escape_html(g)))
            .unwrap_or_default();
        let action = match (&self.action_text, &self.action_url) {
            (Some(text), Some(url)) => format!(
                "        <p><a class=\"button\" href=\"{}\">{}</a></p>\n",
                escape_html(url),
                escape_html(text)
            ),
            _ => String::new(),
        };
        let salutation = self
            .salutation
            .as_deref()
            .map(|s| format!("        <p>{}</p>\n", escape_html(s)))
            .unwrap_or_default();

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 20px; }}
        .content {{ padding: 20px; background-color: #f9f9f9; border-top: 4px solid {}; border-radius: 5px; }}
        .button {{ background-color: {}; color: white; padding: 10px 18px; border-radius: 4px; text-decoration: none; }}
    </style>
</head>
<body>
    <div class="content">
{}{}{}{}{}    </div>
</body>
</html>"#,
            self.level.color(),
            self.level.color(),
            greeting,
            paragraphs(&self.intro_lines),
            action,
            paragraphs(&self.outro_lines),
            salutation,
        )
    }

    /// Summary used by capture assertions and logs.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "level": self.level.to_string(),
            "subject": self.subject,
            "greeting": self.greeting,
            "salutation": self.salutation,
            "introLines": self.intro_lines,
            "outroLines": self.outro_lines,
            "actionText": self.action_text,
            "actionUrl": self.action_url,
        })
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// A button attached to a database notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            url: None,
            kind: None,
            icon: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Payload stored by the database channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseMessage {
    data: Map<String, Value>,
}

impl DatabaseMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the payload wholesale.
    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn title(self, title: impl Into<String>) -> Self {
        self.set("title", title.into())
    }

    pub fn message(self, message: impl Into<String>) -> Self {
        self.set("message", message.into())
    }

    pub fn kind(self, kind: impl Into<String>) -> Self {
        self.set("type", kind.into())
    }

    pub fn action_url(self, url: impl Into<String>) -> Self {
        self.set("action_url", url.into())
    }

    pub fn icon(self, icon: impl Into<String>) -> Self {
        self.set("icon", icon.into())
    }

    pub fn icon_class(self, icon_class: impl Into<String>) -> Self {
        self.set("icon_class", icon_class.into())
    }

    pub fn actions(self, actions: Vec<Action>) -> Self {
        let actions = actions.iter().map(Action::to_value).collect::<Vec<_>>();
        self.set("actions", actions)
    }

    pub fn add_action(mut self, action: Action) -> Self {
        match self.data.get_mut("actions") {
            Some(Value::Array(actions)) => actions.push(action.to_value()),
            _ => {
                self.data
                    .insert("actions".to_string(), Value::Array(vec![action.to_value()]));
            }
        }
        self
    }

    pub fn get_data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

impl From<DatabaseMessage> for Value {
    fn from(message: DatabaseMessage) -> Self {
        Value::Object(message.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_lines_split_around_action() {
        let message = MailMessage::new()
            .line("Your invoice is ready.")
            .action("View invoice", "https://example.com/invoices/1")
            .line("Thanks for your business.")
            .line_if(false, "never shown");

        assert_eq!(message.intro_lines, vec!["Your invoice is ready."]);
        assert_eq!(message.outro_lines, vec!["Thanks for your business."]);
    }

    #[test]
    fn test_render_escapes_html() {
        let message = MailMessage::new()
            .error()
            .greeting("Hello <admin>")
            .line("a & b");

        let html = message.render_html();
        assert!(html.contains("Hello &lt;admin&gt;"));
        assert!(html.contains("a &amp; b"));
        assert!(html.contains(MailLevel::Error.color()));

        let text = message.render_text();
        assert_eq!(text, "Hello <admin>\n\na & b");
    }

    #[test]
    fn test_mail_level_parse() {
        assert_eq!(MailLevel::from_str("warning").unwrap(), MailLevel::Warning);
        assert_eq!(MailLevel::Success.to_string(), "success");
    }

    #[test]
    fn test_database_message_builder() {
        let message = DatabaseMessage::new()
            .title("New Message")
            .message("You have a new message")
            .action_url("/messages/1")
            .icon_class("fa fa-envelope")
            .add_action(Action::new("view").label("View").url("/messages/1"))
            .add_action(Action::new("dismiss").kind("secondary"));

        let value = message.to_value();
        assert_eq!(value["title"], "New Message");
        assert_eq!(value["action_url"], "/messages/1");
        assert_eq!(value["actions"][0]["label"], "View");
        assert_eq!(value["actions"][1]["type"], "secondary");
        assert!(value["actions"][1].get("url").is_none());
    }
}
