use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from message validation or delivery.
#[derive(Debug, Error)]
pub enum EmailError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("message has neither text nor html body")]
    MissingBody,

    #[error("message has no recipients")]
    MissingRecipients,

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("provider configuration error: {0}")]
    Configuration(String),
}

/// A normalized email address with an optional display name.
///
/// Accepts either a bare address, a `"Name <addr>"` string, or the
/// structured `{address, display_name}` form; all collapse to this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AddressInput", into = "AddressOutput")]
pub struct EmailAddress {
    pub address: String,
    pub display_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddressInput {
    Bare(String),
    Structured {
        address: String,
        #[serde(default)]
        display_name: Option<String>,
    },
}

#[derive(Serialize)]
struct AddressOutput {
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
}

impl From<AddressInput> for EmailAddress {
    fn from(input: AddressInput) -> Self {
        match input {
            AddressInput::Bare(s) => Self::parse_lenient(&s),
            AddressInput::Structured {
                address,
                display_name,
            } => Self {
                address,
                display_name,
            },
        }
    }
}

impl From<EmailAddress> for AddressOutput {
    fn from(addr: EmailAddress) -> Self {
        Self {
            address: addr.address,
            display_name: addr.display_name,
        }
    }
}

impl EmailAddress {
    /// Parse `"Name <addr>"` or a bare address, without validating.
    fn parse_lenient(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(open) = trimmed.rfind('<')
            && trimmed.ends_with('>')
        {
            let name = trimmed[..open].trim().trim_matches('"').to_owned();
            let address = trimmed[open + 1..trimmed.len() - 1].trim().to_owned();
            return Self {
                address,
                display_name: (!name.is_empty()).then_some(name),
            };
        }
        Self {
            address: trimmed.to_owned(),
            display_name: None,
        }
    }

    /// Parse and validate.
    pub fn parse(raw: &str) -> Result<Self, EmailError> {
        let addr = Self::parse_lenient(raw);
        addr.validate()?;
        Ok(addr)
    }

    /// Require an `@` in the address and a non-empty display name when one
    /// is present.
    pub fn validate(&self) -> Result<(), EmailError> {
        let at = self.address.find('@');
        let valid = at.is_some_and(|i| i > 0 && i < self.address.len() - 1);
        if !valid {
            return Err(EmailError::InvalidAddress(self.address.clone()));
        }
        if self
            .display_name
            .as_ref()
            .is_some_and(|n| n.trim().is_empty())
        {
            return Err(EmailError::InvalidAddress(format!(
                "empty display name for {}",
                self.address
            )));
        }
        Ok(())
    }

    /// Render as `"Name <addr>"` or the bare address.
    #[must_use]
    pub fn to_header(&self) -> String {
        match &self.display_name {
            Some(name) => format!("{name} <{}>", self.address),
            None => self.address.clone(),
        }
    }
}

/// A validated outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
    pub subject: String,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub html_body: Option<String>,
    #[serde(default)]
    pub from: Option<EmailAddress>,
    #[serde(default)]
    pub reply_to: Option<EmailAddress>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl EmailMessage {
    /// A plain-text message to a single recipient.
    pub fn text(to: &str, subject: impl Into<String>, body: impl Into<String>) -> Result<Self, EmailError> {
        Ok(Self {
            to: vec![EmailAddress::parse(to)?],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            text_body: Some(body.into()),
            html_body: None,
            from: None,
            reply_to: None,
            headers: HashMap::new(),
        })
    }

    /// Validate recipients, addresses, headers, and body presence.
    pub fn validate(&self) -> Result<(), EmailError> {
        if self.to.is_empty() {
            return Err(EmailError::MissingRecipients);
        }
        for addr in self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .chain(&self.from)
            .chain(&self.reply_to)
        {
            addr.validate()?;
        }
        if self.text_body.is_none() && self.html_body.is_none() {
            return Err(EmailError::MissingBody);
        }
        for name in self.headers.keys() {
            if name.trim().is_empty() || name.contains(['\r', '\n']) {
                return Err(EmailError::Configuration(format!(
                    "invalid header name {name:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_angle_address() {
        let addr = EmailAddress::parse("Ada Lovelace <ada@example.com>").unwrap();
        assert_eq!(addr.address, "ada@example.com");
        assert_eq!(addr.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(addr.to_header(), "Ada Lovelace <ada@example.com>");
    }

    #[test]
    fn parses_bare_address() {
        let addr = EmailAddress::parse("ada@example.com").unwrap();
        assert_eq!(addr.address, "ada@example.com");
        assert!(addr.display_name.is_none());
    }

    #[test]
    fn rejects_address_without_at() {
        assert!(EmailAddress::parse("not-an-address").is_err());
        assert!(EmailAddress::parse("@example.com").is_err());
        assert!(EmailAddress::parse("user@").is_err());
    }

    #[test]
    fn structured_address_deserializes() {
        let addr: EmailAddress = serde_json::from_value(serde_json::json!({
            "address": "ada@example.com",
            "display_name": "Ada"
        }))
        .unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Ada"));

        let bare: EmailAddress = serde_json::from_value(serde_json::json!("bob@example.com")).unwrap();
        assert_eq!(bare.address, "bob@example.com");
    }

    #[test]
    fn message_requires_some_body() {
        let mut msg = EmailMessage::text("a@b.com", "subject", "body").unwrap();
        msg.validate().unwrap();
        msg.text_body = None;
        assert!(matches!(msg.validate(), Err(EmailError::MissingBody)));
        msg.html_body = Some("<p>hi</p>".into());
        msg.validate().unwrap();
    }

    #[test]
    fn message_requires_recipients() {
        let mut msg = EmailMessage::text("a@b.com", "s", "b").unwrap();
        msg.to.clear();
        assert!(matches!(msg.validate(), Err(EmailError::MissingRecipients)));
    }

    #[test]
    fn empty_display_name_is_rejected() {
        let addr = EmailAddress {
            address: "a@b.com".into(),
            display_name: Some("  ".into()),
        };
        assert!(addr.validate().is_err());
    }

    #[test]
    fn header_names_must_be_sane() {
        let mut msg = EmailMessage::text("a@b.com", "s", "b").unwrap();
        msg.headers.insert("X-Latchflow".into(), "ok".into());
        msg.validate().unwrap();
        msg.headers.insert("Bad\r\nHeader".into(), "x".into());
        assert!(msg.validate().is_err());
    }
}
