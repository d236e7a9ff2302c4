use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::message::{EmailAddress, EmailError, EmailMessage};
use crate::provider::EmailProvider;

/// SMTP transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Default From when a message does not carry one.
    pub from: String,
    /// Use STARTTLS (true) or an implicit-TLS connection.
    #[serde(default)]
    pub starttls: bool,
}

fn default_port() -> u16 {
    587
}

/// SMTP delivery backend over `lettre`.
pub struct SmtpProvider {
    config: SmtpConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for SmtpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpProvider")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .finish_non_exhaustive()
    }
}

impl SmtpProvider {
    pub fn new(config: SmtpConfig) -> Result<Self, EmailError> {
        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| EmailError::Configuration(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| EmailError::Configuration(e.to_string()))?
        }
        .port(config.port);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            config,
        })
    }
}

fn mailbox(addr: &EmailAddress) -> Result<Mailbox, EmailError> {
    addr.to_header()
        .parse()
        .map_err(|e| EmailError::InvalidAddress(format!("{}: {e}", addr.address)))
}

fn build_message(msg: &EmailMessage, default_from: &str) -> Result<Message, EmailError> {
    let from = match &msg.from {
        Some(addr) => mailbox(addr)?,
        None => default_from
            .parse()
            .map_err(|e| EmailError::Configuration(format!("invalid default from: {e}")))?,
    };

    let mut builder = Message::builder().from(from).subject(&msg.subject);
    for to in &msg.to {
        builder = builder.to(mailbox(to)?);
    }
    for cc in &msg.cc {
        builder = builder.cc(mailbox(cc)?);
    }
    for bcc in &msg.bcc {
        builder = builder.bcc(mailbox(bcc)?);
    }
    if let Some(reply_to) = &msg.reply_to {
        builder = builder.reply_to(mailbox(reply_to)?);
    }

    let built = match (&msg.text_body, &msg.html_body) {
        (Some(text), Some(html)) => builder.multipart(
            MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(lettre::message::header::ContentType::TEXT_PLAIN)
                        .body(text.clone()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(lettre::message::header::ContentType::TEXT_HTML)
                        .body(html.clone()),
                ),
        ),
        (Some(text), None) => builder.body(text.clone()),
        (None, Some(html)) => builder.singlepart(
            SinglePart::builder()
                .header(lettre::message::header::ContentType::TEXT_HTML)
                .body(html.clone()),
        ),
        (None, None) => return Err(EmailError::MissingBody),
    };
    built.map_err(|e| EmailError::Delivery(format!("failed to build message: {e}")))
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        message.validate()?;
        let lettre_message = build_message(message, &self.config.from)?;

        debug!(subject = %message.subject, "sending email via SMTP");
        self.transport.send(lettre_message).await.map_err(|e| {
            error!(error = %e, "SMTP send failed");
            EmailError::Delivery(e.to_string())
        })?;
        info!(subject = %message.subject, "email sent");
        Ok(())
    }
}
