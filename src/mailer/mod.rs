//! Email sender.
//!
//! [`send_email`] is the operation queue payloads are bound to. It validates
//! the addresses, composes a plain-text [`Email`] and hands it to a
//! [`Mailer`]: [`SmtpMailer`] for real delivery or [`DryRunMailer`] which only
//! logs.

mod smtp;

use std::sync::Arc;

use lettre::Message;
use lettre::message::{Mailbox, Mailboxes};
use lettre::message::header::ContentType;
use serde::Deserialize;

use crate::binder::{Bindable, Parameter};
use crate::config::SmtpSettings;
use crate::error::DeliveryError;

pub use smtp::SmtpMailer;

/// Parameters of [`send_email`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendEmail {
    /// SMTP host, injected by the worker from configuration.
    pub host: String,
    pub fromaddr: String,
    pub toaddrs: String,
    pub body: String,
    #[serde(default)]
    pub subject: Option<String>,
}

impl Bindable for SendEmail {
    const PARAMETERS: &'static [Parameter] = &[
        Parameter::required("host"),
        Parameter::required("fromaddr"),
        Parameter::required("toaddrs"),
        Parameter::required("body"),
        Parameter::optional("subject"),
    ];
}

/// A validated, ready-to-send message.
#[derive(Debug, Clone)]
pub struct Email {
    pub from: Mailbox,
    pub to: Vec<Mailbox>,
    pub subject: String,
    pub body: String,
}

impl Email {
    /// Validate addresses and fill in the empty subject.
    pub fn compose(
        fromaddr: &str,
        toaddrs: &str,
        body: &str,
        subject: Option<&str>,
    ) -> Result<Self, DeliveryError> {
        let from = fromaddr
            .trim()
            .parse::<Mailbox>()
            .map_err(|e| DeliveryError::InvalidAddress {
                field: "from",
                value: fromaddr.to_string(),
                reason: e.to_string(),
            })?;

        // Parsed as an RFC 5322 list so quoted display names may contain commas.
        let to: Vec<Mailbox> = toaddrs
            .trim()
            .parse::<Mailboxes>()
            .map_err(|e| DeliveryError::InvalidAddress {
                field: "to",
                value: toaddrs.to_string(),
                reason: e.to_string(),
            })?
            .into_iter()
            .collect();

        if to.is_empty() {
            return Err(DeliveryError::InvalidAddress {
                field: "to",
                value: toaddrs.to_string(),
                reason: "no recipients".into(),
            });
        }

        Ok(Self {
            from,
            to,
            subject: subject.unwrap_or_default().to_string(),
            body: body.to_string(),
        })
    }

    /// Comma-separated recipient list, as it appears in the To header.
    pub fn recipients(&self) -> String {
        self.to
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Build the RFC 5322 message.
    pub fn to_message(&self) -> Result<Message, DeliveryError> {
        let builder = Message::builder()
            .from(self.from.clone())
            .subject(self.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        let builder = self.to.iter().cloned().fold(builder, |b, to| b.to(to));

        builder
            .body(self.body.clone())
            .map_err(|e| DeliveryError::Build(e.to_string()))
    }
}

/// Transmits a composed email to an SMTP host.
pub trait Mailer: Send + Sync {
    fn deliver(&self, host: &str, email: &Email) -> Result<(), DeliveryError>;
}

/// Logs the would-be send instead of transmitting it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunMailer;

impl Mailer for DryRunMailer {
    fn deliver(&self, host: &str, email: &Email) -> Result<(), DeliveryError> {
        tracing::info!(
            host,
            from = %email.from,
            to = %email.recipients(),
            subject = %email.subject,
            body = %email.body,
            "Dry run, email not sent"
        );
        Ok(())
    }
}

/// Pick the mailer for the configured mode.
pub fn from_settings(settings: &SmtpSettings) -> Arc<dyn Mailer> {
    if settings.dry_run {
        Arc::new(DryRunMailer)
    } else {
        Arc::new(SmtpMailer::new(settings.port))
    }
}

/// Send one email. A single attempt; failures are returned, not retried.
pub fn send_email(mailer: &dyn Mailer, params: SendEmail) -> Result<(), DeliveryError> {
    let email = Email::compose(
        &params.fromaddr,
        &params.toaddrs,
        &params.body,
        params.subject.as_deref(),
    )?;
    mailer.deliver(&params.host, &email)?;
    tracing::debug!(host = %params.host, to = %email.recipients(), "Email handed to mailer");
    Ok(())
}
