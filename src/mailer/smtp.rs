//! Plain SMTP delivery via lettre.

use lettre::{SmtpTransport, Transport};

use crate::error::DeliveryError;
use crate::mailer::{Email, Mailer};

/// Opens a fresh, unencrypted SMTP connection for every email.
#[derive(Debug, Clone, Copy)]
pub struct SmtpMailer {
    port: u16,
}

impl SmtpMailer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for SmtpMailer {
    fn default() -> Self {
        Self::new(lettre::transport::smtp::SMTP_PORT)
    }
}

impl Mailer for SmtpMailer {
    fn deliver(&self, host: &str, email: &Email) -> Result<(), DeliveryError> {
        let message = email.to_message()?;

        // No TLS and no AUTH: the relay is expected on the local network.
        let transport = SmtpTransport::builder_dangerous(host)
            .port(self.port)
            .build();

        transport
            .send(&message)
            .map_err(|e| DeliveryError::Transport {
                host: format!("{host}:{}", self.port),
                reason: e.to_string(),
            })?;

        tracing::info!(
            host,
            port = self.port,
            from = %email.from,
            to = %email.recipients(),
            "Email sent"
        );
        Ok(())
    }
}
