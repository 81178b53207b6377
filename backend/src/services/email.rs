use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};

use crate::config::SmtpConfig;
use crate::error::{WorkflowError, WorkflowResult};

/// A rendered message ready for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> WorkflowResult<()>;
}

/// Splits a templated recipient field on commas and semicolons.
pub fn parse_recipients(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone)]
pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl EmailService {
    pub fn new(smtp_config: &SmtpConfig) -> WorkflowResult<Self> {
        let builder = if smtp_config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp_config.host)
                .map_err(|e| WorkflowError::Email(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
        };

        let mut builder = builder
            .port(smtp_config.port)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)));

        if !smtp_config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                smtp_config.username.clone(),
                smtp_config.password.clone(),
            ));
        }

        Ok(EmailService {
            transport: builder.build(),
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
        })
    }

    fn build_message(&self, email: &OutgoingEmail) -> WorkflowResult<Message> {
        let mailbox = |raw: &str| {
            raw.parse::<Mailbox>()
                .map_err(|e| WorkflowError::Email(format!("invalid address `{}`: {}", raw, e)))
        };

        let from = mailbox(&format!("{} <{}>", self.from_name, self.from_email))?;
        let mut builder = Message::builder().from(from).subject(email.subject.as_str());
        for to in &email.to {
            builder = builder.to(mailbox(to)?);
        }
        for cc in &email.cc {
            builder = builder.cc(mailbox(cc)?);
        }

        let content_type = if email.is_html {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };

        builder
            .header(content_type)
            .body(email.body.clone())
            .map_err(|e| WorkflowError::Email(e.to_string()))
    }
}

#[async_trait]
impl EmailTransport for EmailService {
    async fn send(&self, email: OutgoingEmail) -> WorkflowResult<()> {
        if email.to.is_empty() {
            return Err(WorkflowError::Email("no recipients".to_string()));
        }

        let message = self.build_message(&email)?;
        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent successfully to {}", email.to.join(", "));
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", email.to.join(", "), e);
                Err(WorkflowError::Email(e.to_string()))
            }
        }
    }
}
