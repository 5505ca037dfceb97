//! Outbound mail. Delivery happens on tracked background tasks and never
//! feeds back into the request that triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use gchat_types::models::{Token, User};

pub const MAIL_ATTEMPTS: u32 = 3;
pub const MAIL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<(), MailError>;
}

/// Writes mail to the log instead of a transport. Used in development and
/// wherever no SMTP relay is configured.
pub struct LogMailer {
    sender: String,
}

impl LogMailer {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
        }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        info!(
            from = %self.sender,
            to = %mail.recipient,
            subject = %mail.subject,
            "{}",
            mail.body
        );
        Ok(())
    }
}

pub fn activation_mail(user: &User, token: &Token) -> Mail {
    Mail {
        recipient: user.email.clone(),
        subject: "Welcome to gchat!".to_string(),
        body: format!(
            "Hi {},\n\nThanks for signing up. To activate your account send a \
             POST /api/v1/users/account/activate request with the body\n\n\
             {{\"token\": \"{}\"}}\n\nThe token is valid until {}.",
            user.username, token.plaintext, token.expiry
        ),
    }
}

/// Try `mailer` up to `attempts` times, sleeping `backoff` between tries.
pub async fn send_with_retry(
    mailer: &dyn Mailer,
    mail: &Mail,
    attempts: u32,
    backoff: Duration,
) -> Result<(), MailError> {
    let mut attempt = 1;
    loop {
        match mailer.send(mail).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(attempt, to = %mail.recipient, error = %e, "Mail delivery failed, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Deliver `mail` in the background. Failures are logged and dropped.
pub fn dispatch(tasks: &TaskTracker, mailer: Arc<dyn Mailer>, mail: Mail) {
    tasks.spawn(async move {
        if let Err(e) = send_with_retry(mailer.as_ref(), &mail, MAIL_ATTEMPTS, MAIL_BACKOFF).await {
            error!(to = %mail.recipient, error = %e, "Giving up on mail delivery");
        }
    });
}
