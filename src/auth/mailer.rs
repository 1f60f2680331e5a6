//! Outbound account mail.
//!
//! Delivery is a side effect of the auth flows and never decides their
//! outcome: callers log a failed send and carry on.

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailKind {
    Activation,
    PasswordReset,
}

impl MailKind {
    pub fn template(&self) -> &'static str {
        match self {
            MailKind::Activation => "activation",
            MailKind::PasswordReset => "password_reset",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailMessage {
    pub kind: MailKind,
    pub to: String,
    pub login: String,
    pub token: String,
    pub language: String,
}

#[derive(Debug, Error)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);

#[rocket::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: MailMessage) -> Result<(), MailError>;
}

/// Development mailer that only logs the envelope.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[rocket::async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: MailMessage) -> Result<(), MailError> {
        log::info!(
            "mail queued: template={} to={} login={} language={}",
            message.kind.template(),
            message.to,
            message.login,
            message.language
        );
        Ok(())
    }
}

/// Keeps every message in memory. Used by tests to pick up tokens.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<MailMessage>>,
    failing: Mutex<bool>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent sends fail after recording the attempt.
    pub fn fail_sends(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().clone()
    }

    pub fn last_token(&self, kind: MailKind, to: &str) -> Option<String> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|message| message.kind == kind && message.to == to)
            .map(|message| message.token.clone())
    }
}

#[rocket::async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: MailMessage) -> Result<(), MailError> {
        self.sent.lock().push(message);
        if *self.failing.lock() {
            return Err(MailError("smtp unavailable".into()));
        }
        Ok(())
    }
}
