//! Sender adapters: the transport boundary of the dispatcher
//!
//! The dispatcher only sees the [`Sender`] trait. Adapters classify their own
//! failures into [`DeliveryError`] so the retry policy can tell a bounced
//! address from a flaky connection.

use std::{process::Stdio, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info};

use crate::{
    error::{DeliveryError, PermanentError, SystemError, TemporaryError},
    types::{OutboundMessage, Receipt, is_valid_recipient},
};

/// Header carrying the tracking id of trackable messages
pub const TRACKING_HEADER: &str = "X-Tracking-Id";

/// A transport able to hand a message off for delivery.
#[async_trait]
pub trait Sender: Send + Sync + std::fmt::Debug {
    /// Attempt delivery of a single message.
    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, DeliveryError>;
}

/// Accepts everything and logs it. Useful for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

#[async_trait]
impl Sender for LogSender {
    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, DeliveryError> {
        info!(
            item_id = %message.id,
            recipient = %message.recipient,
            subject = %message.subject,
            tracking_id = message.tracking_id.as_deref(),
            "Accepted message (log sender)"
        );

        Ok(Receipt::Accepted)
    }
}

/// Pipes messages to a sendmail-compatible program.
///
/// The exit status follows `sysexits.h`: temporary conditions are retried,
/// address and data errors are not.
#[derive(Debug, Clone)]
pub struct SendmailSender {
    program: String,
    args: Vec<String>,
    from: String,
}

const EX_DATAERR: i32 = 65;
const EX_NOUSER: i32 = 67;
const EX_NOHOST: i32 = 68;
const EX_UNAVAILABLE: i32 = 69;
const EX_OSERR: i32 = 71;
const EX_IOERR: i32 = 74;
const EX_TEMPFAIL: i32 = 75;

fn single_line(value: &str) -> bool {
    !value.contains(['\r', '\n'])
}

impl SendmailSender {
    #[must_use]
    pub const fn new(program: String, args: Vec<String>, from: String) -> Self {
        Self {
            program,
            args,
            from,
        }
    }

    /// Render the message as it is written to the program's stdin.
    ///
    /// # Errors
    /// Unusable recipients and header values containing line breaks are
    /// rejected as permanent failures.
    pub fn render(&self, message: &OutboundMessage) -> Result<String, DeliveryError> {
        if !is_valid_recipient(&message.recipient) {
            return Err(PermanentError::InvalidRecipient(message.recipient.clone()).into());
        }

        if !single_line(&message.subject) {
            return Err(
                PermanentError::MessageRejected("subject contains a line break".to_string())
                    .into(),
            );
        }

        let mut rendered = format!(
            "From: {}\nTo: {}\nSubject: {}\nDate: {}\nMIME-Version: 1.0\n\
             Content-Type: text/html; charset=utf-8\n",
            self.from,
            message.recipient,
            message.subject,
            Utc::now().to_rfc2822(),
        );

        if let Some(tracking_id) = &message.tracking_id {
            rendered.push_str(&format!("{TRACKING_HEADER}: {tracking_id}\n"));
        }

        rendered.push('\n');
        rendered.push_str(&message.body);
        if !rendered.ends_with('\n') {
            rendered.push('\n');
        }

        Ok(rendered)
    }
}

/// Map a sendmail exit code to a send outcome.
fn classify_exit(
    code: Option<i32>,
    recipient: &str,
    stderr: &str,
) -> Result<Receipt, DeliveryError> {
    let detail = || {
        if stderr.is_empty() {
            code.map_or_else(
                || "terminated by signal".to_string(),
                |code| format!("exit status {code}"),
            )
        } else {
            stderr.to_string()
        }
    };

    match code {
        Some(0) => Ok(Receipt::Accepted),
        Some(EX_NOUSER) => Err(PermanentError::InvalidRecipient(recipient.to_string()).into()),
        Some(EX_NOHOST) => Err(PermanentError::UnknownDomain(recipient.to_string()).into()),
        Some(EX_DATAERR) => Err(PermanentError::MessageRejected(detail()).into()),
        Some(EX_UNAVAILABLE | EX_OSERR | EX_IOERR) => {
            Err(TemporaryError::ConnectionFailed(detail()).into())
        }
        Some(EX_TEMPFAIL) => Err(TemporaryError::Deferred(detail()).into()),
        // Unknown statuses are retried like any system error
        _ => Err(SystemError::Internal(format!("sendmail failed: {}", detail())).into()),
    }
}

#[async_trait]
impl Sender for SendmailSender {
    #[tracing::instrument(skip_all, fields(item_id = %message.id))]
    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, DeliveryError> {
        let rendered = self.render(message)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            // Everything after `--` is an address, never an option
            .arg("--")
            .arg(&message.recipient)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SystemError::Io)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SystemError::Internal("child stdin was not captured".to_string()))?;
        // A program that rejects the message up front exits without reading
        // it, so a failed write is only reported if the exit status says nothing.
        let written = stdin.write_all(rendered.as_bytes()).await;
        drop(stdin);

        let output = child.wait_with_output().await.map_err(SystemError::Io)?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        debug!(status = ?output.status, "{} exited", self.program);

        let code = output.status.code();
        let outcome = classify_exit(code, &message.recipient, stderr.trim());

        match written {
            Err(e) if code.is_none() || outcome.is_ok() => Err(SystemError::Io(e).into()),
            _ => outcome,
        }
    }
}

/// Which adapter to build, as read from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderConfig {
    #[default]
    Log,
    Sendmail {
        #[serde(default = "defaults::program")]
        program: String,
        #[serde(default = "defaults::args")]
        args: Vec<String>,
        from: String,
    },
}

impl SenderConfig {
    #[must_use]
    pub fn build(&self) -> Arc<dyn Sender> {
        match self {
            Self::Log => Arc::new(LogSender),
            Self::Sendmail {
                program,
                args,
                from,
            } => Arc::new(SendmailSender::new(
                program.clone(),
                args.clone(),
                from.clone(),
            )),
        }
    }
}

mod defaults {
    pub fn program() -> String {
        String::from("/usr/sbin/sendmail")
    }

    pub fn args() -> Vec<String> {
        vec![String::from("-i")]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::QueueItemId;

    fn message(tracking_id: Option<&str>) -> OutboundMessage {
        OutboundMessage {
            id: QueueItemId::new(1),
            recipient: "alice@example.com".to_string(),
            subject: "Your invoice".to_string(),
            body: "<p>Thanks</p>".to_string(),
            tracking_id: tracking_id.map(ToString::to_string),
        }
    }

    fn sendmail() -> SendmailSender {
        SendmailSender::new(
            "/usr/sbin/sendmail".to_string(),
            vec!["-i".to_string()],
            "noreply@example.com".to_string(),
        )
    }

    #[test]
    fn test_render_includes_tracking_header() {
        let rendered = sendmail().render(&message(Some("01ABC"))).unwrap();

        assert!(rendered.starts_with("From: noreply@example.com\nTo: alice@example.com\n"));
        assert!(rendered.contains("\nX-Tracking-Id: 01ABC\n"));
        assert!(rendered.ends_with("\n\n<p>Thanks</p>\n"));

        let untracked = sendmail().render(&message(None)).unwrap();
        assert!(!untracked.contains(TRACKING_HEADER));
    }

    #[test]
    fn test_render_rejects_header_injection() {
        let mut bad = message(None);
        bad.subject = "Hi\nBcc: everyone@example.com".to_string();
        assert!(sendmail().render(&bad).unwrap_err().is_permanent());

        let mut bad = message(None);
        bad.recipient = "alice@example.com\nBcc: x@example.com".to_string();
        assert!(sendmail().render(&bad).unwrap_err().is_permanent());
    }

    #[test]
    fn test_render_rejects_option_like_recipient() {
        for recipient in ["-oQ/tmp/evil@example.com", "-X/var/log/mail@example.com"] {
            let mut bad = message(None);
            bad.recipient = recipient.to_string();

            let error = sendmail().render(&bad).unwrap_err();
            assert!(error.is_permanent(), "{recipient} was accepted");
        }
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(Some(0), "a@b", "").unwrap(), Receipt::Accepted);

        for code in [EX_NOUSER, EX_NOHOST, EX_DATAERR] {
            assert!(classify_exit(Some(code), "a@b", "").unwrap_err().is_permanent());
        }

        for code in [EX_TEMPFAIL, EX_UNAVAILABLE, EX_OSERR, EX_IOERR] {
            assert!(classify_exit(Some(code), "a@b", "").unwrap_err().is_temporary());
        }

        assert!(classify_exit(Some(1), "a@b", "boom").unwrap_err().is_system());

        let killed = classify_exit(None, "a@b", "").unwrap_err();
        assert!(killed.is_system());
        assert!(killed.to_string().contains("signal"));
    }

    #[tokio::test]
    async fn test_log_sender_accepts() {
        assert_eq!(
            LogSender.send(&message(Some("t"))).await.unwrap(),
            Receipt::Accepted
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sendmail_exit_codes() {
        let accepting = SendmailSender::new(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "cat > /dev/null".to_string()],
            "noreply@example.com".to_string(),
        );
        assert_eq!(
            accepting.send(&message(None)).await.unwrap(),
            Receipt::Accepted
        );

        let deferring = SendmailSender::new(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "cat > /dev/null; exit 75".to_string()],
            "noreply@example.com".to_string(),
        );
        assert!(deferring.send(&message(None)).await.unwrap_err().is_temporary());

        let missing = SendmailSender::new(
            "/nonexistent/sendmail".to_string(),
            Vec::new(),
            "noreply@example.com".to_string(),
        );
        assert!(missing.send(&message(None)).await.unwrap_err().is_system());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recipient_follows_option_terminator() {
        // `sh -c` binds the first trailing argument to `$0`
        let strict = SendmailSender::new(
            "/bin/sh".to_string(),
            vec![
                "-c".to_string(),
                r#"[ "$0" = "--" ] && [ "$1" = "alice@example.com" ] && [ $# -eq 1 ] || exit 1; cat > /dev/null"#
                    .to_string(),
            ],
            "noreply@example.com".to_string(),
        );

        assert_eq!(strict.send(&message(None)).await.unwrap(), Receipt::Accepted);

        let mut bad = message(None);
        bad.recipient = "-oQ/tmp/evil@example.com".to_string();
        assert!(strict.send(&bad).await.unwrap_err().is_permanent());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_classified_by_status() {
        let mut large = message(None);
        large.body = "x".repeat(256 * 1024);

        // Exits without reading stdin, so the write hits a closed pipe
        let no_user = SendmailSender::new(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "exit 67".to_string()],
            "noreply@example.com".to_string(),
        );
        let error = no_user.send(&large).await.unwrap_err();
        assert!(
            matches!(
                error,
                DeliveryError::Permanent(PermanentError::InvalidRecipient(ref address))
                    if address == "alice@example.com"
            ),
            "unexpected {error:?}"
        );

        let no_host = SendmailSender::new(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "exit 68".to_string()],
            "noreply@example.com".to_string(),
        );
        assert!(no_host.send(&large).await.unwrap_err().is_permanent());

        // A clean exit that never read the message did not accept it
        let careless = SendmailSender::new(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "exit 0".to_string()],
            "noreply@example.com".to_string(),
        );
        assert!(matches!(
            careless.send(&large).await.unwrap_err(),
            DeliveryError::System(SystemError::Io(_))
        ));
    }
}
