use super::{JobEvent, NotificationChannel};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Hands a plain text message to the local MTA through `sendmail -t`.
pub struct MailNotifier {
    address: String,
    sendmail: String,
}

impl MailNotifier {
    pub fn new(address: String) -> Self {
        Self {
            address,
            sendmail: "sendmail".into(),
        }
    }

    fn format_message(&self, event: &JobEvent) -> String {
        let body = match event {
            JobEvent::Completed {
                job,
                label,
                attempts,
                duration_secs,
            } => format!(
                "Job: {job}\nSnapshot: {label}\nAttempts: {attempts}\nDuration: {duration_secs}s\n"
            ),
            JobEvent::Failed { job, reason } => format!("Job: {job}\nError: {reason}\n"),
        };
        format!(
            "To: {}\nSubject: [uberbackup] {}\n\n{}",
            self.address,
            event.summary(),
            body
        )
    }
}

#[async_trait]
impl NotificationChannel for MailNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        let message = self.format_message(&event);
        let mut child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}", self.sendmail, e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to get sendmail stdin"))?;
        stdin.write_all(message.as_bytes()).await?;
        drop(stdin);

        let status = child.wait().await?;
        if !status.success() {
            bail!("sendmail exited with {}", status);
        }
        Ok(())
    }
}
