use super::{JobEvent, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Posts Block Kit messages to an incoming webhook.
pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

fn field(name: &str, value: impl std::fmt::Display) -> Value {
    json!({ "type": "mrkdwn", "text": format!("*{name}:*\n{value}") })
}

fn message(title: &str, fields: Vec<Value>, detail: Option<String>) -> Value {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": { "type": "plain_text", "text": title, "emoji": true }
        }),
        json!({ "type": "section", "fields": fields }),
    ];
    if let Some(detail) = detail {
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": detail }
        }));
    }
    json!({ "text": title, "blocks": blocks })
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &JobEvent) -> Value {
        match event {
            JobEvent::Completed {
                job,
                label,
                attempts,
                duration_secs,
            } => message(
                "Backup Complete",
                vec![
                    field("Job", job),
                    field("Snapshot", format!("`{label}`")),
                    field("Attempts", attempts),
                    field("Duration", format!("{duration_secs}s")),
                ],
                None,
            ),
            JobEvent::Failed { job, reason } => message(
                "Backup Failed",
                vec![field("Job", job)],
                Some(format!("*Error:*\n```{reason}```")),
            ),
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        let payload = self.format_message(&event);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
