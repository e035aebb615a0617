mod mail;
mod slack;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::GlobalConfig;

pub use mail::MailNotifier;
pub use slack::SlackNotifier;

/// Events that trigger notifications
#[derive(Debug, Clone)]
pub enum JobEvent {
    Completed {
        job: String,
        label: String,
        attempts: u32,
        duration_secs: u64,
    },
    Failed {
        job: String,
        reason: String,
    },
}

impl JobEvent {
    /// One line summary, also used as mail subject.
    pub fn summary(&self) -> String {
        match self {
            JobEvent::Completed { job, label, .. } => {
                format!("Backup {job} finished successfully ({label})")
            }
            JobEvent::Failed { job, reason } => format!("Backup {job} failed: {reason}"),
        }
    }
}

/// Trait for notification channel implementations (mail, Slack)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: JobEvent) -> Result<()>;
}

/// Build every channel enabled in the global config.
pub fn create_notifiers(config: &GlobalConfig) -> Vec<Arc<dyn NotificationChannel>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    if let Some(address) = &config.mailto {
        channels.push(Arc::new(MailNotifier::new(address.clone())));
    }
    if let Some(webhook) = &config.slack_webhook {
        channels.push(Arc::new(SlackNotifier::new(webhook.clone())));
    }
    channels
}
