//! Webhook notifications for escalation level changes.
//!
//! This is the hook used to trigger upstream blackholing or paging when the
//! escalation engine reaches CRITICAL, and to stand those measures down when
//! the engine de-escalates.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;

use crate::core::escalation::{EscalationEngine, Level};

/// Errors that can occur while delivering a notification
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Webhook request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Webhook rejected notice: HTTP {0}")]
    Rejected(u16),
}

/// Why a notice was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Critical,
    Deescalate,
}

/// Payload posted to the webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelChangeNotice {
    pub kind: NoticeKind,
    /// Level in force after the change
    pub level: Level,
    pub timestamp: DateTime<Utc>,
    /// Identifies this control plane instance
    pub source: String,
}

/// Posts level change notices to an HTTP endpoint
pub struct WebhookNotifier {
    /// HTTP client
    client: Client,
    /// Endpoint URL
    url: String,
    /// Instance name sent with each notice
    source: String,
}

impl WebhookNotifier {
    /// Create a notifier posting to `url`
    pub fn new(url: String, source: String, timeout: Duration) -> Result<Self, NotifierError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, source })
    }

    /// Build a notice stamped with the current time
    pub fn notice(&self, kind: NoticeKind, level: Level) -> LevelChangeNotice {
        LevelChangeNotice {
            kind,
            level,
            timestamp: Utc::now(),
            source: self.source.clone(),
        }
    }

    /// Deliver a notice
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the endpoint answered with a success status
    /// * `Err(NotifierError::Rejected)` for any other status
    /// * `Err(NotifierError::RequestError)` if the request could not be sent
    pub async fn notify(&self, notice: &LevelChangeNotice) -> Result<(), NotifierError> {
        let response = self.client.post(&self.url).json(notice).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifierError::Rejected(status.as_u16()));
        }

        info!("Delivered {:?} notice for level {}", notice.kind, notice.level);
        Ok(())
    }

    /// Register this notifier as the engine's critical and de-escalation callbacks.
    ///
    /// Delivery runs on the current runtime; failures are logged.
    pub async fn attach(self: Arc<Self>, engine: &EscalationEngine) {
        let handle = Handle::current();

        let notifier = self.clone();
        let critical_handle = handle.clone();
        engine
            .on_critical(move || {
                let notifier = notifier.clone();
                critical_handle.spawn(async move {
                    let notice = notifier.notice(NoticeKind::Critical, Level::Critical);
                    if let Err(e) = notifier.notify(&notice).await {
                        error!("Failed to deliver critical notice: {}", e);
                    }
                });
            })
            .await;

        let notifier = self;
        engine
            .on_deescalate(move |level| {
                let notifier = notifier.clone();
                handle.spawn(async move {
                    let notice = notifier.notice(NoticeKind::Deescalate, level);
                    if let Err(e) = notifier.notify(&notice).await {
                        error!("Failed to deliver de-escalation notice: {}", e);
                    }
                });
            })
            .await;
    }
}
