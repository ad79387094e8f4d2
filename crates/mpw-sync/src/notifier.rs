use async_trait::async_trait;
use mpw_core::PriceAlert;
use mpw_storage::{FetchError, HttpFetcher};
use serde_json::json;
use thiserror::Error;

use crate::config::TelegramSettings;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &PriceAlert) -> Result<(), NotifyError>;
}

/// Telegram Bot API `sendMessage` sender.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    http: HttpFetcher,
    settings: TelegramSettings,
}

impl TelegramNotifier {
    pub fn new(http: HttpFetcher, settings: TelegramSettings) -> Self {
        Self { http, settings }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, alert: &PriceAlert) -> Result<(), NotifyError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.bot_token
        );
        let body = json!({
            "chat_id": self.settings.chat_id,
            "text": alert.message(),
            "disable_web_page_preview": false,
        });
        let response = self.http.post_json(&url, &[], &body).await?;
        // The Bot API answers 200 with `ok: false` for some rejections.
        if response.get("ok").and_then(|ok| ok.as_bool()) == Some(false) {
            let description = response
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("unknown error");
            return Err(NotifyError::Rejected(description.to_string()));
        }
        Ok(())
    }
}
