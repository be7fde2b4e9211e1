//! Outbound notifications about newly assigned deliveries.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::future::Future;

/// Payload posted when a delivery becomes ready for its driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryNotice {
  pub delivery_id: i64,
  pub driver_id: i64,
}

/// What became of a notice that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum NoticeOutcome {
  /// Posted; carries the receiver's response text
  Sent(String),
  /// Nowhere to send it
  Skipped,
}

pub trait Notifier: Send + Sync {
  fn notify(&self, notice: &DeliveryNotice) -> impl Future<Output = Result<NoticeOutcome>> + Send;
}

/// Posts notices as JSON to a webhook. Without a URL, notices are skipped.
#[derive(Clone)]
pub struct WebhookNotifier {
  http: reqwest::Client,
  url: Option<String>,
}

impl WebhookNotifier {
  pub fn new(url: Option<String>) -> Self {
    Self {
      http: reqwest::Client::new(),
      url,
    }
  }
}

impl Notifier for WebhookNotifier {
  async fn notify(&self, notice: &DeliveryNotice) -> Result<NoticeOutcome> {
    let Some(url) = &self.url else {
      return Ok(NoticeOutcome::Skipped);
    };

    let response = self
      .http
      .post(url)
      .json(notice)
      .send()
      .await
      .map_err(|e| eyre!("Failed to post notification: {}", e))?;

    let body = response
      .text()
      .await
      .map_err(|e| eyre!("Failed to read notification response: {}", e))?;
    Ok(NoticeOutcome::Sent(body))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_unconfigured_webhook_skips() {
    let notifier = WebhookNotifier::new(None);
    let notice = DeliveryNotice {
      delivery_id: 300,
      driver_id: 500,
    };
    assert_eq!(notifier.notify(&notice).await.unwrap(), NoticeOutcome::Skipped);
  }

  #[test]
  fn test_notice_payload() {
    let notice = DeliveryNotice {
      delivery_id: 300,
      driver_id: 500,
    };
    assert_eq!(
      serde_json::to_value(&notice).unwrap(),
      serde_json::json!({"delivery_id": 300, "driver_id": 500})
    );
  }
}
