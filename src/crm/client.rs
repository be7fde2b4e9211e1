use crate::config::Config;
use crate::crm::api_types::ApiResponse;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::future::Future;
use url::Url;

/// A CRM REST endpoint that accepts `method` + JSON params.
pub trait CrmApi: Send + Sync {
  fn call(&self, method: &str, params: &Value) -> impl Future<Output = Result<ApiResponse>> + Send;
}

/// CRM API client talking to an inbound webhook URL
#[derive(Clone)]
pub struct CrmClient {
  http: reqwest::Client,
  base: Url,
}

impl CrmClient {
  pub fn new(config: &Config) -> Result<Self> {
    let webhook_url = config.crm_webhook_url()?;

    // A trailing slash makes `join` append instead of replacing the last segment
    let base = Url::parse(&format!("{}/", webhook_url.trim_end_matches('/')))
      .map_err(|e| eyre!("Invalid CRM webhook URL {}: {}", webhook_url, e))?;

    let http = reqwest::Client::builder()
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base })
  }

  fn endpoint(&self, method: &str) -> Result<Url> {
    let method = method.trim_start_matches('/');
    let path = if method.ends_with(".json") {
      method.to_string()
    } else {
      format!("{}.json", method)
    };
    self
      .base
      .join(&path)
      .map_err(|e| eyre!("Invalid CRM method {}: {}", method, e))
  }
}

impl CrmApi for CrmClient {
  async fn call(&self, method: &str, params: &Value) -> Result<ApiResponse> {
    let url = self.endpoint(method)?;

    let response = self
      .http
      .post(url)
      .json(params)
      .send()
      .await
      .map_err(|e| eyre!("Failed to call {}: {}", method, e))?;

    let status = response.status();
    let body: ApiResponse = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} response ({}): {}", method, status, e))?;

    if let Some(message) = body.error_message() {
      return Err(eyre!("{} failed ({}): {}", method, status, message));
    }

    Ok(body)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn client(url: &str) -> CrmClient {
    let config = Config::with_webhook_url(url);
    CrmClient::new(&config).unwrap()
  }

  #[test]
  fn test_endpoint_appends_method() {
    let c = client("https://crm.example.com/rest/1/secret");
    assert_eq!(
      c.endpoint("crm.item.list").unwrap().as_str(),
      "https://crm.example.com/rest/1/secret/crm.item.list.json"
    );
  }

  #[test]
  fn test_endpoint_accepts_leading_slash_and_suffix() {
    let c = client("https://crm.example.com/rest/1/secret/");
    assert_eq!(
      c.endpoint("/crm.deal.list.json").unwrap().as_str(),
      "https://crm.example.com/rest/1/secret/crm.deal.list.json"
    );
  }

  #[test]
  fn test_invalid_webhook_url() {
    let config = Config::with_webhook_url("not a url");
    assert!(CrmClient::new(&config).is_err());
  }
}
