use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub crm: CrmConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub notify: NotifyConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrmConfig {
  /// Inbound webhook base URL, e.g. https://example.bitrix24.ru/rest/1/<token>
  pub webhook_url: Option<String>,
  /// Records requested per page
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  /// Maximum IDs sent in a single filter
  #[serde(default = "default_chunk_size")]
  pub id_chunk_size: usize,
}

impl Default for CrmConfig {
  fn default() -> Self {
    Self {
      webhook_url: None,
      page_size: default_page_size(),
      id_chunk_size: default_chunk_size(),
    }
  }
}

fn default_page_size() -> u32 {
  50
}

fn default_chunk_size() -> usize {
  50
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_snapshot_path")]
  pub snapshot_path: PathBuf,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      snapshot_path: default_snapshot_path(),
    }
  }
}

fn default_snapshot_path() -> PathBuf {
  PathBuf::from("bitrix_cache.json")
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
  /// Webhook receiving `{delivery_id, driver_id}` for newly ready deliveries
  pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Also write daily-rotated log files here
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Read the YAML config, then layer environment variables on top.
  ///
  /// An explicit path must exist. Otherwise the first existing of
  /// `delivery-cache.yaml` in the working directory and
  /// `<user config dir>/delivery-cache/config.yaml` is read. With neither,
  /// built-in defaults apply and the CRM URL has to come from the
  /// environment.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let config = match explicit_path {
      Some(p) if !p.exists() => return Err(eyre!("Config file not found: {}", p.display())),
      Some(p) => Self::read_file(p)?,
      None => match Self::discover() {
        Some(p) => Self::read_file(&p)?,
        None => Config::default(),
      },
    };

    Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
  }

  fn discover() -> Option<PathBuf> {
    let user_file = dirs::config_dir().map(|dir| dir.join("delivery-cache").join("config.yaml"));
    std::iter::once(PathBuf::from("delivery-cache.yaml"))
      .chain(user_file)
      .find(|candidate| candidate.exists())
  }

  fn read_file(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Cannot read config {}: {}", path.display(), e))?;

    serde_yaml::from_str(&contents).map_err(|e| eyre!("Invalid config {}: {}", path.display(), e))
  }

  /// Apply BITRIX_WEBHOOK_URL, BITRIX_CACHE_FILE and DELIVERY_NOTIFY_URL.
  fn with_env_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
    let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = non_empty("BITRIX_WEBHOOK_URL") {
      self.crm.webhook_url = Some(url);
    }
    if let Some(path) = non_empty("BITRIX_CACHE_FILE") {
      self.cache.snapshot_path = PathBuf::from(path);
    }
    if let Some(url) = non_empty("DELIVERY_NOTIFY_URL") {
      self.notify.webhook_url = Some(url);
    }
    self
  }

  /// The CRM webhook URL, required for any remote call.
  pub fn crm_webhook_url(&self) -> Result<&str> {
    self
      .crm
      .webhook_url
      .as_deref()
      .filter(|u| !u.trim().is_empty())
      .ok_or_else(|| {
        eyre!("CRM webhook URL not set. Set crm.webhook_url or the BITRIX_WEBHOOK_URL environment variable.")
      })
  }

  #[cfg(test)]
  pub fn with_webhook_url(url: &str) -> Self {
    let mut config = Config::default();
    config.crm.webhook_url = Some(url.to_string());
    config
  }
}
